//! Object-storage backends for jam.
//!
//! A [Backend] is a deliberately tiny interface over an immutable object
//! store: objects are written once under a `/`-delimited key, never
//! rewritten, and read back with byte-range gets. Everything else in jam
//! (encryption, caching, replication) is built by wrapping one [Backend]
//! in another.

use std::io;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod cache;
mod combine;
mod from_addr;
mod fs;
mod memory;
mod s3;
mod sftp;

#[cfg(test)]
mod tests;

pub use self::combine::CombinedBackend;
pub use self::from_addr::{from_addr, from_addrs};
pub use self::fs::FilesystemBackend;
pub use self::memory::MemoryBackend;
pub use self::s3::ObjectStoreBackend;
pub use self::sftp::SftpBackend;

/// Errors produced by [Backend] implementations.
///
/// `NotFound` is deliberately its own variant: wrappers at every layer
/// preserve it so callers can keep asking [Error::is_not_found] no matter
/// how deeply a backend is nested.
#[derive(Debug, Error)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Wraps an arbitrary error with a tag naming the backend layer it
    /// came from, e.g. `storage("sftp", err)`.
    pub fn storage(layer: &str, err: impl std::fmt::Display) -> Self {
        Error::Storage(format!("{}: {}", layer, err))
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        if value.kind() == io::ErrorKind::NotFound {
            Error::NotFound(value.to_string())
        } else {
            Error::Storage(value.to_string())
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            Error::InvalidUrl(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            Error::Storage(msg) => io::Error::other(msg),
        }
    }
}

/// The reader handed back by [Backend::get]. Dropping it releases any
/// underlying resources.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// An immutable object store.
///
/// Keys are `/`-delimited strings containing no user data. An object, once
/// written, never changes; a deleted key is never reused. Implementations
/// only need these five operations, which keeps the set of usable storage
/// providers as large as possible.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns a reader over the object at `path`, starting at `offset`.
    /// `length` is a lower bound on the bytes the caller wants: `None`
    /// means "to the end", and the returned reader is allowed to yield
    /// *more* than `length` bytes. Callers truncate. `offset` must lie
    /// inside the object.
    async fn get(&self, path: &str, offset: u64, length: Option<u64>)
        -> Result<ObjectReader, Error>;

    /// Creates the object at `path` from `data`. The write is atomic: if
    /// `data` fails mid-stream no object becomes observable at `path`.
    /// `put` is not called for keys that already hold different content.
    async fn put(&self, path: &str, data: &mut (dyn AsyncRead + Send + Unpin))
        -> Result<(), Error>;

    /// Removes the object at `path`. Deleting a missing key succeeds.
    async fn delete(&self, path: &str) -> Result<(), Error>;

    /// Yields every key starting with `prefix`, recursively, in no
    /// particular order. `prefix` is either empty or ends with a `/`.
    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, Error>>;

    /// Releases any resources held by the backend.
    async fn close(&self) -> Result<(), Error>;
}

/// Collects a [Backend::list] into a sorted `Vec`. Backends make no
/// ordering promises, so anything that needs determinism (hashset loads,
/// snapshot enumeration) sorts client-side.
pub async fn list_sorted(backend: &dyn Backend, prefix: &str) -> Result<Vec<String>, Error> {
    let mut paths: Vec<String> = backend.list(prefix).try_collect().await?;
    paths.sort();
    Ok(paths)
}
