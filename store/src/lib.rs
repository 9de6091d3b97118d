//! The jam storage engine: immutable, content-addressed, encrypted
//! snapshots over any [jam_backend::Backend].
//!
//! Ingestion flows file readers through a hash pre-pass, packs unknown
//! content into ~60 MiB blobs, records hash → range mappings in the hash
//! database, and serializes the path database into one manifest object
//! per committed snapshot. Reads go the other way: manifest → path
//! database → hash database → stream of blob ranges, all through the
//! transparent encryption wrapper.

use thiserror::Error as ThisError;

pub mod blobs;
pub mod digests;
pub mod enc;
pub mod framing;
pub mod hashdb;
mod hashing;
pub mod ids;
pub mod keys;
pub mod pathdb;
pub mod proto;
pub mod session;
pub mod streams;

pub use digests::ContentHash;
pub use ids::BlobId;
pub use session::{Manager, Session, Snapshot};

/// The engine's error taxonomy. `NotFound` stays distinguishable through
/// every layer so callers can branch on [Error::is_not_found].
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// Corrupt or inconsistent stored data: failed decryption, framing
    /// damage, dangling hashes.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The caller handed us something malformed.
    #[error("invalid input: {0}")]
    Input(String),

    /// A valid request that the archive's current state refuses.
    #[error("{0}")]
    State(String),

    #[error(transparent)]
    Backend(#[from] jam_backend::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Backend(e) => e.is_not_found(),
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound(msg) => std::io::Error::new(std::io::ErrorKind::NotFound, msg),
            Error::Integrity(msg) => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
            }
            Error::Input(msg) => std::io::Error::new(std::io::ErrorKind::InvalidInput, msg),
            Error::State(msg) => std::io::Error::other(msg),
            Error::Backend(e) => e.into(),
            Error::Io(e) => e,
        }
    }
}
