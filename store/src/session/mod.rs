//! The transactional top level: sessions ingest, snapshots read, the
//! manager coordinates both against one archive.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncSeek};
use tokio::sync::Mutex;

use crate::{blobs, hashdb};

mod manager;
#[allow(clippy::module_inception)]
mod session;
mod snapshot;

pub use manager::{Manager, MANIFEST_PREFIX};
pub use session::Session;
pub use snapshot::{ListEntry, Snapshot};

/// What [Session::put_file] ingests: file content that can be read
/// twice, once for the hash pre-pass and once for packing.
pub trait FileSource: AsyncRead + AsyncSeek + Send + Unpin {}
impl<T: AsyncRead + AsyncSeek + Send + Unpin + ?Sized> FileSource for T {}

pub(crate) type SharedHashDb = Arc<Mutex<hashdb::Db>>;
pub(crate) type SharedBlobStore = Arc<Mutex<blobs::Store>>;
