use std::sync::Arc;

use jam_backend::Backend;
use tracing::instrument;

use super::SharedHashDb;
use crate::digests::ContentHash;
use crate::{pathdb, proto, streams, Error};

/// A committed, immutable view of one manifest.
pub struct Snapshot {
    backend: Arc<dyn Backend>,
    paths: pathdb::Db,
    hashes: SharedHashDb,
}

/// One row of [Snapshot::list]: either a real path with metadata, or a
/// collapsed directory prefix.
pub struct ListEntry {
    pub path: String,
    pub prefix: bool,
    pub meta: Option<proto::Metadata>,
    pub hash: Option<ContentHash>,
}

impl Snapshot {
    pub(super) fn new(
        backend: Arc<dyn Backend>,
        paths: pathdb::Db,
        hashes: SharedHashDb,
    ) -> Self {
        Self {
            backend,
            paths,
            hashes,
        }
    }

    /// Opens `path`, returning its metadata and, for files, a seekable
    /// stream over its content. Symlinks return no stream.
    #[instrument(skip(self), err)]
    pub async fn open(
        &self,
        path: &str,
    ) -> Result<(proto::Metadata, Option<streams::Stream>), Error> {
        let content = self
            .paths
            .get(path)
            .ok_or_else(|| Error::NotFound(format!("file {:?}", path)))?;
        let meta = content.metadata.clone().unwrap_or_default();
        if meta.kind() != proto::metadata::Type::File {
            return Ok((meta, None));
        }

        let stream = if !content.hash.is_empty() {
            let hash = ContentHash::try_from(content.hash.as_ref())?;
            self.hashes
                .lock()
                .await
                .lookup(&hash)
                .cloned()
                .ok_or_else(|| {
                    Error::Integrity(format!("hash {} missing from hash database", hash))
                })?
        } else {
            // ancient manifests inlined the stream instead of a hash
            content.data.clone().unwrap_or_default()
        };
        Ok((
            meta,
            Some(streams::Stream::open(self.backend.clone(), &stream)),
        ))
    }

    /// Visits entries under `prefix` in path order; see
    /// [pathdb::Db::list] for the collapse behavior when not recursive.
    pub fn list(
        &self,
        prefix: &str,
        recursive: bool,
        mut visit: impl FnMut(ListEntry) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.paths.list(prefix, recursive, |path, content| {
            let entry = match content {
                None => ListEntry {
                    path: path.to_string(),
                    prefix: true,
                    meta: None,
                    hash: None,
                },
                Some(content) => ListEntry {
                    path: path.to_string(),
                    prefix: false,
                    meta: content.metadata.clone(),
                    hash: if content.hash.is_empty() {
                        None
                    } else {
                        Some(ContentHash::try_from(content.hash.as_ref())?)
                    },
                },
            };
            visit(entry)
        })
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.paths.has_prefix(prefix)
    }

    /// Number of paths in the snapshot.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
