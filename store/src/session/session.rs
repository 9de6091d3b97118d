use std::collections::HashSet;
use std::io::{Cursor, SeekFrom};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jam_backend::Backend;
use regex::Regex;
use tokio::io::AsyncSeekExt;
use tracing::{debug, instrument};

use super::manager::manifest_key;
use super::{FileSource, SharedBlobStore, SharedHashDb};
use crate::digests::ContentHash;
use crate::hashing::{hash_reader, HashConfirmReader};
use crate::{pathdb, proto, Error};

/// An in-progress set of path database mutations, forked from the
/// latest snapshot. Nothing is visible to readers until [Session::commit]
/// writes a manifest; closing a session without committing abandons it.
pub struct Session {
    backend: Arc<dyn Backend>,
    paths: pathdb::Db,
    blobs: SharedBlobStore,
    hashes: SharedHashDb,
    /// hashes enqueued with the blob store but not yet announced to the
    /// hash database
    in_flight: Arc<parking_lot::Mutex<HashSet<ContentHash>>>,
    /// newest manifest in the archive, for timestamp monotonicity
    latest: Option<DateTime<Utc>>,
}

impl Session {
    pub(super) fn new(
        backend: Arc<dyn Backend>,
        paths: pathdb::Db,
        blobs: SharedBlobStore,
        hashes: SharedHashDb,
        latest: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            backend,
            paths,
            blobs,
            hashes,
            in_flight: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            latest,
        }
    }

    /// Records `path` as a file with the given metadata and content.
    ///
    /// The reader is drained once up front to compute the content hash;
    /// already-known content is dropped on the spot and only the path
    /// entry is recorded. Unknown content is re-read during packing
    /// through a verifying adapter, so a file mutating underneath us
    /// fails the flush instead of corrupting the archive.
    #[instrument(skip(self, data), err)]
    pub async fn put_file(
        &mut self,
        path: &str,
        creation: DateTime<Utc>,
        modified: DateTime<Utc>,
        mode: u32,
        mut data: Box<dyn FileSource>,
    ) -> Result<(), Error> {
        if path.ends_with('/') {
            return Err(Error::Input(format!(
                "file paths cannot end with a '/': {:?}",
                path
            )));
        }

        let start = data.seek(SeekFrom::Current(0)).await?;
        let (hash, size) = hash_reader(&mut *data).await?;
        data.seek(SeekFrom::Start(start)).await?;

        let content = proto::Content {
            metadata: Some(metadata(
                proto::metadata::Type::File,
                creation,
                modified,
                mode,
                String::new(),
            )),
            data: None,
            hash: hash.to_bytes(),
        };

        let known = self.hashes.lock().await.has(&hash) || self.in_flight.lock().contains(&hash);
        if !known {
            self.in_flight.lock().insert(hash);

            let hashes = self.hashes.clone();
            let in_flight = self.in_flight.clone();
            let callback = Box::new(move |stream: proto::Stream, last_of_blob: bool| {
                let hashes = hashes.clone();
                let in_flight = in_flight.clone();
                Box::pin(async move {
                    let mut db = hashes.lock().await;
                    db.put(hash, stream);
                    in_flight.lock().remove(&hash);
                    if last_of_blob {
                        // checkpoint the hashes covered by the blob that
                        // just became durable
                        db.flush().await?;
                    }
                    Ok(())
                }) as futures::future::BoxFuture<'static, Result<(), Error>>
            });

            let verified = HashConfirmReader::new(Box::new(data), hash);
            self.blobs
                .lock()
                .await
                .put(Box::new(verified), (parent_dir(path), size), callback)
                .await?;
        }

        self.paths.put(path, content);
        Ok(())
    }

    /// Records `path` as a symlink to `target`. Symlinks carry no
    /// content hash.
    #[instrument(skip(self), err)]
    pub async fn put_symlink(
        &mut self,
        path: &str,
        creation: DateTime<Utc>,
        modified: DateTime<Utc>,
        mode: u32,
        target: &str,
    ) -> Result<(), Error> {
        if path.ends_with('/') {
            return Err(Error::Input(format!(
                "file paths cannot end with a '/': {:?}",
                path
            )));
        }
        let content = proto::Content {
            metadata: Some(metadata(
                proto::metadata::Type::Symlink,
                creation,
                modified,
                mode,
                target.to_string(),
            )),
            data: None,
            hash: bytes::Bytes::new(),
        };
        self.paths.put(path, content);
        Ok(())
    }

    pub fn delete(&mut self, path: &str) -> bool {
        self.paths.delete(path)
    }

    /// Deletes every path matching `re`, returning the count.
    pub fn delete_all(&mut self, re: &Regex) -> usize {
        self.paths.delete_all(|path| re.is_match(path))
    }

    /// Renames paths using [Regex::replace_all] semantics.
    pub fn rename(&mut self, re: &Regex, replacement: &str) -> usize {
        self.paths.rename(re, replacement)
    }

    /// Packs staged content into blobs and checkpoints the hash
    /// database. Path mutations stay uncommitted.
    #[instrument(skip(self), err)]
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.blobs.lock().await.flush().await?;
        self.hashes.lock().await.flush().await
    }

    /// Flushes and, if the path database changed, writes it as a new
    /// manifest. The manifest timestamp is strictly newer than every
    /// existing one, even against a stalled clock. Returns the new
    /// snapshot's timestamp, or `None` when there was nothing to commit.
    #[instrument(skip(self), err)]
    pub async fn commit(&mut self) -> Result<Option<DateTime<Utc>>, Error> {
        self.flush().await?;
        if !self.paths.changed() {
            debug!("nothing changed, skipping commit");
            return Ok(None);
        }

        let mut timestamp = Utc::now();
        if let Some(latest) = self.latest {
            if timestamp <= latest {
                timestamp = latest + Duration::nanoseconds(1);
            }
        }

        let document = self.paths.serialize()?;
        self.backend
            .put(&manifest_key(&timestamp), &mut Cursor::new(document))
            .await?;
        self.paths.mark_clean();
        self.latest = Some(timestamp);
        Ok(Some(timestamp))
    }

    /// Releases the session without committing.
    pub fn close(self) {}
}

fn parent_dir(path: &str) -> String {
    path.rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default()
}

fn metadata(
    kind: proto::metadata::Type,
    creation: DateTime<Utc>,
    modified: DateTime<Utc>,
    mode: u32,
    link_target: String,
) -> proto::Metadata {
    proto::Metadata {
        r#type: kind as i32,
        creation: Some(to_timestamp(creation)),
        modified: Some(to_timestamp(modified)),
        mode,
        link_target,
    }
}

fn to_timestamp(when: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: when.timestamp(),
        nanos: when.timestamp_subsec_nanos() as i32,
    }
}
