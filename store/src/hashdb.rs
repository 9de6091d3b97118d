//! The content-addressed hash database: SHA-256 of a file's bytes to the
//! [proto::Stream] holding those bytes.
//!
//! On disk the database is a set of *hashsets* under `hash/`, each a
//! framed, compressed document of hash → stream entries. Sessions append
//! new hashsets incrementally; [Db::coalesce] and [Db::split] rewrite the
//! partitioning when fragmentation or read locality call for it.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use jam_backend::{list_sorted, Backend};
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, warn};

use crate::digests::ContentHash;
use crate::ids::{random_sharded_key, HASH_PREFIX};
use crate::{framing, proto, Error};

/// Hashsets at or under this serialized size get the `.hs` suffix.
pub const SMALL_HASHSET_MAX: usize = 64 * 1024;
pub const SMALL_HASHSET_SUFFIX: &str = ".hs";

pub struct Db {
    backend: Arc<dyn Backend>,
    existing: HashMap<ContentHash, proto::Stream>,
    pending: HashMap<ContentHash, proto::Stream>,
    /// which hashset each existing hash was loaded from or flushed to
    source: HashMap<ContentHash, String>,
    /// every hashset key we know about
    hashset_keys: Vec<String>,
}

impl Db {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            existing: HashMap::new(),
            pending: HashMap::new(),
            source: HashMap::new(),
            hashset_keys: Vec::new(),
        }
    }

    /// Loads every hashset under `hash/`.
    #[instrument(skip(backend), err)]
    pub async fn open(backend: Arc<dyn Backend>) -> Result<Self, Error> {
        let mut db = Self::new(backend);
        for key in list_sorted(db.backend.as_ref(), HASH_PREFIX).await? {
            db.load_hashset(&key).await?;
        }
        Ok(db)
    }

    async fn load_hashset(&mut self, key: &str) -> Result<(), Error> {
        let mut raw = Vec::new();
        self.backend
            .get(key, 0, None)
            .await?
            .read_to_end(&mut raw)
            .await?;
        let payload = framing::open_document(&raw)
            .map_err(|e| Error::Integrity(format!("hashset {}: {}", key, e)))?;

        let mut cursor = &payload[..];
        while let Some(set) = proto::unmarshal_sized::<proto::HashSet>(&mut cursor)
            .map_err(|e| Error::Integrity(format!("hashset {}: {}", key, e)))?
        {
            for entry in set.hashes {
                let hash = ContentHash::try_from(entry.hash.as_ref())
                    .map_err(|e| Error::Integrity(format!("hashset {}: {}", key, e)))?;
                let stream = entry.data.unwrap_or_default();
                if let Some(previous) = self.existing.insert(hash, stream) {
                    warn!(%hash, %key, previous_len = previous.length(),
                        "hash present in more than one hashset");
                }
                self.source.insert(hash, key.to_string());
            }
        }
        self.hashset_keys.push(key.to_string());
        Ok(())
    }

    pub fn lookup(&self, hash: &ContentHash) -> Option<&proto::Stream> {
        self.existing.get(hash).or_else(|| self.pending.get(hash))
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.lookup(hash).is_some()
    }

    /// Records a new hash → stream mapping, pending until the next
    /// flush.
    pub fn put(&mut self, hash: ContentHash, stream: proto::Stream) {
        self.pending.insert(hash, stream);
    }

    /// Visits every known mapping: `(hash, originating hashset key if
    /// already durable, stream)`.
    pub fn iterate(
        &self,
        mut visit: impl FnMut(&ContentHash, Option<&str>, &proto::Stream) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for (hash, stream) in &self.existing {
            visit(hash, self.source.get(hash).map(String::as_str), stream)?;
        }
        for (hash, stream) in &self.pending {
            visit(hash, None, stream)?;
        }
        Ok(())
    }

    /// Serializes a group of mappings into a fresh hashset object and
    /// returns its key.
    async fn write_hashset(
        &self,
        entries: impl Iterator<Item = (&ContentHash, &proto::Stream)>,
    ) -> Result<String, Error> {
        let set = proto::HashSet {
            hashes: entries
                .map(|(hash, stream)| proto::HashedData {
                    hash: hash.to_bytes(),
                    data: Some(stream.clone()),
                })
                .collect(),
        };
        let document = framing::seal_document(&proto::marshal_sized(&set))?;

        let mut key = random_sharded_key(HASH_PREFIX);
        if document.len() <= SMALL_HASHSET_MAX {
            key.push_str(SMALL_HASHSET_SUFFIX);
        }
        self.backend
            .put(&key, &mut Cursor::new(document))
            .await?;
        Ok(key)
    }

    /// Writes all pending mappings out as one new hashset.
    #[instrument(skip(self), fields(pending = self.pending.len()), err)]
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let key = self.write_hashset(self.pending.iter()).await?;
        for (hash, stream) in self.pending.drain() {
            self.existing.insert(hash, stream);
            self.source.insert(hash, key.clone());
        }
        self.hashset_keys.push(key);
        Ok(())
    }

    /// Rewrites the entire database as a single hashset and deletes the
    /// old ones. Run occasionally to undo the fragmentation of many
    /// incremental flushes.
    #[instrument(skip(self), err)]
    pub async fn coalesce(&mut self) -> Result<(), Error> {
        self.flush().await?;
        let key = self.write_hashset(self.existing.iter()).await?;
        info!(hashes = self.existing.len(), "wrote coalesced hashset, deleting old hashsets");

        let deleted = self.delete_hashsets(&[key.clone()]).await?;
        info!(deleted, "deleted old hashsets");

        self.hashset_keys = vec![key.clone()];
        for source in self.source.values_mut() {
            *source = key.clone();
        }
        Ok(())
    }

    /// Regroups the database so each hashset holds the hashes whose
    /// stream was last written to the same blob, then deletes the old
    /// hashsets. Co-locates hashset reads with blob reads.
    #[instrument(skip(self), err)]
    pub async fn split(&mut self) -> Result<(), Error> {
        self.flush().await?;

        let mut by_blob: HashMap<Option<crate::BlobId>, Vec<ContentHash>> = HashMap::new();
        for (hash, stream) in &self.existing {
            let blob = match stream.ranges.last() {
                Some(range) => Some(range.blob()?),
                None => None,
            };
            by_blob.entry(blob).or_default().push(*hash);
        }
        info!(groups = by_blob.len(), "categorized hashes by last blob");
        if let Some(empty) = by_blob.get(&None) {
            info!(count = empty.len(), "found zero-length hashes");
        }

        let mut new_keys = Vec::with_capacity(by_blob.len());
        let mut new_source = HashMap::with_capacity(self.source.len());
        for (_, hashes) in by_blob {
            let key = self
                .write_hashset(
                    hashes
                        .iter()
                        .map(|hash| (hash, &self.existing[hash])),
                )
                .await?;
            for hash in hashes {
                new_source.insert(hash, key.clone());
            }
            new_keys.push(key);
        }

        let deleted = self.delete_hashsets(&new_keys).await?;
        info!(deleted, "deleted old hashsets");

        self.hashset_keys = new_keys;
        self.source = new_source;
        Ok(())
    }

    /// Deletes every known hashset except those in `keep`. Returns how
    /// many were removed.
    async fn delete_hashsets(&self, keep: &[String]) -> Result<usize, Error> {
        let mut deleted = 0;
        for key in &self.hashset_keys {
            if keep.contains(key) {
                continue;
            }
            self.backend.delete(key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jam_backend::{list_sorted, Backend, MemoryBackend};

    use super::{Db, SMALL_HASHSET_SUFFIX};
    use crate::digests::ContentHash;
    use crate::ids::BlobId;
    use crate::proto;

    fn stream_for(blob: &BlobId, offset: u64, length: u64) -> proto::Stream {
        proto::Stream {
            ranges: vec![proto::Range::new(blob, offset, length)],
        }
    }

    #[tokio::test]
    async fn flush_and_reload() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let blob = BlobId::generate();
        let hash_a = ContentHash::of(b"a");
        let hash_b = ContentHash::of(b"b");

        let mut db = Db::open(backend.clone()).await.unwrap();
        assert!(!db.has(&hash_a));
        db.put(hash_a, stream_for(&blob, 0, 1));
        db.put(hash_b, stream_for(&blob, 1, 1));
        // pending entries are visible before the flush
        assert!(db.has(&hash_a));
        db.flush().await.unwrap();

        // a small hashset gets the small suffix
        let keys = list_sorted(backend.as_ref(), "hash/").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with(SMALL_HASHSET_SUFFIX));

        let reloaded = Db::open(backend.clone()).await.unwrap();
        assert_eq!(
            reloaded.lookup(&hash_a),
            Some(&stream_for(&blob, 0, 1))
        );
        assert_eq!(
            reloaded.lookup(&hash_b),
            Some(&stream_for(&blob, 1, 1))
        );
        assert!(!reloaded.has(&ContentHash::of(b"c")));
    }

    #[tokio::test]
    async fn flush_without_pending_writes_nothing() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let mut db = Db::open(backend.clone()).await.unwrap();
        db.flush().await.unwrap();
        assert!(list_sorted(backend.as_ref(), "hash/")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn coalesce_leaves_one_hashset() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let blob = BlobId::generate();
        let mut db = Db::open(backend.clone()).await.unwrap();

        // three incremental flushes, three hashsets
        for i in 0..3u64 {
            db.put(
                ContentHash::of(&i.to_be_bytes()),
                stream_for(&blob, i, 1),
            );
            db.flush().await.unwrap();
        }
        assert_eq!(list_sorted(backend.as_ref(), "hash/").await.unwrap().len(), 3);

        db.coalesce().await.unwrap();
        assert_eq!(list_sorted(backend.as_ref(), "hash/").await.unwrap().len(), 1);

        // everything survives the rewrite
        let reloaded = Db::open(backend).await.unwrap();
        for i in 0..3u64 {
            assert!(reloaded.has(&ContentHash::of(&i.to_be_bytes())));
        }
    }

    #[tokio::test]
    async fn split_groups_by_last_blob() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let blob_a = BlobId::generate();
        let blob_b = BlobId::generate();
        let mut db = Db::open(backend.clone()).await.unwrap();

        for i in 0..4u64 {
            let blob = if i % 2 == 0 { &blob_a } else { &blob_b };
            db.put(ContentHash::of(&i.to_be_bytes()), stream_for(blob, i, 1));
        }
        // plus one zero-length stream
        let empty_hash = ContentHash::of(b"");
        db.put(empty_hash, proto::Stream::default());
        db.flush().await.unwrap();
        assert_eq!(list_sorted(backend.as_ref(), "hash/").await.unwrap().len(), 1);

        db.split().await.unwrap();
        // one hashset per last-blob group: blob_a, blob_b, and empty
        assert_eq!(list_sorted(backend.as_ref(), "hash/").await.unwrap().len(), 3);

        let reloaded = Db::open(backend).await.unwrap();
        for i in 0..4u64 {
            assert!(reloaded.has(&ContentHash::of(&i.to_be_bytes())));
        }
        assert!(reloaded.has(&empty_hash));
    }

    #[tokio::test]
    async fn legacy_hash_width_normalizes_on_load() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let blob = BlobId::generate();
        let hash = ContentHash::of(b"legacy");

        // hand-write a hashset holding the 64-byte legacy form
        let mut wide = vec![0x55u8; 32];
        wide.extend_from_slice(hash.as_slice());
        let set = proto::HashSet {
            hashes: vec![proto::HashedData {
                hash: wide.into(),
                data: Some(stream_for(&blob, 0, 9)),
            }],
        };
        let doc = crate::framing::seal_document(&proto::marshal_sized(&set)).unwrap();
        backend
            .put("hash/xx/legacy", &mut std::io::Cursor::new(doc))
            .await
            .unwrap();

        let db = Db::open(backend).await.unwrap();
        assert_eq!(db.lookup(&hash), Some(&stream_for(&blob, 0, 9)));
    }
}
