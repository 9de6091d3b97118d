use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use jam_backend::{list_sorted, Backend};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use super::{Session, SharedBlobStore, SharedHashDb, Snapshot};
use crate::{blobs, hashdb, pathdb, Error};

pub const MANIFEST_PREFIX: &str = "manifests/";

const TIME_FORMAT: &str = "%Y/%m/%d/%H-%M-%S.%f";

pub(super) fn manifest_key(timestamp: &DateTime<Utc>) -> String {
    format!("{}{}", MANIFEST_PREFIX, timestamp.format(TIME_FORMAT))
}

fn manifest_timestamp(key: &str) -> Result<DateTime<Utc>, Error> {
    let encoded = key.strip_prefix(MANIFEST_PREFIX).ok_or_else(|| {
        Error::Integrity(format!(
            "backend had unexpected behavior: listed key does not start with {:?}: {:?}",
            MANIFEST_PREFIX, key
        ))
    })?;
    let naive = NaiveDateTime::parse_from_str(encoded, TIME_FORMAT)
        .map_err(|e| Error::Input(format!("invalid manifest key {:?}: {}", key, e)))?;
    Ok(naive.and_utc())
}

/// Coordinates sessions and snapshots against one archive. The hash
/// database and blob store are shared: content learned by one session
/// deduplicates the next.
pub struct Manager {
    backend: Arc<dyn Backend>,
    blobs: SharedBlobStore,
    hashes: SharedHashDb,
}

impl Manager {
    pub fn new(backend: Arc<dyn Backend>, blobs: blobs::Store, hashes: hashdb::Db) -> Self {
        Self {
            backend,
            blobs: Arc::new(Mutex::new(blobs)),
            hashes: Arc::new(Mutex::new(hashes)),
        }
    }

    /// Opens the archive behind `backend`: loads the hash database and
    /// wires up a blob store with the given packing parameters.
    pub async fn open(
        backend: Arc<dyn Backend>,
        blob_size: u64,
        max_unflushed: usize,
    ) -> Result<Self, Error> {
        let hashes = hashdb::Db::open(backend.clone()).await?;
        let blobs = blobs::Store::new(backend.clone(), blob_size, max_unflushed);
        Ok(Self::new(backend, blobs, hashes))
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    /// Rewrites the hash database as one hashset. See
    /// [hashdb::Db::coalesce].
    pub async fn coalesce_hashes(&self) -> Result<(), Error> {
        self.hashes.lock().await.coalesce().await
    }

    /// Regroups hashsets by blob. See [hashdb::Db::split].
    pub async fn split_hashes(&self) -> Result<(), Error> {
        self.hashes.lock().await.split().await
    }

    /// Visits every known hash mapping; used by integrity checking.
    pub async fn iterate_hashes(
        &self,
        visit: impl FnMut(
            &crate::ContentHash,
            Option<&str>,
            &crate::proto::Stream,
        ) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.hashes.lock().await.iterate(visit)
    }

    /// Snapshot timestamps, newest first. Keys that don't parse as
    /// manifest timestamps are logged and skipped.
    #[instrument(skip(self), err)]
    pub async fn list_snapshots(&self) -> Result<Vec<DateTime<Utc>>, Error> {
        let mut timestamps = Vec::new();
        for key in list_sorted(self.backend.as_ref(), MANIFEST_PREFIX).await? {
            match manifest_timestamp(&key) {
                Ok(timestamp) => timestamps.push(timestamp),
                Err(e) => warn!(%key, error = %e, "invalid manifest key, skipping"),
            }
        }
        timestamps.sort_by(|a, b| b.cmp(a));
        Ok(timestamps)
    }

    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, Error> {
        Ok(self.list_snapshots().await?.into_iter().next())
    }

    /// Opens the newest snapshot.
    pub async fn latest_snapshot(&self) -> Result<(Snapshot, DateTime<Utc>), Error> {
        let latest = self
            .latest_timestamp()
            .await?
            .ok_or_else(|| Error::State("no snapshots exist yet".to_string()))?;
        Ok((self.open_snapshot(latest).await?, latest))
    }

    async fn open_path_db(&self, timestamp: DateTime<Utc>) -> Result<pathdb::Db, Error> {
        let key = manifest_key(&timestamp);
        let mut document = Vec::new();
        self.backend
            .get(&key, 0, None)
            .await
            .map_err(|e| match e {
                e if e.is_not_found() => {
                    Error::NotFound(format!("snapshot {}", timestamp.timestamp_nanos_opt().unwrap_or_default()))
                }
                e => e.into(),
            })?
            .read_to_end(&mut document)
            .await?;
        pathdb::Db::load(self.backend.clone(), document).await
    }

    #[instrument(skip(self), err)]
    pub async fn open_snapshot(&self, timestamp: DateTime<Utc>) -> Result<Snapshot, Error> {
        let paths = self.open_path_db(timestamp).await?;
        Ok(Snapshot::new(
            self.backend.clone(),
            paths,
            self.hashes.clone(),
        ))
    }

    /// Starts a session forked from the latest snapshot (or empty when
    /// the archive has none).
    #[instrument(skip(self), err)]
    pub async fn new_session(&self) -> Result<Session, Error> {
        let latest = self.latest_timestamp().await?;
        let paths = match latest {
            Some(timestamp) => self.open_path_db(timestamp).await?,
            None => pathdb::Db::new(),
        };
        Ok(Session::new(
            self.backend.clone(),
            paths,
            self.blobs.clone(),
            self.hashes.clone(),
            latest,
        ))
    }

    /// Starts a session initialized from an *older* snapshot, so a
    /// subsequent commit produces a fresh current snapshot matching that
    /// old state.
    #[instrument(skip(self), err)]
    pub async fn revert_to(&self, timestamp: DateTime<Utc>) -> Result<Session, Error> {
        let latest = self.latest_timestamp().await?;
        let mut paths = self.open_path_db(timestamp).await?;
        paths.mark_changed();
        Ok(Session::new(
            self.backend.clone(),
            paths,
            self.blobs.clone(),
            self.hashes.clone(),
            latest,
        ))
    }

    /// Deletes an old snapshot. The newest snapshot anchors the
    /// archive's ordering and cannot be deleted.
    #[instrument(skip(self), err)]
    pub async fn delete_snapshot(&self, timestamp: DateTime<Utc>) -> Result<(), Error> {
        let latest = self
            .latest_timestamp()
            .await?
            .ok_or_else(|| Error::State("no snapshots exist yet".to_string()))?;
        if latest <= timestamp {
            return Err(Error::State("can't remove latest snapshot".to_string()));
        }
        self.backend.delete(&manifest_key(&timestamp)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{manifest_key, manifest_timestamp};

    #[test]
    fn manifest_key_roundtrip() {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 9, 17, 5, 59).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let key = manifest_key(&timestamp);
        assert_eq!(key, "manifests/2024/03/09/17-05-59.123456789");
        assert_eq!(manifest_timestamp(&key).unwrap(), timestamp);
    }

    #[test]
    fn rejects_foreign_keys() {
        assert!(manifest_timestamp("manifests/not-a-time").is_err());
        assert!(manifest_timestamp("blob/aa/bbb").is_err());
    }
}
