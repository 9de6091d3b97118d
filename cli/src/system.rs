//! Shared flags and the wiring from them to a [Manager].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use clap::Args;
use jam_backend::cache::Cache;
use jam_backend::{from_addrs, Backend};
use jam_store::enc::{EncryptedBackend, HmacKeyGenerator, XChaChaCodec, DEFAULT_BLOCK_SIZE};
use jam_store::{blobs, keys, Manager, Snapshot};

fn jam_dir(leaf: &str) -> String {
    let home = dirs::home_dir().expect("no home directory found");
    url::Url::from_file_path(home.join(".jam").join(leaf))
        .expect("home directory is absolute")
        .to_string()
}

fn default_store() -> String {
    jam_dir("storage")
}

fn default_cache() -> String {
    jam_dir("cache")
}

#[derive(Args)]
pub struct SysOpts {
    /// where to store data; supports file://, s3://, sftp:// and
    /// friends, comma-separated to write to many at once
    #[arg(long, env = "JAM_STORE", default_value_t = default_store())]
    pub store: String,

    /// encryption key: 32 bytes hex-encoded, or the lock-… form (will
    /// prompt for the passphrase)
    #[arg(long, env = "JAM_KEY")]
    pub key: Option<String>,

    /// where to cache blobs that are frequently read
    #[arg(long, env = "JAM_CACHE", default_value_t = default_cache())]
    pub cache: String,

    /// how many blobs to cache (0 disables caching)
    #[arg(long, default_value_t = 10)]
    pub cache_size: usize,

    /// minimum reads of a blob before considering it for caching
    #[arg(long, default_value_t = 5)]
    pub cache_min_hits: usize,

    /// target blob size in bytes
    #[arg(long, default_value_t = blobs::DEFAULT_BLOB_SIZE)]
    pub blob_size: u64,

    /// max number of objects to stage before flushing (must fit the
    /// file descriptor limit)
    #[arg(long, default_value_t = blobs::DEFAULT_MAX_UNFLUSHED)]
    pub max_unflushed: usize,

    /// encryption block size in bytes
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub enc_block_size: usize,
}

impl SysOpts {
    fn master_key(&self) -> anyhow::Result<[u8; keys::KEY_SIZE]> {
        let input = self
            .key
            .as_deref()
            .context("invalid configuration, no encryption key specified")?;
        Ok(keys::parse_key(input, || {
            prompt("input passphrase: ").map_err(jam_store::Error::Io)
        })?)
    }

    /// Builds the full backend stack: replicated stores, the read
    /// cache, and the encryption wrapper, then opens the archive.
    pub async fn manager(&self) -> anyhow::Result<Manager> {
        let key = self.master_key()?;

        let mut store: Arc<dyn Backend> = from_addrs(&self.store).await?;
        if self.cache_size > 0 {
            let cache_backend = from_addrs(&self.cache).await?;
            store = Arc::new(
                Cache::new(
                    store,
                    cache_backend,
                    self.cache_size,
                    self.cache_min_hits,
                    cache_state_path(),
                )
                .await?,
            );
        }

        let encrypted: Arc<dyn Backend> = Arc::new(EncryptedBackend::new(
            Arc::new(XChaChaCodec::new(self.enc_block_size)),
            Arc::new(HmacKeyGenerator::new(&key)),
            store,
        ));

        Ok(Manager::open(encrypted, self.blob_size, self.max_unflushed).await?)
    }
}

fn cache_state_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".jam").join("cache-state.json"))
}

/// Resolves a --snap flag: "latest" or a unix-nanosecond id.
pub fn parse_snap(selector: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
    if selector.is_empty() || selector == "latest" {
        return Ok(None);
    }
    let nanos: i64 = selector
        .parse()
        .with_context(|| format!("invalid snapshot value: {:?}", selector))?;
    Ok(Some(Utc.timestamp_nanos(nanos)))
}

pub async fn open_snapshot(
    manager: &Manager,
    selector: &str,
) -> anyhow::Result<(Snapshot, DateTime<Utc>)> {
    match parse_snap(selector)? {
        None => Ok(manager.latest_snapshot().await?),
        Some(timestamp) => Ok((manager.open_snapshot(timestamp).await?, timestamp)),
    }
}

pub fn prompt(message: &str) -> std::io::Result<String> {
    use std::io::Write;
    let mut stderr = std::io::stderr();
    stderr.write_all(message.as_bytes())?;
    stderr.flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches('\n').to_string())
}
