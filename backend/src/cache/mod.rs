//! A write-through read cache for slow backends.
//!
//! A capped Misra–Gries heavy-hitters summary decides *which* keys earn a
//! cache slot (a key read fewer than `min_hits` times never does); an LRU
//! of `cache_size` entries bounds how many hold one. Cached objects are
//! copied wholesale into a fast local backend and byte ranges are served
//! from there. The cache is never a source of truth: all state, including
//! the persisted admission counters, is disposable.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, instrument, warn};

use crate::{Backend, Error, ObjectReader};

mod misra_gries;

use misra_gries::CappedMisraGries;

/// Wraps a slow `persistent` backend with a fast `cache` backend.
pub struct Cache {
    persistent: Arc<dyn Backend>,
    cache: Arc<dyn Backend>,
    state: Arc<Mutex<State>>,
    state_path: Option<PathBuf>,
}

struct State {
    summary: CappedMisraGries,
    lru: LruCache<String, ()>,
    open_handles: HashMap<String, usize>,
    cached: HashSet<String>,
}

impl State {
    /// A key may leave the cache backend only when nothing reads it, the
    /// LRU no longer wants it, and it is actually resident.
    fn evictable(&self, key: &str) -> bool {
        self.open_handles.get(key).copied().unwrap_or(0) == 0
            && !self.lru.contains(key)
            && self.cached.contains(key)
    }

    /// Marks `key` non-resident if evictable. Returns whether the cache
    /// backend object should be deleted.
    fn take_evictable(&mut self, key: &str) -> bool {
        if self.evictable(key) {
            self.cached.remove(key);
            true
        } else {
            false
        }
    }
}

/// On-disk snapshot of the admission state, reloaded on open. Corrupt or
/// missing files are ignored.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    counters: Vec<(String, usize)>,
    /// most recently used first
    lru: Vec<String>,
}

impl Cache {
    pub async fn new(
        persistent: Arc<dyn Backend>,
        cache: Arc<dyn Backend>,
        cache_size: usize,
        min_hits: usize,
        state_path: Option<PathBuf>,
    ) -> Result<Self, Error> {
        let capacity = NonZeroUsize::new(cache_size)
            .ok_or_else(|| Error::Storage("invalid cache size".to_string()))?;
        let mut state = State {
            summary: CappedMisraGries::new(cache_size, min_hits)?,
            lru: LruCache::new(capacity),
            open_handles: HashMap::new(),
            cached: HashSet::new(),
        };

        // Adopt whatever the cache backend already holds, evicting down
        // to capacity.
        let mut stale = Vec::new();
        let resident: Vec<String> = cache.list("").try_collect().await?;
        for key in resident {
            state.cached.insert(key.clone());
            if let Some((evicted, ())) = state.lru.push(key, ()) {
                if state.take_evictable(&evicted) {
                    stale.push(evicted);
                }
            }
        }
        for key in stale {
            cache.delete(&key).await?;
        }

        if let Some(path) = &state_path {
            match std::fs::read(path) {
                Ok(raw) => match serde_json::from_slice::<PersistedState>(&raw) {
                    Ok(persisted) => {
                        for (key, count) in persisted.counters {
                            state.summary.restore(key, count);
                        }
                        for key in persisted.lru.into_iter().rev() {
                            if state.cached.contains(&key) {
                                state.lru.push(key, ());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e,
                            "ignoring corrupt cache state file");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e,
                        "ignoring unreadable cache state file");
                }
            }
        }

        Ok(Self {
            persistent,
            cache,
            state: Arc::new(Mutex::new(state)),
            state_path,
        })
    }

    async fn fill(&self, path: &str) -> Result<(), Error> {
        debug!(%path, "copying object into cache");
        let mut whole = self.persistent.get(path, 0, None).await?;
        self.cache.put(path, &mut whole).await?;
        self.state.lock().cached.insert(path.to_string());
        Ok(())
    }
}

#[async_trait]
impl Backend for Cache {
    #[instrument(skip(self), err)]
    async fn get(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, Error> {
        let (evict, wants_fill, resident) = {
            let mut state = self.state.lock();
            let mut evict = None;
            if state.summary.observe(path) {
                if let Some((evicted, ())) = state.lru.push(path.to_string(), ()) {
                    if evicted != path && state.take_evictable(&evicted) {
                        evict = Some(evicted);
                    }
                }
            }
            let wants_fill = state.lru.contains(path) && !state.cached.contains(path);
            let resident = state.cached.contains(path);
            (evict, wants_fill, resident)
        };

        if let Some(key) = evict {
            self.cache.delete(&key).await?;
        }

        if wants_fill {
            self.fill(path).await?;
        } else if !resident {
            return self.persistent.get(path, offset, length).await;
        }

        let reader = self.cache.get(path, offset, length).await?;
        {
            let mut state = self.state.lock();
            *state.open_handles.entry(path.to_string()).or_insert(0) += 1;
        }
        Ok(Box::new(Handle {
            inner: reader,
            key: path.to_string(),
            state: self.state.clone(),
            cache: self.cache.clone(),
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Error> {
        // Blobs are written once and only earn cache residency if read
        // repeatedly afterwards, so puts go straight through.
        self.persistent.put(path, data).await
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, path: &str) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            state.summary.delete(path);
            state.lru.pop(path);
            state.cached.remove(path);
        }
        let cache_result = self.cache.delete(path).await;
        self.persistent.delete(path).await?;
        cache_result
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, Error>> {
        self.persistent.list(prefix)
    }

    async fn close(&self) -> Result<(), Error> {
        if let Some(path) = &self.state_path {
            let persisted = {
                let state = self.state.lock();
                PersistedState {
                    counters: state
                        .summary
                        .counters()
                        .map(|(key, count)| (key.clone(), *count))
                        .collect(),
                    lru: state.lru.iter().map(|(key, ())| key.clone()).collect(),
                }
            };
            let encoded =
                serde_json::to_vec(&persisted).map_err(|e| Error::storage("cache", e))?;
            if let Err(e) = tokio::fs::write(path, encoded).await {
                warn!(path = %path.display(), error = %e,
                    "failed persisting cache state");
            }
        }
        self.persistent.close().await?;
        self.cache.close().await
    }
}

/// A cache-served reader. Dropping it releases the key's handle count
/// and, if the LRU has since moved on, deletes the cached copy.
struct Handle {
    inner: ObjectReader,
    key: String,
    state: Arc<Mutex<State>>,
    cache: Arc<dyn Backend>,
}

impl AsyncRead for Handle {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let should_delete = {
            let mut state = self.state.lock();
            match state.open_handles.get_mut(&self.key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                _ => {
                    state.open_handles.remove(&self.key);
                    state.take_evictable(&self.key)
                }
            }
        };
        if should_delete {
            let cache = self.cache.clone();
            let key = std::mem::take(&mut self.key);
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    if let Err(e) = cache.delete(&key).await {
                        warn!(%key, error = %e, "failed evicting cached object");
                    }
                });
            }
        }
    }
}
