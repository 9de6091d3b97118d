//! Packing many small file readers into large blobs.
//!
//! Entries are staged until a flush, sorted by the caller's sort key so
//! related files pack near each other, concatenated, and sliced into
//! blob-size objects. After each blob is durably written, the callback
//! of every entry whose data completed inside it receives the entry's
//! exact byte ranges; the final callback of the batch is additionally
//! flagged so the caller can checkpoint per blob.

use std::sync::Arc;

use futures::future::BoxFuture;
use jam_backend::Backend;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument};

use crate::proto;
use crate::Error;

mod concat;

use concat::Concat;

pub const DEFAULT_BLOB_SIZE: u64 = 60 * 1024 * 1024;
pub const DEFAULT_MAX_UNFLUSHED: usize = 1000;

/// Invoked once an entry's bytes are durable: receives the entry's
/// [proto::Stream] and whether this callback closes out a blob.
pub type PackCallback =
    Box<dyn FnOnce(proto::Stream, bool) -> BoxFuture<'static, Result<(), Error>> + Send>;

pub(crate) struct PendingEntry {
    pub source: Box<dyn AsyncRead + Send + Unpin>,
    pub sort_key: (String, u64),
    pub callback: PackCallback,
}

/// Batches incoming readers and packs them into blobs on flush.
pub struct Store {
    backend: Arc<dyn Backend>,
    blob_size: u64,
    max_unflushed: usize,
    unflushed: Vec<PendingEntry>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>, blob_size: u64, max_unflushed: usize) -> Self {
        Self {
            backend,
            blob_size,
            max_unflushed,
            unflushed: Vec::new(),
        }
    }

    /// Stages `source` for packing. `sort_key` groups related entries
    /// (the session passes `(parent directory, size)`); `callback` runs
    /// after the entry's data is durable. Flushes automatically once too
    /// many entries are staged (each holds an open reader, and open file
    /// descriptors are finite).
    pub async fn put(
        &mut self,
        source: Box<dyn AsyncRead + Send + Unpin>,
        sort_key: (String, u64),
        callback: PackCallback,
    ) -> Result<(), Error> {
        self.unflushed.push(PendingEntry {
            source,
            sort_key,
            callback,
        });
        if self.unflushed.len() <= self.max_unflushed {
            return Ok(());
        }
        self.flush().await
    }

    /// Packs every staged entry into blobs. On any failure the blob in
    /// progress is abandoned (never observable, by the backend's put
    /// contract), remaining entries are dropped, and the error
    /// propagates; callbacks only ever run for durable data.
    #[instrument(skip(self), fields(entries = self.unflushed.len()), err)]
    pub async fn flush(&mut self) -> Result<(), Error> {
        let mut entries = std::mem::take(&mut self.unflushed);
        if entries.is_empty() {
            return Ok(());
        }
        entries.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));

        let mut concat = Concat::new(entries);
        while concat.fill_lookahead().await? {
            let blob = concat.blob();
            {
                let mut limited = (&mut concat).take(self.blob_size);
                self.backend.put(&blob.blob_path(), &mut limited).await?;
            }
            debug!(%blob, "blob written");
            concat.cut();

            let completed = concat.take_completed();
            let batch = completed.len();
            for (i, done) in completed.into_iter().enumerate() {
                (done.callback)(done.stream, i + 1 == batch).await?;
            }
        }

        // entries that contributed no bytes (empty files) still resolve
        for done in concat.take_completed() {
            (done.callback)(done.stream, false).await?;
        }
        Ok(())
    }

    /// Drops staged entries without packing them. Closing is not
    /// flushing.
    pub fn close(&mut self) {
        self.unflushed.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    use jam_backend::{list_sorted, Backend, MemoryBackend};

    use super::{PackCallback, Store};
    use crate::proto;
    use crate::streams;

    type Results = Arc<Mutex<Vec<(usize, proto::Stream, bool)>>>;

    fn recording_callback(results: &Results, idx: usize) -> PackCallback {
        let results = results.clone();
        Box::new(move |stream: proto::Stream, last_of_blob: bool| {
            let results = results.clone();
            Box::pin(async move {
                results.lock().push((idx, stream, last_of_blob));
                Ok(())
            }) as futures::future::BoxFuture<'static, Result<(), crate::Error>>
        })
    }

    fn pattern(idx: usize, len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i + idx * 31) % 251) as u8).collect()
    }

    async fn pack(
        backend: Arc<dyn Backend>,
        blob_size: u64,
        sizes: &[usize],
    ) -> (Results, Vec<Vec<u8>>) {
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let mut store = Store::new(backend, blob_size, 1000);
        let mut inputs = Vec::new();
        for (idx, &size) in sizes.iter().enumerate() {
            let data = pattern(idx, size);
            inputs.push(data.clone());
            store
                .put(
                    Box::new(std::io::Cursor::new(data)),
                    (String::new(), size as u64),
                    recording_callback(&results, idx),
                )
                .await
                .unwrap();
        }
        store.flush().await.unwrap();
        (results, inputs)
    }

    #[tokio::test]
    async fn ranges_cover_entries_exactly() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let sizes = [100usize, 5000, 0, 250, 12_000, 1];
        let (results, inputs) = pack(backend.clone(), 4096, &sizes).await;

        let results = results.lock();
        assert_eq!(results.len(), sizes.len());
        for (idx, stream, _) in results.iter() {
            assert_eq!(
                stream.length() as usize,
                sizes[*idx],
                "entry {} range lengths must cover its bytes",
                idx
            );
            // every range must fit inside its blob
            for range in &stream.ranges {
                let blob_path = range.blob().unwrap().blob_path();
                let mut blob_data = Vec::new();
                backend
                    .get(&blob_path, 0, None)
                    .await
                    .unwrap()
                    .read_to_end(&mut blob_data)
                    .await
                    .unwrap();
                assert!(
                    (range.offset + range.length) as usize <= blob_data.len(),
                    "range must not cross its blob's end"
                );
                assert!(blob_data.len() as u64 <= 4096, "blob exceeds target size");
            }
            // and the stream reads back the original bytes
            let mut reader =
                streams::Stream::open(backend.clone(), stream);
            let mut got = Vec::new();
            reader.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, inputs[*idx], "entry {} bytes", idx);
        }
    }

    #[tokio::test]
    async fn blob_count_matches_data_volume() {
        let backend = Arc::new(MemoryBackend::new());
        let sizes: Vec<usize> = std::iter::repeat(2048).take(64).collect(); // 128 KiB
        let (_, _) = pack(backend.clone(), 32 * 1024, &sizes).await;

        let blobs = list_sorted(backend.as_ref(), "blob/").await.unwrap();
        // 128 KiB at 32 KiB per blob
        assert_eq!(blobs.len(), 4);
    }

    #[tokio::test]
    async fn last_of_blob_flags_batches() {
        let backend = Arc::new(MemoryBackend::new());
        let (results, _) = pack(backend.clone(), 1024, &[800, 800, 800]).await;

        let results = results.lock();
        // the final callback after each durable blob carries the flag
        let flagged = results.iter().filter(|(_, _, last)| *last).count();
        let blobs = backend.len();
        assert!(flagged >= 1);
        assert!(flagged <= blobs);
        // the very last completion in the flush closes a blob
        assert!(results.last().unwrap().2);
    }

    #[tokio::test]
    async fn empty_entries_resolve_with_empty_streams() {
        let backend = Arc::new(MemoryBackend::new());
        let (results, _) = pack(backend.clone(), 1024, &[0, 0]).await;

        let results = results.lock();
        assert_eq!(results.len(), 2);
        for (_, stream, last) in results.iter() {
            assert!(stream.ranges.is_empty());
            assert!(!last);
        }
        // no bytes, no blobs
        assert_eq!(backend.len(), 0);
    }

    #[tokio::test]
    async fn entry_error_aborts_flush() {
        struct FailingReader;
        impl tokio::io::AsyncRead for FailingReader {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("synthetic read failure")))
            }
        }

        let backend = Arc::new(MemoryBackend::new());
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let mut store = Store::new(backend.clone(), 1024, 1000);

        store
            .put(
                Box::new(std::io::Cursor::new(pattern(0, 100))),
                (String::new(), 100),
                recording_callback(&results, 0),
            )
            .await
            .unwrap();
        store
            .put(
                Box::new(FailingReader),
                (String::new(), 200),
                recording_callback(&results, 1),
            )
            .await
            .unwrap();

        assert!(store.flush().await.is_err());
        // the aborted blob is not observable and no callbacks ran
        assert_eq!(backend.len(), 0);
        assert!(results.lock().is_empty());
    }

    #[tokio::test]
    async fn entries_pack_in_sort_key_order() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let results: Results = Arc::new(Mutex::new(Vec::new()));
        let mut store = Store::new(backend.clone(), 1 << 20, 1000);

        // deposit out of order; sort keys say b/1 < b/2 < z/1
        let entries = [
            (0usize, ("z".to_string(), 1u64), vec![3u8; 10]),
            (1, ("b".to_string(), 2), vec![2u8; 10]),
            (2, ("b".to_string(), 1), vec![1u8; 10]),
        ];
        for (idx, key, data) in entries.iter() {
            store
                .put(
                    Box::new(std::io::Cursor::new(data.clone())),
                    key.clone(),
                    recording_callback(&results, *idx),
                )
                .await
                .unwrap();
        }
        store.flush().await.unwrap();

        // single blob: its bytes are the entries in sort-key order
        let blobs = list_sorted(backend.as_ref(), "blob/").await.unwrap();
        assert_eq!(blobs.len(), 1);
        let mut blob_data = Vec::new();
        backend
            .get(&blobs[0], 0, None)
            .await
            .unwrap()
            .read_to_end(&mut blob_data)
            .await
            .unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&[1u8; 10]);
        expected.extend_from_slice(&[2u8; 10]);
        expected.extend_from_slice(&[3u8; 10]);
        assert_eq!(blob_data, expected);
    }
}
