//! Conformance suite run against every local backend implementation.

use std::sync::Arc;

use tokio::io::AsyncReadExt;

use crate::cache::Cache;
use crate::{list_sorted, Backend, CombinedBackend, Error, FilesystemBackend, MemoryBackend};

async fn put_bytes(b: &dyn Backend, path: &str, data: &[u8]) {
    let mut reader = std::io::Cursor::new(data.to_vec());
    b.put(path, &mut reader).await.expect("put");
}

async fn get_bytes(b: &dyn Backend, path: &str, offset: u64, length: Option<u64>) -> Vec<u8> {
    let mut reader = b.get(path, offset, length).await.expect("get");
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.expect("read");
    if let Some(length) = length {
        // backends may return more than asked; the contract says to
        // truncate client-side
        buf.truncate(length as usize);
    }
    buf
}

async fn suite_get_put_list_delete(b: Arc<dyn Backend>) {
    assert!(list_sorted(b.as_ref(), "").await.unwrap().is_empty());

    put_bytes(b.as_ref(), "hello/there", b"hello").await;
    put_bytes(b.as_ref(), "hi/there", b"hi").await;

    assert_eq!(
        list_sorted(b.as_ref(), "").await.unwrap(),
        vec!["hello/there".to_string(), "hi/there".to_string()]
    );
    assert_eq!(
        list_sorted(b.as_ref(), "hello/").await.unwrap(),
        vec!["hello/there".to_string()]
    );

    assert_eq!(get_bytes(b.as_ref(), "hello/there", 0, Some(5)).await, b"hello");

    let missing = b.get("nope/nothing", 0, None).await;
    match missing {
        Err(e) => assert!(e.is_not_found(), "expected not-found, got {:?}", e),
        Ok(_) => panic!("expected not-found"),
    }

    b.delete("hello/there").await.expect("delete");
    // idempotent
    b.delete("hello/there").await.expect("re-delete");

    assert!(list_sorted(b.as_ref(), "hello/").await.unwrap().is_empty());
    assert_eq!(
        list_sorted(b.as_ref(), "").await.unwrap(),
        vec!["hi/there".to_string()]
    );
    assert_eq!(get_bytes(b.as_ref(), "hi/there", 0, Some(2)).await, b"hi");

    b.close().await.expect("close");
}

async fn suite_offset_reads(b: Arc<dyn Backend>) {
    let data: Vec<u8> = (0..10 * 1024u32).map(|i| (i % 251) as u8).collect();
    put_bytes(b.as_ref(), "testfile", &data).await;

    for offset in [0usize, 1, 251, 1023, 1024, 5000, data.len() - 1] {
        let got = get_bytes(
            b.as_ref(),
            "testfile",
            offset as u64,
            Some((data.len() - offset) as u64),
        )
        .await;
        assert_eq!(&got, &data[offset..], "offset {}", offset);
    }

    // open-ended read from an offset
    let got = get_bytes(b.as_ref(), "testfile", 4096, None).await;
    assert_eq!(&got, &data[4096..]);

    b.close().await.expect("close");
}

async fn suite_hierarchy(b: Arc<dyn Backend>) {
    for path in [
        "a/b/c/d/e/f",
        "a/b/c/d/e/g",
        "a/b/c/d/e/h",
        "a/b/c/d/i",
        "b/c/d/i",
    ] {
        put_bytes(b.as_ref(), path, b"data").await;
    }

    assert_eq!(
        list_sorted(b.as_ref(), "").await.unwrap(),
        vec!["a/b/c/d/e/f", "a/b/c/d/e/g", "a/b/c/d/e/h", "a/b/c/d/i", "b/c/d/i"]
    );
    assert_eq!(
        list_sorted(b.as_ref(), "a/").await.unwrap(),
        vec!["a/b/c/d/e/f", "a/b/c/d/e/g", "a/b/c/d/e/h", "a/b/c/d/i"]
    );
    assert_eq!(list_sorted(b.as_ref(), "b/").await.unwrap(), vec!["b/c/d/i"]);
    assert_eq!(
        list_sorted(b.as_ref(), "a/b/c/d/e/").await.unwrap(),
        vec!["a/b/c/d/e/f", "a/b/c/d/e/g", "a/b/c/d/e/h"]
    );
    assert!(list_sorted(b.as_ref(), "a/b/c/d/i/").await.unwrap().is_empty());

    b.close().await.expect("close");
}

#[tokio::test]
async fn memory_suite() {
    suite_get_put_list_delete(Arc::new(MemoryBackend::new())).await;
    suite_offset_reads(Arc::new(MemoryBackend::new())).await;
    suite_hierarchy(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn fs_suite() {
    let dir = tempfile::tempdir().unwrap();
    suite_get_put_list_delete(Arc::new(FilesystemBackend::new(dir.path()))).await;
    let dir = tempfile::tempdir().unwrap();
    suite_offset_reads(Arc::new(FilesystemBackend::new(dir.path()))).await;
    let dir = tempfile::tempdir().unwrap();
    suite_hierarchy(Arc::new(FilesystemBackend::new(dir.path()))).await;
}

#[tokio::test]
async fn combined_suite() {
    let primary = Arc::new(MemoryBackend::new());
    let replica = Arc::new(MemoryBackend::new());
    let combined: Arc<dyn Backend> = Arc::new(CombinedBackend::new(
        primary.clone(),
        vec![replica.clone() as Arc<dyn Backend>],
    ));
    suite_get_put_list_delete(combined.clone()).await;

    // writes land on every replica
    put_bytes(combined.as_ref(), "x/y", b"payload").await;
    assert_eq!(get_bytes(primary.as_ref(), "x/y", 0, None).await, b"payload");
    assert_eq!(get_bytes(replica.as_ref(), "x/y", 0, None).await, b"payload");

    combined.delete("x/y").await.unwrap();
    assert!(primary.get("x/y", 0, None).await.is_err());
    assert!(replica.get("x/y", 0, None).await.is_err());
}

#[tokio::test]
async fn combined_compare_detects_mismatch() {
    let primary = Arc::new(MemoryBackend::new());
    let replica = Arc::new(MemoryBackend::new());

    put_bytes(primary.as_ref(), "k", b"same bytes here").await;
    put_bytes(replica.as_ref(), "k", b"same bytes here").await;

    let comparing =
        CombinedBackend::comparing(primary.clone(), vec![replica.clone() as Arc<dyn Backend>]);
    assert_eq!(
        get_bytes(&comparing, "k", 0, None).await,
        b"same bytes here"
    );

    put_bytes(replica.as_ref(), "k", b"DIFF bytes here").await;
    let mut reader = comparing.get("k", 0, None).await.unwrap();
    let mut sink = Vec::new();
    assert!(reader.read_to_end(&mut sink).await.is_err());
}

#[tokio::test]
async fn cache_admission_and_bounds() {
    let slow = Arc::new(MemoryBackend::new());
    let fast = Arc::new(MemoryBackend::new());
    let cache = Cache::new(slow.clone(), fast.clone(), 2, 3, None)
        .await
        .unwrap();

    put_bytes(&cache, "blob/one", b"oneoneone").await;
    put_bytes(&cache, "blob/two", b"twotwotwo").await;
    // write-through only: nothing cached yet
    assert_eq!(fast.len(), 0);

    // two reads are below the admission threshold
    for _ in 0..2 {
        assert_eq!(get_bytes(&cache, "blob/one", 0, None).await, b"oneoneone");
    }
    assert_eq!(fast.len(), 0);

    // the third read admits and fills
    assert_eq!(get_bytes(&cache, "blob/one", 3, Some(3)).await, b"one");
    assert_eq!(fast.len(), 1);

    // cached ranges still serve correct bytes
    assert_eq!(get_bytes(&cache, "blob/one", 0, Some(3)).await, b"one");

    // deleting scrubs both layers
    cache.delete("blob/one").await.unwrap();
    assert_eq!(fast.len(), 0);
    assert!(slow.get("blob/one", 0, None).await.is_err());
}

#[tokio::test]
async fn cache_state_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("cache-state.json");
    let slow = Arc::new(MemoryBackend::new());
    let fast = Arc::new(MemoryBackend::new());

    {
        let cache = Cache::new(slow.clone(), fast.clone(), 4, 2, Some(state_path.clone()))
            .await
            .unwrap();
        put_bytes(&cache, "blob/a", b"aaaa").await;
        for _ in 0..2 {
            let _ = get_bytes(&cache, "blob/a", 0, None).await;
        }
        assert_eq!(fast.len(), 1);
        cache.close().await.unwrap();
    }

    // state reloads without issue
    {
        let cache = Cache::new(slow.clone(), fast.clone(), 4, 2, Some(state_path.clone()))
            .await
            .unwrap();
        assert_eq!(get_bytes(&cache, "blob/a", 0, None).await, b"aaaa");
    }

    // corrupt state files are ignored, not fatal
    std::fs::write(&state_path, b"{definitely not json").unwrap();
    let cache = Cache::new(slow, fast, 4, 2, Some(state_path)).await;
    assert!(cache.is_ok(), "corrupt cache state must be ignored");
}

#[tokio::test]
async fn combined_put_failure_cleans_replicas() {
    struct FailingBackend;

    #[async_trait::async_trait]
    impl Backend for FailingBackend {
        async fn get(
            &self,
            path: &str,
            _offset: u64,
            _length: Option<u64>,
        ) -> Result<crate::ObjectReader, Error> {
            Err(Error::NotFound(path.to_string()))
        }
        async fn put(
            &self,
            _path: &str,
            _data: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        ) -> Result<(), Error> {
            Err(Error::Storage("synthetic failure".to_string()))
        }
        async fn delete(&self, _path: &str) -> Result<(), Error> {
            Ok(())
        }
        fn list(
            &self,
            _prefix: &str,
        ) -> futures::stream::BoxStream<'static, Result<String, Error>> {
            Box::pin(futures::stream::empty())
        }
        async fn close(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    let healthy = Arc::new(MemoryBackend::new());
    let combined =
        CombinedBackend::new(healthy.clone(), vec![Arc::new(FailingBackend) as Arc<dyn Backend>]);

    let mut data = std::io::Cursor::new(b"payload".to_vec());
    assert!(combined.put("k", &mut data).await.is_err());
    // the healthy replica's copy was cleaned up again
    assert!(healthy.get("k", 0, None).await.is_err());
}
