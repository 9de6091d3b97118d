use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Backend, Error, ObjectReader};

/// An in-memory [Backend]. Mostly useful as a test double and as the
/// root of composition tests, like the other backends it hands out
/// readers over immutable snapshots of the stored bytes.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    db: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects; handy in tests.
    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.read().is_empty()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, Error> {
        let db = self.db.read();
        let data = db
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let start = (offset as usize).min(data.len());
        let end = match length {
            Some(l) => (start + l as usize).min(data.len()),
            None => data.len(),
        };
        Ok(Box::new(Cursor::new(data.slice(start..end))))
    }

    async fn put(
        &self,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await?;
        self.db.write().insert(path.to_string(), buf.into());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        self.db.write().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, Error>> {
        let db = self.db.read();
        let paths: Vec<String> = db
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, _)| path.clone())
            .collect();
        Box::pin(futures::stream::iter(paths.into_iter().map(Ok)))
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
