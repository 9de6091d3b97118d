use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{instrument, warn};

use crate::{Backend, Error, ObjectReader};

/// Replicates one or more backends. Puts, deletes, and closes fan out to
/// every replica in parallel; gets and lists are served by the primary
/// (the first backend), unless comparing reads are enabled, in which case
/// every replica is read and any byte disagreement fails the read.
pub struct CombinedBackend {
    backends: Vec<Arc<dyn Backend>>,
    compare_reads: bool,
}

impl CombinedBackend {
    pub fn new(primary: Arc<dyn Backend>, others: Vec<Arc<dyn Backend>>) -> Self {
        Self::build(primary, others, false)
    }

    /// Like [CombinedBackend::new], but every get reads all replicas
    /// simultaneously and errors on mismatch.
    pub fn comparing(primary: Arc<dyn Backend>, others: Vec<Arc<dyn Backend>>) -> Self {
        Self::build(primary, others, true)
    }

    fn build(primary: Arc<dyn Backend>, others: Vec<Arc<dyn Backend>>, compare: bool) -> Self {
        let mut backends = Vec::with_capacity(others.len() + 1);
        backends.push(primary);
        backends.extend(others);
        Self {
            backends,
            compare_reads: compare,
        }
    }
}

#[async_trait]
impl Backend for CombinedBackend {
    async fn get(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, Error> {
        if !self.compare_reads {
            return self.backends[0].get(path, offset, length).await;
        }

        let mut readers = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            readers.push(backend.get(path, offset, length).await?);
        }
        Ok(compare_readers(readers))
    }

    #[instrument(skip(self, data), fields(replicas = self.backends.len()), err)]
    async fn put(
        &self,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Error> {
        if self.backends.len() == 1 {
            return self.backends[0].put(path, data).await;
        }

        // Tee the source into one bounded channel per replica and run
        // all puts concurrently with the read loop feeding them.
        let mut senders = Vec::with_capacity(self.backends.len());
        let mut puts = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(8);
            senders.push(tx);
            let backend = backend.clone();
            let path = path.to_string();
            puts.push(async move {
                let mut replica = StreamReader::new(ReceiverStream::new(rx));
                backend.put(&path, &mut replica).await
            });
        }

        let driver = async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = data.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                for tx in &senders {
                    // a closed receiver means that replica's put already
                    // failed; its error is collected below
                    let _ = tx.send(Ok(chunk.clone())).await;
                }
            }
            Ok::<(), Error>(())
        };

        let (put_results, drive_result) =
            tokio::join!(futures::future::join_all(puts), driver);

        let failure = drive_result
            .err()
            .or_else(|| put_results.into_iter().find_map(Result::err));
        if let Some(err) = failure {
            if let Err(cleanup) = self.delete(path).await {
                warn!(%path, error = %cleanup, "failed cleaning up partial replicas");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let deletes = self
            .backends
            .iter()
            .map(|backend| backend.delete(path));
        futures::future::join_all(deletes)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, Error>>()?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, Error>> {
        self.backends[0].list(prefix)
    }

    async fn close(&self) -> Result<(), Error> {
        let closes = self.backends.iter().map(|backend| backend.close());
        futures::future::join_all(closes)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, Error>>()?;
        Ok(())
    }
}

/// Zips N readers together, returning the primary's bytes and failing as
/// soon as any replica disagrees (in content or in length).
fn compare_readers(mut readers: Vec<ObjectReader>) -> ObjectReader {
    if readers.len() == 1 {
        return readers.pop().expect("one reader");
    }
    let mut primary = readers.remove(0);
    let stream: BoxStream<'static, Result<Bytes, std::io::Error>> = Box::pin(try_stream! {
        let mut buf = vec![0u8; 32 * 1024];
        let mut replica_buf = vec![0u8; 32 * 1024];
        loop {
            let n = primary.read(&mut buf).await?;
            if n == 0 {
                for replica in readers.iter_mut() {
                    if replica.read(&mut replica_buf).await? != 0 {
                        Err(std::io::Error::other(
                            "reader comparison mismatch: lengths differ",
                        ))?;
                    }
                }
                break;
            }
            for replica in readers.iter_mut() {
                replica.read_exact(&mut replica_buf[..n]).await.map_err(|e| {
                    std::io::Error::other(format!("reader comparison mismatch: {}", e))
                })?;
                if replica_buf[..n] != buf[..n] {
                    Err(std::io::Error::other(
                        "reader comparison mismatch: bytes differ",
                    ))?;
                }
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    });
    Box::new(StreamReader::new(stream))
}
