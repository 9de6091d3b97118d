use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{GetOptions, GetRange, ObjectStore};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::instrument;
use url::Url;

use crate::{Backend, Error, ObjectReader};

/// A [Backend] over any bucket the [object_store] crate can talk to
/// (`s3://bucket/prefix` being the usual one). The URL's path suffix
/// becomes the key prefix inside the bucket; query parameters are passed
/// through as [object_store] options.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    base: Path,
}

impl ObjectStoreBackend {
    pub fn parse_url(url: &Url) -> Result<Self, Error> {
        let options: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let mut trimmed = url.clone();
        trimmed.set_query(None);
        let (store, base) = object_store::parse_url_opts(&trimmed, options)
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        Ok(Self {
            store: Arc::new(store),
            base,
        })
    }

    fn full_path(&self, path: &str) -> Path {
        if self.base.as_ref().is_empty() {
            Path::from(path)
        } else {
            Path::from(format!("{}/{}", self.base.as_ref(), path))
        }
    }
}

fn convert_err(path: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::NotFound(path.to_string()),
        other => Error::storage("object store", other),
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    #[instrument(skip(self), err)]
    async fn get(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, Error> {
        let range = match (offset, length) {
            (0, None) => None,
            (offset, None) => Some(GetRange::Offset(offset as usize)),
            (offset, Some(length)) => {
                Some(GetRange::Bounded(offset as usize..(offset + length) as usize))
            }
        };
        let result = self
            .store
            .get_opts(
                &self.full_path(path),
                GetOptions {
                    range,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| convert_err(path, e))?;
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(Box::new(StreamReader::new(stream)))
    }

    #[instrument(skip(self, data), err)]
    async fn put(
        &self,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Error> {
        // object_store wants a seekable payload for retries, so the
        // object is buffered. Blobs are bounded by the configured blob
        // size, which keeps this tolerable.
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await?;
        self.store
            .put(&self.full_path(path), Bytes::from(buf).into())
            .await
            .map_err(|e| convert_err(path, e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, path: &str) -> Result<(), Error> {
        match self.store.delete(&self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::storage("object store", e)),
        }
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, Error>> {
        let store = self.store.clone();
        let base = self.base.clone();
        let list_prefix = if prefix.is_empty() {
            base.clone()
        } else {
            Path::from(format!("{}/{}", base.as_ref(), prefix.trim_end_matches('/')))
        };
        let strip = if base.as_ref().is_empty() {
            String::new()
        } else {
            format!("{}/", base.as_ref())
        };
        Box::pin(try_stream! {
            let mut entries = store.list(Some(&list_prefix));
            while let Some(meta) = entries
                .try_next()
                .await
                .map_err(|e| Error::storage("object store", e))?
            {
                let location = meta.location.as_ref();
                yield location
                    .strip_prefix(&strip)
                    .unwrap_or(location)
                    .to_string();
            }
        })
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
