use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use crate::{Backend, Error, ObjectReader};

const TMP_DIR: &str = ".tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A [Backend] storing each object as a file under a local root
/// directory. Uploads are staged under `.tmp/` and renamed into place so
/// a failed put leaves no observable object; keys never start with a dot,
/// so `list` can skip the staging area wholesale.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn local_path(&self, path: &str) -> PathBuf {
        let mut local = self.root.clone();
        local.extend(path.split('/'));
        local
    }

    fn tmp_path(&self) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(TMP_DIR)
            .join(format!("{}-{}", std::process::id(), n))
    }

    /// Removes now-empty parent directories between `local` and the
    /// root. Purely cosmetic; failures are ignored.
    async fn prune_empty_parents(&self, local: &Path) {
        let mut dir = local.to_path_buf();
        while dir.pop() && dir != self.root {
            if tokio::fs::remove_dir(&dir).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    #[instrument(skip(self), fields(root = %self.root.display()), err)]
    async fn get(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, Error> {
        let mut fh = tokio::fs::File::open(self.local_path(path))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
                _ => Error::storage("fs", e),
            })?;
        if offset > 0 {
            fh.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| Error::storage("fs", e))?;
        }
        Ok(match length {
            Some(length) => Box::new(fh.take(length)),
            None => Box::new(fh),
        })
    }

    #[instrument(skip(self, data), fields(root = %self.root.display()), err)]
    async fn put(
        &self,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Error> {
        let tmp = self.tmp_path();
        if let Some(parent) = tmp.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage("fs", e))?;
        }

        let staged = async {
            let mut fh = tokio::fs::File::create(&tmp).await?;
            tokio::io::copy(data, &mut fh).await?;
            fh.flush().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = staged {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage("fs", e));
        }

        let local = self.local_path(path);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage("fs", e))?;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &local).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::storage("fs", e));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(root = %self.root.display()), err)]
    async fn delete(&self, path: &str) -> Result<(), Error> {
        let local = self.local_path(path);
        match tokio::fs::remove_file(&local).await {
            Ok(()) => {
                self.prune_empty_parents(&local).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage("fs", e)),
        }
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, Error>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        Box::pin(try_stream! {
            let walk_root = root.clone();
            let paths = tokio::task::spawn_blocking(move || walk(&walk_root, &prefix))
                .await
                .map_err(|e| Error::storage("fs", e))??;
            for path in paths {
                yield path;
            }
        })
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

fn walk(root: &Path, prefix: &str) -> Result<Vec<String>, Error> {
    let mut start = root.to_path_buf();
    start.extend(prefix.split('/').filter(|c| !c.is_empty()));
    match std::fs::metadata(&start) {
        Ok(meta) if meta.is_dir() => {}
        _ => return Ok(Vec::new()),
    }

    let mut paths = Vec::new();
    for entry in walkdir::WalkDir::new(&start)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
    {
        let entry = entry.map_err(|e| Error::storage("fs", e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::storage("fs", e))?;
        let mut key = String::new();
        for component in rel.components() {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(&component.as_os_str().to_string_lossy());
        }
        paths.push(key);
    }
    Ok(paths)
}
