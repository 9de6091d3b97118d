use std::sync::Arc;

use url::Url;

use crate::{
    Backend, CombinedBackend, Error, FilesystemBackend, MemoryBackend, ObjectStoreBackend,
    SftpBackend,
};

/// Constructs a [Backend] from a URL.
///
/// The following schemes are supported:
/// - `file:///some/path` ([FilesystemBackend])
/// - `memory://` ([MemoryBackend])
/// - `sftp://user@host/path` ([SftpBackend])
/// - `s3://bucket/prefix` and other [object_store] URLs
///   ([ObjectStoreBackend])
pub async fn from_addr(uri: &str) -> Result<Arc<dyn Backend>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::InvalidUrl(format!("unable to parse url {:?}: {}", uri, e)))?;

    Ok(match url.scheme() {
        "file" => {
            if url.path().is_empty() || url.path() == "/" {
                return Err(Error::InvalidUrl(format!(
                    "file url needs a directory path: {}",
                    url
                )));
            }
            Arc::new(FilesystemBackend::new(url.path()))
        }
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidUrl(format!("invalid memory url: {}", url)));
            }
            Arc::new(MemoryBackend::new())
        }
        "sftp" => Arc::new(SftpBackend::connect(&url).await?),
        "s3" | "gs" | "az" | "azure" | "abfs" | "http" | "https" => {
            Arc::new(ObjectStoreBackend::parse_url(&url)?)
        }
        scheme => {
            return Err(Error::InvalidUrl(format!(
                "no backend registered for scheme {:?}",
                scheme
            )))
        }
    })
}

/// Like [from_addr], but accepts a comma-separated list of URLs and
/// combines them: the first is the primary, reads come from it, writes
/// fan out to all.
pub async fn from_addrs(uris: &str) -> Result<Arc<dyn Backend>, Error> {
    let mut backends = Vec::new();
    for uri in uris.split(',') {
        backends.push(from_addr(uri.trim()).await?);
    }
    match backends.len() {
        0 => Err(Error::InvalidUrl("no backend urls provided".to_string())),
        1 => Ok(backends.pop().expect("one backend")),
        _ => {
            let primary = backends.remove(0);
            Ok(Arc::new(CombinedBackend::new(primary, backends)))
        }
    }
}
