use std::io::{Cursor, Read, Seek, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use ssh2::{RenameFlags, Session, Sftp};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::instrument;
use url::Url;

use crate::{Backend, Error, ObjectReader};

const TMP_DIR: &str = ".tmp";

// SSH_FX_NO_SUCH_FILE in the sftp protocol.
const NO_SUCH_FILE: i32 = 2;

/// A [Backend] over sftp, for plain ssh servers. libssh2 is a blocking
/// library, so every operation hops onto the blocking thread pool and
/// serializes on the single underlying session.
pub struct SftpBackend {
    conn: Arc<Mutex<SftpConn>>,
}

struct SftpConn {
    // held so the transport outlives the sftp channel
    _session: Session,
    sftp: Sftp,
    root: String,
}

impl SftpBackend {
    /// Connects to `sftp://[user[:password]@]host[:port]/path`. With no
    /// password, ssh-agent authentication is attempted.
    pub async fn connect(url: &Url) -> Result<Self, Error> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("sftp url missing host: {}", url)))?
            .to_string();
        let port = url.port().unwrap_or(22);
        let username = match url.username() {
            "" => std::env::var("USER")
                .map_err(|_| Error::InvalidUrl("sftp url missing username".to_string()))?,
            user => user.to_string(),
        };
        let password = url.password().map(str::to_string);
        let root = url.path().trim_matches('/').to_string();

        let conn = tokio::task::spawn_blocking(move || {
            let tcp = TcpStream::connect((host.as_str(), port))
                .map_err(|e| Error::storage("sftp", e))?;
            let mut session = Session::new().map_err(|e| Error::storage("sftp", e))?;
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| Error::storage("sftp", e))?;
            match &password {
                Some(password) => session
                    .userauth_password(&username, password)
                    .map_err(|e| Error::storage("sftp", e))?,
                None => session
                    .userauth_agent(&username)
                    .map_err(|e| Error::storage("sftp", e))?,
            }
            let sftp = session.sftp().map_err(|e| Error::storage("sftp", e))?;
            Ok::<_, Error>(SftpConn {
                _session: session,
                sftp,
                root,
            })
        })
        .await
        .map_err(|e| Error::storage("sftp", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&SftpConn) -> Result<T, Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sftp connection poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| Error::storage("sftp", e))?
    }
}

impl SftpConn {
    fn remote_path(&self, path: &str) -> String {
        if self.root.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.root, path)
        }
    }

    /// Creates every missing directory leading up to `path`.
    fn mkdir_parents(&self, path: &str) -> Result<(), Error> {
        let components: Vec<&str> = path.split('/').collect();
        let mut dir = String::new();
        for component in &components[..components.len().saturating_sub(1)] {
            if !dir.is_empty() {
                dir.push('/');
            }
            dir.push_str(component);
            match self.sftp.stat(dir.as_ref()) {
                Ok(stat) if stat.is_dir() => continue,
                Ok(_) => {
                    return Err(Error::Storage(format!("sftp: {:?} is not a directory", dir)))
                }
                Err(e) if e.code() == ssh2::ErrorCode::SFTP(NO_SUCH_FILE) => {
                    self.sftp
                        .mkdir(dir.as_ref(), 0o755)
                        .map_err(|e| Error::storage("sftp", e))?;
                }
                Err(e) => return Err(Error::storage("sftp", e)),
            }
        }
        Ok(())
    }
}

fn is_missing(err: &ssh2::Error) -> bool {
    err.code() == ssh2::ErrorCode::SFTP(NO_SUCH_FILE)
}

#[async_trait]
impl Backend for SftpBackend {
    #[instrument(skip(self), err)]
    async fn get(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, Error> {
        let path = path.to_string();
        let data = self
            .blocking(move |conn| {
                let remote = conn.remote_path(&path);
                let mut fh = conn.sftp.open(std::path::Path::new(&remote)).map_err(|e| {
                    if is_missing(&e) {
                        Error::NotFound(path.clone())
                    } else {
                        Error::storage("sftp", e)
                    }
                })?;
                if offset > 0 {
                    fh.seek(std::io::SeekFrom::Start(offset))
                        .map_err(|e| Error::storage("sftp", e))?;
                }
                let mut buf = Vec::new();
                match length {
                    Some(length) => {
                        fh.take(length)
                            .read_to_end(&mut buf)
                            .map_err(|e| Error::storage("sftp", e))?;
                    }
                    None => {
                        fh.read_to_end(&mut buf)
                            .map_err(|e| Error::storage("sftp", e))?;
                    }
                }
                Ok(buf)
            })
            .await?;
        Ok(Box::new(Cursor::new(data)))
    }

    #[instrument(skip(self, data), err)]
    async fn put(
        &self,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf).await?;
        let path = path.to_string();
        self.blocking(move |conn| {
            let remote = conn.remote_path(&path);
            let tmp = conn.remote_path(&format!("{}/{}", TMP_DIR, std::process::id()));
            conn.mkdir_parents(&tmp)?;
            conn.mkdir_parents(&remote)?;

            let staged = (|| {
                let mut fh = conn.sftp.create(tmp.as_ref())?;
                fh.write_all(&buf)?;
                Ok::<_, std::io::Error>(())
            })();
            if let Err(e) = staged {
                let _ = conn.sftp.unlink(tmp.as_ref());
                return Err(Error::storage("sftp", e));
            }

            if let Err(e) =
                conn.sftp
                    .rename(tmp.as_ref(), remote.as_ref(), Some(RenameFlags::OVERWRITE))
            {
                let _ = conn.sftp.unlink(tmp.as_ref());
                return Err(Error::storage("sftp", e));
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, path: &str) -> Result<(), Error> {
        let path = path.to_string();
        self.blocking(move |conn| {
            match conn.sftp.unlink(conn.remote_path(&path).as_ref()) {
                Ok(()) => Ok(()),
                Err(e) if is_missing(&e) => Ok(()),
                Err(e) => Err(Error::storage("sftp", e)),
            }
        })
        .await
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, Error>> {
        let conn = self.conn.clone();
        let prefix = prefix.to_string();
        Box::pin(try_stream! {
            let paths = tokio::task::spawn_blocking(move || {
                let conn = conn.lock().expect("sftp connection poisoned");
                let start = conn.remote_path(prefix.trim_end_matches('/'));
                let strip = if conn.root.is_empty() {
                    String::new()
                } else {
                    format!("{}/", conn.root)
                };

                match conn.sftp.stat(start.as_ref()) {
                    Ok(stat) if stat.is_dir() => {}
                    _ => return Ok(Vec::new()),
                }

                let mut paths = Vec::new();
                let mut pending = vec![std::path::PathBuf::from(&start)];
                while let Some(dir) = pending.pop() {
                    for (entry, stat) in conn
                        .sftp
                        .readdir(&dir)
                        .map_err(|e| Error::storage("sftp", e))?
                    {
                        let name = entry
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        if name.starts_with('.') {
                            continue;
                        }
                        if stat.is_dir() {
                            pending.push(entry);
                        } else if stat.is_file() {
                            let full = entry.to_string_lossy().into_owned();
                            paths.push(
                                full.strip_prefix(&strip).unwrap_or(&full).to_string(),
                            );
                        }
                    }
                }
                Ok::<_, Error>(paths)
            })
            .await
            .map_err(|e| Error::storage("sftp", e))??;

            for path in paths {
                yield path;
            }
        })
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
