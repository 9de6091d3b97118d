use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::digests::ContentHash;

/// Drains `reader`, returning the SHA-256 of everything it produced and
/// the byte count.
pub(crate) async fn hash_reader<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> std::io::Result<(ContentHash, u64)> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let digest: [u8; 32] = hasher.finalize().into();
            return Ok((ContentHash::from(digest), size));
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
}

/// Re-hashes everything read through it and fails at EOF if the digest
/// no longer matches `expected`: the file changed between the hash
/// pre-pass and packing, and packing it would store bytes under the
/// wrong name.
pub(crate) struct HashConfirmReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    hasher: Option<Sha256>,
    expected: ContentHash,
}

impl HashConfirmReader {
    pub(crate) fn new(inner: Box<dyn AsyncRead + Send + Unpin>, expected: ContentHash) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            expected,
        }
    }
}

impl AsyncRead for HashConfirmReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let filled = &buf.filled()[filled_before..];

        match this.hasher.as_mut() {
            Some(hasher) if !filled.is_empty() => {
                hasher.update(filled);
            }
            Some(_) => {
                let digest: [u8; 32] = this.hasher.take().expect("hasher present").finalize().into();
                if ContentHash::from(digest) != this.expected {
                    return Poll::Ready(Err(std::io::Error::other(
                        "file changed while reading",
                    )));
                }
            }
            None => {}
        }
        Poll::Ready(Ok(()))
    }
}
