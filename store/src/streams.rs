//! Reading a logical byte stream that is a concatenation of blob ranges.

use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use futures::{ready, TryStreamExt};
use jam_backend::Backend;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_stream::StreamExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::instrument;

use crate::proto;
use crate::Error;

/// A seekable reader over a [proto::Stream]'s ranges. Each range is
/// fetched lazily through the backend (and its encryption wrapper) as
/// the read position crosses into it; seeking is pointer arithmetic plus
/// dropping the current range reader.
pub struct Stream {
    backend: Arc<dyn Backend>,
    ranges: Arc<Vec<proto::Range>>,
    offsets: Arc<Vec<u64>>,
    length: u64,
    pos: u64,
    r: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("length", &self.length)
            .field("pos", &self.pos)
            .finish()
    }
}

impl Stream {
    pub fn open(backend: Arc<dyn Backend>, stream: &proto::Stream) -> Self {
        let mut offsets = Vec::with_capacity(stream.ranges.len());
        let mut length = 0u64;
        for range in &stream.ranges {
            offsets.push(length);
            length += range.length as u64;
        }
        Self {
            backend,
            ranges: Arc::new(stream.ranges.clone()),
            offsets: Arc::new(offsets),
            length,
            pos: 0,
            r: None,
        }
    }

    /// Total logical length of the stream.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// An independent reader at the same logical offset, sharing no
    /// mutable state. Used to serve concurrent reads of one file.
    pub fn fork(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            ranges: self.ranges.clone(),
            offsets: self.offsets.clone(),
            length: self.length,
            pos: self.pos,
            r: None,
        }
    }

    /// Index of the range containing logical position `pos`. The last
    /// range starting at or before `pos` contains it; empty ranges sort
    /// ahead of the data at the same offset and are skipped naturally.
    fn range_idx_for_position(&self, pos: u64) -> Option<usize> {
        if pos >= self.length {
            return None;
        }
        Some(self.offsets.partition_point(|&start| start <= pos) - 1)
    }

    /// Builds a reader for the remainder of the stream starting at
    /// `offset`, chaining one lazily-opened reader per range.
    fn reader_from_offset(&self, offset: u64) -> Box<dyn AsyncRead + Send + Unpin> {
        if offset >= self.length {
            return Box::new(std::io::Cursor::new(Vec::new()));
        }
        let start_idx = self
            .range_idx_for_position(offset)
            .expect("offset inside stream");
        let skip_first = offset - self.offsets[start_idx];

        let backend = self.backend.clone();
        let ranges = self.ranges.clone();
        let readers = tokio_stream::iter(start_idx..ranges.len()).map(move |idx| {
            let backend = backend.clone();
            let ranges = ranges.clone();
            let skip = if idx == start_idx { skip_first } else { 0 };
            async move { open_range(backend.as_ref(), &ranges[idx], skip).await }
        });
        let chunks = readers
            .then(|open| async { open.await.map(ReaderStream::new) })
            .try_flatten();
        Box::new(StreamReader::new(Box::pin(chunks)))
    }
}

/// Opens one range at `skip` bytes into it, truncating whatever extra
/// the backend returns past the range's end.
#[instrument(skip(backend, range), fields(blob = ?range.blob()), err)]
pub async fn open_range(
    backend: &dyn Backend,
    range: &proto::Range,
    skip: u64,
) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
    let length = range.length as u64;
    if skip > length {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "invalid offset into range",
        ));
    }
    if skip == length {
        return Ok(Box::new(std::io::Cursor::new(Vec::new())));
    }
    let blob = range.blob().map_err(std::io::Error::from)?;
    let reader = backend
        .get(
            &blob.blob_path(),
            range.offset as u64 + skip,
            Some(length - skip),
        )
        .await
        .map_err(std::io::Error::from)?;
    Ok(Box::new(reader.take(length - skip)))
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.r.is_none() {
            this.r = Some(this.reader_from_offset(this.pos));
        }
        let filled_before = buf.filled().len();
        ready!(Pin::new(this.r.as_mut().expect("reader just set")).poll_read(cx, buf))?;
        this.pos += (buf.filled().len() - filled_before) as u64;
        Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncSeek for Stream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            SeekFrom::Start(from_start) => from_start,
            SeekFrom::End(from_end) => {
                this.length.checked_add_signed(from_end).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "over/underflow while seeking",
                    )
                })?
            }
            SeekFrom::Current(from_current) => {
                this.pos.checked_add_signed(from_current).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "over/underflow while seeking",
                    )
                })?
            }
        };
        if target != this.pos {
            if target > this.length {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "seeked beyond EOF",
                ));
            }
            this.pos = target;
            this.r = None;
        }
        Ok(())
    }

    fn poll_complete(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}

/// Reads a [proto::Stream] to completion, returning its bytes. Used for
/// loading manifests and branch pages.
pub async fn read_all(backend: Arc<dyn Backend>, stream: &proto::Stream) -> Result<Vec<u8>, Error> {
    let mut reader = Stream::open(backend, stream);
    let mut buf = Vec::with_capacity(reader.length() as usize);
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jam_backend::{Backend, MemoryBackend};
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    use super::Stream;
    use crate::ids::BlobId;
    use crate::proto;

    /// Builds two raw blobs and a stream whose ranges stitch together
    /// interleaved slices of them.
    async fn fixture() -> (Arc<dyn Backend>, proto::Stream, Vec<u8>) {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let blob_a = BlobId::generate();
        let blob_b = BlobId::generate();

        let a_data: Vec<u8> = (0u32..1000).map(|i| (i % 256) as u8).collect();
        let b_data: Vec<u8> = (0u32..1000).map(|i| ((i + 7) % 256) as u8).collect();
        let mut a = std::io::Cursor::new(a_data.clone());
        backend.put(&blob_a.blob_path(), &mut a).await.unwrap();
        let mut b = std::io::Cursor::new(b_data.clone());
        backend.put(&blob_b.blob_path(), &mut b).await.unwrap();

        let stream = proto::Stream {
            ranges: vec![
                proto::Range::new(&blob_a, 0, 300),
                proto::Range::new(&blob_b, 100, 500),
                proto::Range::new(&blob_a, 300, 700),
            ],
        };
        let mut expected = Vec::new();
        expected.extend_from_slice(&a_data[..300]);
        expected.extend_from_slice(&b_data[100..600]);
        expected.extend_from_slice(&a_data[300..]);
        (backend, stream, expected)
    }

    #[tokio::test]
    async fn reads_concatenation() {
        let (backend, stream, expected) = fixture().await;
        let mut reader = Stream::open(backend, &stream);
        assert_eq!(reader.length(), expected.len() as u64);

        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn seeks_across_ranges() {
        let (backend, stream, expected) = fixture().await;
        let mut reader = Stream::open(backend, &stream);

        // forward into the middle range
        reader.seek(std::io::SeekFrom::Start(450)).await.unwrap();
        let mut buf = [0u8; 17];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &expected[450..467]);

        // relative backwards across a range boundary
        reader.seek(std::io::SeekFrom::Current(-200)).await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &expected[267..284]);

        // from the end
        reader.seek(std::io::SeekFrom::End(-5)).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(&rest[..], &expected[expected.len() - 5..]);

        // seeking past EOF is refused
        assert!(reader
            .seek(std::io::SeekFrom::Start(expected.len() as u64 + 1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn forks_are_independent() {
        let (backend, stream, expected) = fixture().await;
        let mut reader = Stream::open(backend, &stream);
        reader.seek(std::io::SeekFrom::Start(100)).await.unwrap();

        let mut forked = reader.fork();
        let mut a = [0u8; 10];
        let mut b = [0u8; 10];
        reader.read_exact(&mut a).await.unwrap();
        forked.read_exact(&mut b).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(&a[..], &expected[100..110]);

        // advancing one does not move the other
        reader.read_exact(&mut a).await.unwrap();
        forked.seek(std::io::SeekFrom::Start(0)).await.unwrap();
        forked.read_exact(&mut b).await.unwrap();
        assert_eq!(&b[..], &expected[..10]);
    }
}
