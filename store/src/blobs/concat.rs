use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::ids::BlobId;
use crate::proto;

use super::{PackCallback, PendingEntry};

/// An entry whose reader has been fully consumed. `stream` covers every
/// byte the reader produced, in pack order.
pub(crate) struct Completed {
    pub callback: PackCallback,
    pub stream: proto::Stream,
}

struct Processing {
    source: Box<dyn AsyncRead + Send + Unpin>,
    callback: PackCallback,
    /// capped ranges of this entry so far
    ranges: Vec<proto::Range>,
    /// where the currently-open range started in the current blob
    range_start: u64,
}

/// Concatenates entry readers into one byte stream while tracking, per
/// entry, exactly which blob ranges its bytes landed in. The store reads
/// blob-size chunks out of this and calls [Concat::cut] at each blob
/// boundary.
pub(crate) struct Concat {
    unprocessed: VecDeque<PendingEntry>,
    processing: Option<Processing>,
    completed: Vec<Completed>,
    /// bytes emitted into the current blob
    offset: u64,
    blob: BlobId,
    /// one pre-read byte, replayed before the sources
    lookahead: Option<u8>,
}

impl Concat {
    pub(crate) fn new(entries: Vec<PendingEntry>) -> Self {
        let mut c = Self {
            unprocessed: entries.into(),
            processing: None,
            completed: Vec::new(),
            offset: 0,
            blob: BlobId::generate(),
            lookahead: None,
        };
        c.next_entry();
        c
    }

    /// The blob currently being filled.
    pub(crate) fn blob(&self) -> BlobId {
        self.blob
    }

    /// Ends the current blob: caps the open range, resets the offset,
    /// and mints the next blob ID. The in-flight entry, if any, keeps
    /// accumulating ranges in the new blob.
    pub(crate) fn cut(&mut self) {
        let blob = self.blob;
        let offset = self.offset;
        if let Some(p) = self.processing.as_mut() {
            let length = offset - p.range_start;
            if length > 0 {
                p.ranges.push(proto::Range::new(&blob, p.range_start, length));
            }
            p.range_start = 0;
        }
        self.offset = 0;
        self.blob = BlobId::generate();
    }

    /// Entries whose readers finished since the last call. The caller
    /// invokes their callbacks once the covering blob is durable.
    pub(crate) fn take_completed(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.completed)
    }

    /// Ensures at least one byte is pending (buffered in `lookahead`),
    /// so the store never writes an empty blob. Returns false at the end
    /// of all entries.
    pub(crate) async fn fill_lookahead(&mut self) -> std::io::Result<bool> {
        if self.lookahead.is_some() {
            return Ok(true);
        }
        if self.processing.is_none() {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        let n = self.read(&mut byte).await?;
        if n == 0 {
            return Ok(false);
        }
        self.lookahead = Some(byte[0]);
        Ok(true)
    }

    /// Finishes the in-flight entry and stages the next one. The new
    /// entry's first range opens at the current offset of the current
    /// blob.
    fn next_entry(&mut self) {
        if let Some(mut p) = self.processing.take() {
            let length = self.offset - p.range_start;
            if length > 0 {
                p.ranges
                    .push(proto::Range::new(&self.blob, p.range_start, length));
            }
            self.completed.push(Completed {
                callback: p.callback,
                stream: proto::Stream { ranges: p.ranges },
            });
        }
        if let Some(next) = self.unprocessed.pop_front() {
            self.processing = Some(Processing {
                source: next.source,
                callback: next.callback,
                ranges: Vec::new(),
                range_start: self.offset,
            });
        }
    }
}

impl AsyncRead for Concat {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(byte) = this.lookahead.take() {
                // already accounted for when it was first read
                buf.put_slice(&[byte]);
                return Poll::Ready(Ok(()));
            }
            let Some(p) = this.processing.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            let filled_before = buf.filled().len();
            ready!(Pin::new(&mut p.source).poll_read(cx, buf))?;
            let n = buf.filled().len() - filled_before;
            if n == 0 {
                this.next_entry();
                continue;
            }
            this.offset += n as u64;
            return Poll::Ready(Ok(()));
        }
    }
}
