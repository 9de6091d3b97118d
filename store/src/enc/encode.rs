//! Streaming block encryption and decryption as [AsyncRead] adapters.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, ReadBuf};

use super::{Codec, KEY_LEN};

/// Encrypts everything read through it. The final short block, if any,
/// is zero-padded up to the codec's plaintext block size; consumers of
/// the decrypted data delimit their content explicitly (range lengths,
/// framed documents) and never see the padding.
pub struct EncodeReader<'a> {
    inner: &'a mut (dyn AsyncRead + Send + Unpin),
    codec: Arc<dyn Codec>,
    key: [u8; KEY_LEN],
    block_index: u64,
    inbuf: Vec<u8>,
    scratch: Vec<u8>,
    out: Bytes,
    done: bool,
}

impl<'a> EncodeReader<'a> {
    pub fn new(
        inner: &'a mut (dyn AsyncRead + Send + Unpin),
        codec: Arc<dyn Codec>,
        key: [u8; KEY_LEN],
    ) -> Self {
        let block = codec.plaintext_block_size();
        Self {
            inner,
            codec,
            key,
            block_index: 0,
            inbuf: Vec::with_capacity(block),
            scratch: vec![0u8; block],
            out: Bytes::new(),
            done: false,
        }
    }
}

impl AsyncRead for EncodeReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.out.has_remaining() {
                let n = this.out.len().min(buf.remaining());
                buf.put_slice(&this.out[..n]);
                this.out.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            let block = this.codec.plaintext_block_size();
            let want = block - this.inbuf.len();
            let mut read_buf = ReadBuf::new(&mut this.scratch[..want]);
            match Pin::new(&mut *this.inner).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            let filled = read_buf.filled();

            if filled.is_empty() {
                this.done = true;
                if this.inbuf.is_empty() {
                    continue;
                }
                this.inbuf.resize(block, 0);
            } else {
                this.inbuf.extend_from_slice(filled);
                if this.inbuf.len() < block {
                    continue;
                }
            }

            match this
                .codec
                .encrypt_block(&this.key, this.block_index, &this.inbuf)
            {
                Ok(sealed) => {
                    this.block_index += 1;
                    this.inbuf.clear();
                    this.out = sealed.into();
                }
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }
}

/// Decrypts everything read through it, starting at `first_block` and
/// discarding `skip` leading plaintext bytes (the intra-block part of an
/// unaligned offset). A ciphertext that ends mid-block is an error.
pub struct DecodeReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    codec: Arc<dyn Codec>,
    key: [u8; KEY_LEN],
    block_index: u64,
    skip: usize,
    inbuf: Vec<u8>,
    scratch: Vec<u8>,
    out: Bytes,
    done: bool,
}

impl DecodeReader {
    pub fn new(
        inner: Box<dyn AsyncRead + Send + Unpin>,
        codec: Arc<dyn Codec>,
        key: [u8; KEY_LEN],
        first_block: u64,
        skip: usize,
    ) -> Self {
        let block = codec.ciphertext_block_size();
        Self {
            inner,
            codec,
            key,
            block_index: first_block,
            skip,
            inbuf: Vec::with_capacity(block),
            scratch: vec![0u8; block],
            out: Bytes::new(),
            done: false,
        }
    }
}

impl AsyncRead for DecodeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.out.has_remaining() {
                let n = this.out.len().min(buf.remaining());
                buf.put_slice(&this.out[..n]);
                this.out.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            let block = this.codec.ciphertext_block_size();
            let want = block - this.inbuf.len();
            let mut read_buf = ReadBuf::new(&mut this.scratch[..want]);
            match Pin::new(&mut *this.inner).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
            let filled = read_buf.filled();

            if filled.is_empty() {
                if this.inbuf.is_empty() {
                    this.done = true;
                    continue;
                }
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "truncated ciphertext block",
                )));
            }
            this.inbuf.extend_from_slice(filled);
            if this.inbuf.len() < block {
                continue;
            }

            match this
                .codec
                .decrypt_block(&this.key, this.block_index, &this.inbuf)
            {
                Ok(plain) => {
                    this.block_index += 1;
                    this.inbuf.clear();
                    let mut plain = Bytes::from(plain);
                    if this.skip > 0 {
                        let skip = this.skip.min(plain.len());
                        plain.advance(skip);
                        this.skip -= skip;
                    }
                    this.out = plain;
                }
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }
}
