//! Transparent encryption over a [Backend].
//!
//! Objects are encrypted in fixed-size blocks, each sealed independently
//! with an authenticated cipher whose nonce is the block counter. Every
//! object key gets its own derived key, which is what makes the repeating
//! counter nonces safe. Because blocks are independent, a read at any
//! offset only has to fetch and decrypt the blocks that cover it.
//!
//! Keys are *not* encrypted: they are derived from hashes, random IDs,
//! and timestamps, and carry no user data by design.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use jam_backend::{Backend, Error as BackendError, ObjectReader};
use tokio::io::{AsyncRead, AsyncReadExt};

mod encode;
mod keygen;
mod xchacha;

pub use self::encode::{DecodeReader, EncodeReader};
pub use self::keygen::HmacKeyGenerator;
pub use self::xchacha::{XChaChaCodec, DEFAULT_BLOCK_SIZE};

use crate::Error;

pub const KEY_LEN: usize = 32;

/// A reversible, authenticated block transformation. Plaintext blocks of
/// [Codec::plaintext_block_size] bytes map one-to-one onto ciphertext
/// blocks that are [Codec::overhead] bytes longer.
pub trait Codec: Send + Sync {
    fn plaintext_block_size(&self) -> usize;

    /// Extra bytes per block (the authentication tag).
    fn overhead(&self) -> usize;

    fn ciphertext_block_size(&self) -> usize {
        self.plaintext_block_size() + self.overhead()
    }

    /// Seals one block. `plaintext` is always exactly
    /// [Codec::plaintext_block_size] bytes (the writer pads).
    fn encrypt_block(
        &self,
        key: &[u8; KEY_LEN],
        block_index: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error>;

    /// Opens one block, failing on any authentication mismatch.
    fn decrypt_block(
        &self,
        key: &[u8; KEY_LEN],
        block_index: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// Derives the encryption key to use for a given backend key path.
pub trait KeyGenerator: Send + Sync {
    fn key_for_path(&self, path: &str) -> [u8; KEY_LEN];
}

/// Wraps a [Backend] with encryption. All objects written through it are
/// block-encrypted; reads are block-aligned and may therefore return
/// more bytes than requested (leading alignment is discarded here,
/// trailing padding is the caller's to ignore).
pub struct EncryptedBackend {
    inner: Arc<dyn Backend>,
    codec: Arc<dyn Codec>,
    keys: Arc<dyn KeyGenerator>,
}

impl EncryptedBackend {
    pub fn new(
        codec: Arc<dyn Codec>,
        keys: Arc<dyn KeyGenerator>,
        inner: Arc<dyn Backend>,
    ) -> Self {
        Self { inner, codec, keys }
    }
}

#[async_trait]
impl Backend for EncryptedBackend {
    async fn get(
        &self,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ObjectReader, BackendError> {
        if length == Some(0) {
            return Ok(Box::new(Cursor::new(Vec::new())));
        }
        let key = self.keys.key_for_path(path);
        let plain_block = self.codec.plaintext_block_size() as u64;
        let cipher_block = self.codec.ciphertext_block_size() as u64;

        let first_block = offset / plain_block;
        let cipher_offset = first_block * cipher_block;
        let cipher_length = length.map(|length| {
            let last_block = (offset + length - 1) / plain_block;
            (last_block - first_block + 1) * cipher_block
        });

        let inner = self.inner.get(path, cipher_offset, cipher_length).await?;
        let inner: ObjectReader = match cipher_length {
            // the backend may return more than asked; don't decrypt past
            // the blocks we computed
            Some(length) => Box::new(inner.take(length)),
            None => inner,
        };

        Ok(Box::new(DecodeReader::new(
            inner,
            self.codec.clone(),
            key,
            first_block,
            (offset - first_block * plain_block) as usize,
        )))
    }

    async fn put(
        &self,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), BackendError> {
        let key = self.keys.key_for_path(path);
        let mut encrypted = EncodeReader::new(data, self.codec.clone(), key);
        self.inner.put(path, &mut encrypted).await
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.inner.delete(path).await
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, BackendError>> {
        self.inner.list(prefix)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jam_backend::{Backend, MemoryBackend};
    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    use super::{EncryptedBackend, HmacKeyGenerator, XChaChaCodec};

    fn encrypted(inner: Arc<MemoryBackend>) -> EncryptedBackend {
        EncryptedBackend::new(
            Arc::new(XChaChaCodec::new(64)),
            Arc::new(HmacKeyGenerator::new(b"hello")),
            inner,
        )
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one_byte(1)]
    #[case::under_block(63)]
    #[case::exact_block(64)]
    #[case::over_block(65)]
    #[case::many_blocks(64 * 37 + 11)]
    #[tokio::test]
    async fn roundtrip(#[case] len: usize) {
        let inner = Arc::new(MemoryBackend::new());
        let enc = encrypted(inner.clone());
        let data = pattern(len);

        let mut source = std::io::Cursor::new(data.clone());
        enc.put("some/path", &mut source).await.unwrap();

        let mut plain = Vec::new();
        enc.get("some/path", 0, None)
            .await
            .unwrap()
            .read_to_end(&mut plain)
            .await
            .unwrap();
        // full reads include the zero padding of the final block
        assert!(plain.len() >= data.len());
        assert_eq!(&plain[..data.len()], &data[..]);
        assert!(plain[data.len()..].iter().all(|&b| b == 0));

        // the stored ciphertext really is ciphertext
        if len > 0 {
            let mut stored = Vec::new();
            inner
                .get("some/path", 0, None)
                .await
                .unwrap()
                .read_to_end(&mut stored)
                .await
                .unwrap();
            assert_ne!(&stored[..data.len().min(stored.len())], &data[..]);
            assert_eq!(stored.len() % (64 + 16), 0);
        }
    }

    #[rstest]
    #[case(0, 10)]
    #[case(1, 5)]
    #[case(63, 2)]
    #[case(64, 64)]
    #[case(100, 200)]
    #[case(1000, 17)]
    #[tokio::test]
    async fn partial_reads(#[case] offset: usize, #[case] length: usize) {
        let inner = Arc::new(MemoryBackend::new());
        let enc = encrypted(inner);
        let data = pattern(64 * 20 + 13);

        let mut source = std::io::Cursor::new(data.clone());
        enc.put("p", &mut source).await.unwrap();

        let mut got = Vec::new();
        enc.get("p", offset as u64, Some(length as u64))
            .await
            .unwrap()
            .read_to_end(&mut got)
            .await
            .unwrap();
        got.truncate(length);
        let expected = &data[offset..(offset + length).min(data.len())];
        assert_eq!(&got[..expected.len()], expected);
    }

    #[tokio::test]
    async fn tampering_fails_the_read() {
        let inner = Arc::new(MemoryBackend::new());
        let enc = encrypted(inner.clone());

        let mut source = std::io::Cursor::new(pattern(500));
        enc.put("p", &mut source).await.unwrap();

        let mut stored = Vec::new();
        inner
            .get("p", 0, None)
            .await
            .unwrap()
            .read_to_end(&mut stored)
            .await
            .unwrap();
        stored[100] ^= 0x01;
        let mut corrupted = std::io::Cursor::new(stored);
        inner.put("p", &mut corrupted).await.unwrap();

        let mut sink = Vec::new();
        let err = enc
            .get("p", 0, None)
            .await
            .unwrap()
            .read_to_end(&mut sink)
            .await
            .expect_err("tampered ciphertext must not decrypt");
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn keys_differ_per_path() {
        let inner = Arc::new(MemoryBackend::new());
        let enc = encrypted(inner.clone());
        let data = pattern(64);

        let mut a = std::io::Cursor::new(data.clone());
        enc.put("path/a", &mut a).await.unwrap();
        let mut b = std::io::Cursor::new(data);
        enc.put("path/b", &mut b).await.unwrap();

        let mut raw_a = Vec::new();
        let mut raw_b = Vec::new();
        inner
            .get("path/a", 0, None)
            .await
            .unwrap()
            .read_to_end(&mut raw_a)
            .await
            .unwrap();
        inner
            .get("path/b", 0, None)
            .await
            .unwrap()
            .read_to_end(&mut raw_b)
            .await
            .unwrap();
        assert_ne!(raw_a, raw_b);
    }
}
