use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use super::{Codec, KEY_LEN};
use crate::Error;

/// Default plaintext block size, 16 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// XChaCha20-Poly1305 as a [Codec]. Nonces are the block counter,
/// big-endian, in the trailing bytes of the 24-byte nonce; per-path keys
/// make the counter reuse across objects safe.
pub struct XChaChaCodec {
    plaintext_block_size: usize,
}

impl XChaChaCodec {
    /// A good block size is 16*1024, or 16*1024 minus the tag overhead,
    /// depending on your alignment needs.
    pub fn new(plaintext_block_size: usize) -> Self {
        assert!(plaintext_block_size > 0, "block size must be positive");
        Self {
            plaintext_block_size,
        }
    }
}

impl Default for XChaChaCodec {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

fn calc_nonce(block_index: u64) -> XNonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[NONCE_LEN - 8..].copy_from_slice(&block_index.to_be_bytes());
    nonce.into()
}

impl Codec for XChaChaCodec {
    fn plaintext_block_size(&self) -> usize {
        self.plaintext_block_size
    }

    fn overhead(&self) -> usize {
        TAG_LEN
    }

    fn encrypt_block(
        &self,
        key: &[u8; KEY_LEN],
        block_index: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        XChaCha20Poly1305::new(Key::from_slice(key))
            .encrypt(&calc_nonce(block_index), plaintext)
            .map_err(|_| Error::Integrity("failed encrypting block".to_string()))
    }

    fn decrypt_block(
        &self,
        key: &[u8; KEY_LEN],
        block_index: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        XChaCha20Poly1305::new(Key::from_slice(key))
            .decrypt(&calc_nonce(block_index), ciphertext)
            .map_err(|_| Error::Integrity("failed decrypting".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_roundtrip() {
        let codec = XChaChaCodec::new(32);
        let key = [7u8; KEY_LEN];
        let plaintext = [42u8; 32];

        let sealed = codec.encrypt_block(&key, 3, &plaintext).unwrap();
        assert_eq!(sealed.len(), 32 + codec.overhead());
        assert_eq!(codec.decrypt_block(&key, 3, &sealed).unwrap(), plaintext);

        // wrong block index means wrong nonce, which must not open
        assert!(codec.decrypt_block(&key, 4, &sealed).is_err());
        // and neither does a wrong key
        assert!(codec.decrypt_block(&[8u8; KEY_LEN], 3, &sealed).is_err());
    }

    #[test]
    fn nonce_is_big_endian_counter() {
        let nonce = calc_nonce(0x0102030405060708);
        assert_eq!(&nonce[..16], &[0u8; 16]);
        assert_eq!(&nonce[16..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
