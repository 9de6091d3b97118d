use bytes::Bytes;
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

use crate::Error;

pub const HASH_LEN: usize = 32;

/// The SHA-256 digest identifying one file's content.
///
/// An older format stored 64 bytes (a 32-byte prefix plus the digest);
/// those are normalized to their trailing 32 bytes when read back. New
/// writes always produce the 32-byte form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        let digest: [u8; HASH_LEN] = Sha256::digest(data).into();
        Self(digest)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }
}

impl From<[u8; HASH_LEN]> for ContentHash {
    fn from(value: [u8; HASH_LEN]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for ContentHash {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Error> {
        let normalized = match value.len() {
            HASH_LEN => value,
            // legacy double-width form: keep the trailing digest
            l if l == HASH_LEN * 2 => &value[HASH_LEN..],
            l => return Err(Error::Integrity(format!("unknown hash length: {}", l))),
        };
        let raw: [u8; HASH_LEN] = normalized.try_into().expect("length checked");
        Ok(Self(raw))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::ContentHash;

    #[test]
    fn known_digest() {
        // sha256("hello")
        let expected =
            hex!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
        assert_eq!(ContentHash::of(b"hello").as_slice(), expected);
    }

    #[test]
    fn legacy_width_normalizes() {
        let digest = ContentHash::of(b"content");
        let mut legacy = vec![0xaau8; 32];
        legacy.extend_from_slice(digest.as_slice());
        assert_eq!(ContentHash::try_from(legacy.as_slice()).unwrap(), digest);
        assert!(ContentHash::try_from(&legacy[..40]).is_err());
    }
}
