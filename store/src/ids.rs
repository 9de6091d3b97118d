//! Random object identifiers and their key layout.
//!
//! Blobs and hashsets are named by 35-byte random IDs (a multiple of 5
//! bits, so base32 wastes no per-character entropy), rendered in a
//! lowercase base32 alphabet that is safe in object keys, and sharded on
//! their first two characters to keep directories small.

use data_encoding::{Encoding, Specification};
use lazy_static::lazy_static;
use rand::RngCore;

use crate::Error;

pub const BLOB_PREFIX: &str = "blob/";
pub const HASH_PREFIX: &str = "hash/";

pub const ID_LEN: usize = 35;

lazy_static! {
    // base32 standard encoding, but lowercase
    static ref PATH_SAFE_BASE32: Encoding = {
        let mut spec = Specification::new();
        spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
        spec.encoding().expect("valid base32 alphabet")
    };
}

/// A 35-byte random identifier naming a blob object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId([u8; ID_LEN]);

impl BlobId {
    pub fn generate() -> Self {
        let mut buf = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut buf);
        Self(buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// The 56-character base32 rendering.
    pub fn encoded(&self) -> String {
        PATH_SAFE_BASE32.encode(&self.0)
    }

    pub fn decode(encoded: &str) -> Result<Self, Error> {
        let raw = PATH_SAFE_BASE32
            .decode(encoded.as_bytes())
            .map_err(|e| Error::Integrity(format!("invalid blob id {:?}: {}", encoded, e)))?;
        Self::try_from(raw.as_slice())
    }

    /// The object key of the blob with this ID.
    pub fn blob_path(&self) -> String {
        format!("{}{}", BLOB_PREFIX, shard(&self.encoded()))
    }
}

impl TryFrom<&[u8]> for BlobId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Error> {
        let raw: [u8; ID_LEN] = value
            .try_into()
            .map_err(|_| Error::Integrity(format!("invalid blob id length: {}", value.len())))?;
        Ok(Self(raw))
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encoded())
    }
}

impl std::fmt::Debug for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encoded())
    }
}

/// Splits an encoded ID into its sharding directory and remainder, e.g.
/// `abcdef…` → `ab/cdef…`.
fn shard(encoded: &str) -> String {
    format!("{}/{}", &encoded[..2], &encoded[2..])
}

/// Mints a fresh sharded key under `prefix`, e.g. `hash/ab/cdef…`.
pub fn random_sharded_key(prefix: &str) -> String {
    format!("{}{}", prefix, shard(&BlobId::generate().encoded()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_roundtrip() {
        let id = BlobId::generate();
        let encoded = id.encoded();
        assert_eq!(encoded.len(), 56);
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(BlobId::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn blob_path_shape() {
        let id = BlobId::generate();
        let path = id.blob_path();
        assert!(path.starts_with("blob/"));
        let rest = &path["blob/".len()..];
        assert_eq!(rest.len(), 57); // 2 + '/' + 54
        assert_eq!(rest.as_bytes()[2], b'/');
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(BlobId::decode("UPPERCASE").is_err());
        assert!(BlobId::decode("abc").is_err());
        assert!(BlobId::try_from(&[0u8; 3][..]).is_err());
    }
}
