use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{KeyGenerator, KEY_LEN};

/// A [KeyGenerator] that HMAC-SHA256s the root key with the full backend
/// key path.
pub struct HmacKeyGenerator {
    key: Vec<u8>,
}

impl HmacKeyGenerator {
    pub fn new(root_key: &[u8]) -> Self {
        Self {
            key: root_key.to_vec(),
        }
    }
}

impl KeyGenerator for HmacKeyGenerator {
    fn key_for_path(&self, path: &str) -> [u8; KEY_LEN] {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(path.as_bytes());
        mac.finalize().into_bytes().into()
    }
}
