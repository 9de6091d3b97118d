//! Master key handling: bare hex keys and the passphrase-locked
//! envelope.
//!
//! A locked key is `lock-<hex(salt ‖ sealed)>`: a 32-byte random salt
//! followed by the master key sealed with a key derived from the
//! passphrase by Argon2id. The seal's nonce is the first 24 bytes of the
//! salt.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use data_encoding::HEXLOWER_PERMISSIVE;
use rand::RngCore;

use crate::Error;

pub const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const LOCK_PREFIX: &str = "lock-";

// Argon2id parameters: 10 passes over 64 MiB with 4 lanes.
const ARGON2_TIME: u32 = 10;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_LANES: u32 = 4;

/// A fresh random 32-byte master key.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn encode_key(key: &[u8; KEY_SIZE]) -> String {
    data_encoding::HEXLOWER.encode(key)
}

fn parse_bare_key(hex_key: &str) -> Result<[u8; KEY_SIZE], Error> {
    let raw = HEXLOWER_PERMISSIVE
        .decode(hex_key.trim().as_bytes())
        .map_err(|e| Error::Input(format!("encryption key is invalid hex: {}", e)))?;
    raw.try_into()
        .map_err(|_| Error::Input("encryption key has invalid length".to_string()))
}

fn derive_lock_key(passphrase: &str, salt: &[u8]) -> Result<(XNonce, Key), Error> {
    let params = argon2::Params::new(ARGON2_MEMORY_KIB, ARGON2_TIME, ARGON2_LANES, Some(KEY_SIZE))
        .map_err(|e| Error::Input(format!("argon2 parameters: {}", e)))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut derived = [0u8; KEY_SIZE];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut derived)
        .map_err(|e| Error::Input(format!("deriving lock key: {}", e)))?;

    let nonce = XNonce::clone_from_slice(&salt[..NONCE_SIZE]);
    Ok((nonce, Key::clone_from_slice(&derived)))
}

/// Seals `key` under `passphrase`, producing the `lock-…` form.
pub fn lock_key(key: &[u8; KEY_SIZE], passphrase: &str) -> Result<String, Error> {
    let salt = generate_key();
    let (nonce, lock) = derive_lock_key(passphrase, &salt)?;
    let sealed = XChaCha20Poly1305::new(&lock)
        .encrypt(&nonce, &key[..])
        .map_err(|_| Error::Input("failed sealing key".to_string()))?;

    let mut blob = Vec::with_capacity(salt.len() + sealed.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&sealed);
    Ok(format!(
        "{}{}",
        LOCK_PREFIX,
        data_encoding::HEXLOWER.encode(&blob)
    ))
}

/// Parses a key string: either bare hex, or the `lock-…` form, in which
/// case `passphrase` is invoked to obtain the passphrase.
pub fn parse_key(
    input: &str,
    passphrase: impl FnOnce() -> Result<String, Error>,
) -> Result<[u8; KEY_SIZE], Error> {
    let input = input.trim();
    let Some(locked) = input.strip_prefix(LOCK_PREFIX) else {
        if input.contains('-') {
            return Err(Error::Input("invalid locked key".to_string()));
        }
        return parse_bare_key(input);
    };

    let blob = HEXLOWER_PERMISSIVE
        .decode(locked.as_bytes())
        .map_err(|e| Error::Input(format!("locked key is invalid hex: {}", e)))?;
    if blob.len() <= KEY_SIZE {
        return Err(Error::Input("locked key too short".to_string()));
    }
    let (salt, sealed) = blob.split_at(KEY_SIZE);

    let passphrase = passphrase()?;
    let (nonce, lock) = derive_lock_key(&passphrase, salt)?;
    let key = XChaCha20Poly1305::new(&lock)
        .decrypt(&nonce, sealed)
        .map_err(|_| Error::Input("failed decrypting key (wrong passphrase?)".to_string()))?;
    key.try_into()
        .map_err(|_| Error::Input("locked key holds an invalid key".to_string()))
}
