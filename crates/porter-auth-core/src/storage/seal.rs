//! Passphrase sealing for the session file.
//!
//! Layout: MAGIC || salt (16) || nonce (12) || ciphertext+tag.
//! The key is derived with Argon2 (default params) from the passphrase and salt.

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use super::{StorageError, StorageResult};

pub(crate) const MAGIC: &[u8; 4] = b"PAS1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

fn derive_key(passphrase: &str, salt: &[u8]) -> StorageResult<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| StorageError::Crypto(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

pub(crate) fn is_sealed(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

pub(crate) fn seal(passphrase: &str, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| StorageError::Crypto("encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(MAGIC.len() + SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub(crate) fn open(passphrase: &str, sealed: &[u8]) -> StorageResult<Vec<u8>> {
    let header = MAGIC.len() + SALT_LEN + NONCE_LEN;
    if !is_sealed(sealed) || sealed.len() < header {
        return Err(StorageError::Crypto("not a sealed document".to_string()));
    }

    let salt = &sealed[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let nonce = &sealed[MAGIC.len() + SALT_LEN..header];
    let key = derive_key(passphrase, salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    cipher
        .decrypt(Nonce::from_slice(nonce), &sealed[header..])
        .map_err(|_| StorageError::Crypto("wrong passphrase or damaged file".to_string()))
}
