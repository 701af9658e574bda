//! Column encryption primitives.
//!
//! Values are sealed with AES-256-GCM. The cipher key is the SHA-256 digest of
//! the configured key string, and every ciphertext carries its own random
//! 96-bit nonce as a prefix:
//!
//! ```text
//! +-----------+----------------------------+
//! | nonce(12) | ciphertext + GCM tag (16)  |
//! +-----------+----------------------------+
//! ```

use crate::error::{StorageError, StorageResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A derived column encryption key.
#[derive(Clone)]
pub struct EncryptionKey {
    cipher: Aes256Gcm,
}

impl EncryptionKey {
    /// Derive the cipher key from the configured key string.
    #[must_use]
    pub fn derive(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&digest),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StorageError::Encryption("failed to encrypt value".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> StorageResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(StorageError::Encryption(format!(
                "ciphertext is {} bytes, shorter than the minimum of {}",
                ciphertext.len(),
                NONCE_LEN + TAG_LEN
            )));
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StorageError::Encryption("failed to decrypt value".to_string()))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// A fresh random check value.
#[must_use]
pub fn new_check_value() -> String {
    uuid::Uuid::new_v4().to_string()
}
