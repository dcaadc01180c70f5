//! Snapshot payload encryption
//!
//! Authenticated encryption of persisted snapshot envelopes with
//! AES-256-GCM or ChaCha20-Poly1305. Keys are consumed, not managed:
//! callers may supply a customer-managed key, otherwise one is generated
//! for the engine's lifetime.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Encryption errors
#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid key length: {0} bytes (expected 32)")]
    InvalidKeyLength(usize),

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed (wrong key or corrupted ciphertext)")]
    DecryptFailed,
}

/// Result type for encryption operations
pub type EncryptionResult<T> = Result<T, EncryptionError>;

/// Supported authenticated-encryption methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMethod {
    Aes256Gcm,
    ChaCha20Poly1305,
}

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encryption configuration: method plus key material.
#[derive(Clone)]
pub struct EncryptionConfig {
    pub method: EncryptionMethod,
    key: [u8; KEY_LEN],
}

impl EncryptionConfig {
    /// Config with a freshly generated key.
    pub fn generate(method: EncryptionMethod) -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { method, key }
    }

    /// Config with a customer-managed key (must be 32 bytes).
    pub fn with_key(method: EncryptionMethod, key: &[u8]) -> EncryptionResult<Self> {
        if key.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKeyLength(key.len()));
        }
        let mut fixed = [0u8; KEY_LEN];
        fixed.copy_from_slice(key);
        Ok(Self { method, key: fixed })
    }

    /// Encrypt: returns nonce || ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> EncryptionResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match self.method {
            EncryptionMethod::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&self.key)
                    .map_err(|_| EncryptionError::EncryptFailed)?;
                cipher
                    .encrypt(nonce, plaintext)
                    .map_err(|_| EncryptionError::EncryptFailed)?
            }
            EncryptionMethod::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
                    .map_err(|_| EncryptionError::EncryptFailed)?;
                cipher
                    .encrypt(nonce, plaintext)
                    .map_err(|_| EncryptionError::EncryptFailed)?
            }
        };

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a nonce || ciphertext payload.
    pub fn decrypt(&self, payload: &[u8]) -> EncryptionResult<Vec<u8>> {
        if payload.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        match self.method {
            EncryptionMethod::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&self.key)
                    .map_err(|_| EncryptionError::DecryptFailed)?;
                cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| EncryptionError::DecryptFailed)
            }
            EncryptionMethod::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
                    .map_err(|_| EncryptionError::DecryptFailed)?;
                cipher
                    .decrypt(nonce, ciphertext)
                    .map_err(|_| EncryptionError::DecryptFailed)
            }
        }
    }
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("EncryptionConfig")
            .field("method", &self.method)
            .finish()
    }
}
