//! Encryption of confidential values at rest.
//!
//! AES-256-GCM with a key derived per owner (the provisioning operation id)
//! through HKDF-SHA256. Output layout is `nonce || ciphertext || tag`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use crate::{GuardedString, SecretError, SecretResult};

/// Length of the AES-256 master key in bytes.
pub const KEY_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;

const TAG_LENGTH: usize = 16;

const HKDF_INFO: &[u8] = b"idm-confidential-storage-v1";

/// Encrypts and decrypts confidential values for a given owner.
#[derive(Clone)]
pub struct SecretCipher {
    master_key: [u8; KEY_LENGTH],
}

impl SecretCipher {
    /// Create a cipher from a raw master key.
    #[must_use]
    pub fn new(master_key: [u8; KEY_LENGTH]) -> Self {
        Self { master_key }
    }

    /// Create a cipher with a freshly generated random key.
    ///
    /// Values encrypted with it cannot be read back after the process exits.
    #[must_use]
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    /// Create a cipher from a hex-encoded master key.
    pub fn from_hex(hex_key: &str) -> SecretResult<Self> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| SecretError::ConfigError {
            detail: format!("invalid hex master key: {e}"),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Create a cipher from a base64-encoded master key.
    pub fn from_base64(base64_key: &str) -> SecretResult<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let bytes = STANDARD
            .decode(base64_key.trim())
            .map_err(|e| SecretError::ConfigError {
                detail: format!("invalid base64 master key: {e}"),
            })?;
        Self::from_bytes(&bytes)
    }

    fn from_bytes(bytes: &[u8]) -> SecretResult<Self> {
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| SecretError::ConfigError {
            detail: format!("master key must be {KEY_LENGTH} bytes, got {}", bytes.len()),
        })?;
        Ok(Self::new(key))
    }

    fn owner_cipher(&self, owner_id: Uuid) -> SecretResult<Aes256Gcm> {
        let hkdf = Hkdf::<Sha256>::new(Some(owner_id.as_bytes()), &self.master_key);
        let mut derived = [0u8; KEY_LENGTH];
        hkdf.expand(HKDF_INFO, &mut derived)
            .map_err(|e| SecretError::EncryptionFailed {
                detail: format!("key derivation failed: {e}"),
            })?;
        Aes256Gcm::new_from_slice(&derived).map_err(|e| SecretError::EncryptionFailed {
            detail: format!("failed to create cipher: {e}"),
        })
    }

    /// Encrypt a guarded value for `owner_id`.
    pub fn encrypt(&self, owner_id: Uuid, value: &GuardedString) -> SecretResult<Vec<u8>> {
        let cipher = self.owner_cipher(owner_id)?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, value.expose_secret().as_bytes())
            .map_err(|e| SecretError::EncryptionFailed {
                detail: format!("encryption failed: {e}"),
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a value previously sealed for `owner_id`.
    pub fn decrypt(&self, owner_id: Uuid, sealed: &[u8]) -> SecretResult<GuardedString> {
        if sealed.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(SecretError::DecryptionFailed {
                detail: "ciphertext too short".to_string(),
            });
        }

        let cipher = self.owner_cipher(owner_id).map_err(|e| SecretError::DecryptionFailed {
            detail: e.to_string(),
        })?;
        let (nonce_bytes, encrypted) = sealed.split_at(NONCE_LENGTH);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), encrypted)
            .map_err(|e| SecretError::DecryptionFailed {
                detail: format!("decryption failed: {e}"),
            })?;

        String::from_utf8(plaintext)
            .map(GuardedString::from)
            .map_err(|e| SecretError::DecryptionFailed {
                detail: format!("decrypted value is not valid UTF-8: {e}"),
            })
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}
