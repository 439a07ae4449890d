//! Secret handling for the idm provisioning engine.
//!
//! Provides:
//! - [`GuardedString`]: a secret value that never prints or serializes its plaintext
//! - [`SecretCipher`]: AES-256-GCM encryption with HKDF per-owner key derivation
//! - [`ConfidentialStorage`]: the external secret store keyed by (owner id, key)
//!
//! # Usage
//!
//! ```rust,ignore
//! use idm_secrets::{ConfidentialStorage, GuardedString, InMemoryConfidentialStorage};
//!
//! let storage = InMemoryConfidentialStorage::new();
//! storage.save(owner_id, "sys:account:password:0", &GuardedString::new("s3cret")).await?;
//! let value = storage.get(owner_id, "sys:account:password:0").await?;
//! ```

pub mod cipher;
pub mod config;
pub mod guarded;
pub mod storage;

pub use cipher::SecretCipher;
pub use config::SecretStorageConfig;
pub use guarded::GuardedString;
pub use storage::{ConfidentialStorage, InMemoryConfidentialStorage, SecretWrite};

// ── SecretError ──────────────────────────────────────────────────────────

/// Errors returned by secret handling operations.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// No value stored under the given key.
    #[error("Confidential value not found: owner {owner_id}, key '{key}'")]
    NotFound { owner_id: uuid::Uuid, key: String },

    /// Encrypting a value failed.
    #[error("Encryption failed: {detail}")]
    EncryptionFailed { detail: String },

    /// Decrypting a value failed (wrong key, tampered ciphertext).
    #[error("Decryption failed: {detail}")]
    DecryptionFailed { detail: String },

    /// Configuration error (missing or malformed master key).
    #[error("Secret storage configuration error: {detail}")]
    ConfigError { detail: String },

    /// Backend storage failure.
    #[error("Secret storage unavailable: {detail}")]
    StorageUnavailable { detail: String },
}

/// Result alias for secret operations.
pub type SecretResult<T> = Result<T, SecretError>;
