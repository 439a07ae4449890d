//! Confidential storage configuration parsed from environment variables.

use std::env;

use crate::{SecretCipher, SecretError};

/// Environment variable holding the master key (hex or base64).
pub const MASTER_KEY_ENV: &str = "IDM_SECRET_MASTER_KEY";

/// Configuration of the confidential storage.
#[derive(Clone, Default)]
pub struct SecretStorageConfig {
    /// Master key as configured, hex or base64 encoded.
    pub master_key: Option<String>,
}

impl std::fmt::Debug for SecretStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStorageConfig")
            .field(
                "master_key",
                &self.master_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl SecretStorageConfig {
    /// Load configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            master_key: env::var(MASTER_KEY_ENV).ok().filter(|v| !v.trim().is_empty()),
        }
    }

    /// Build the cipher for this configuration.
    ///
    /// A 64-character value is read as hex, anything else as base64. Without a
    /// configured key an ephemeral one is generated and a warning is logged.
    pub fn cipher(&self) -> Result<SecretCipher, SecretError> {
        match self.master_key.as_deref().map(str::trim) {
            Some(key) if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) => {
                SecretCipher::from_hex(key)
            }
            Some(key) => SecretCipher::from_base64(key),
            None => {
                tracing::warn!(
                    env = MASTER_KEY_ENV,
                    "No master key configured, confidential values will not survive a restart"
                );
                Ok(SecretCipher::ephemeral())
            }
        }
    }
}
