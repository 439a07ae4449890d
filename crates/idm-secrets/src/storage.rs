//! Confidential storage: the external secret store used by provisioning.
//!
//! Values are keyed by an owner id (the provisioning operation) and a key
//! string. The in-memory implementation keeps only ciphertext.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{GuardedString, SecretCipher, SecretError, SecretResult};

/// A single staged change to the confidential storage.
#[derive(Debug, Clone)]
pub enum SecretWrite {
    /// Store `value` under (`owner_id`, `key`), replacing any previous value.
    Put {
        owner_id: Uuid,
        key: String,
        value: GuardedString,
    },
    /// Remove the value under (`owner_id`, `key`) if present.
    Remove { owner_id: Uuid, key: String },
}

impl SecretWrite {
    /// Owner the write applies to.
    #[must_use]
    pub fn owner_id(&self) -> Uuid {
        match self {
            Self::Put { owner_id, .. } | Self::Remove { owner_id, .. } => *owner_id,
        }
    }
}

/// Secret store keyed by (owner id, key).
#[async_trait]
pub trait ConfidentialStorage: Send + Sync {
    /// Store a value.
    async fn save(&self, owner_id: Uuid, key: &str, value: &GuardedString) -> SecretResult<()>;

    /// Read a value, `None` when absent.
    async fn get(&self, owner_id: Uuid, key: &str) -> SecretResult<Option<GuardedString>>;

    /// Remove a value. Returns whether something was removed.
    async fn delete(&self, owner_id: Uuid, key: &str) -> SecretResult<bool>;

    /// Keys stored for an owner.
    async fn keys(&self, owner_id: Uuid) -> SecretResult<Vec<String>>;

    /// Apply a set of writes all-or-nothing.
    async fn apply(&self, writes: Vec<SecretWrite>) -> SecretResult<()>;
}

/// In-memory confidential storage holding encrypted values.
#[derive(Debug, Clone)]
pub struct InMemoryConfidentialStorage {
    cipher: SecretCipher,
    entries: Arc<RwLock<HashMap<(Uuid, String), Vec<u8>>>>,
}

impl Default for InMemoryConfidentialStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConfidentialStorage {
    /// Create a store with an ephemeral key.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cipher(SecretCipher::ephemeral())
    }

    /// Create a store using the given cipher.
    #[must_use]
    pub fn with_cipher(cipher: SecretCipher) -> Self {
        Self {
            cipher,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Raw sealed bytes of an entry.
    pub async fn sealed(&self, owner_id: Uuid, key: &str) -> Option<Vec<u8>> {
        self.entries
            .read()
            .await
            .get(&(owner_id, key.to_string()))
            .cloned()
    }

    /// Clear all data.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of stored values.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ConfidentialStorage for InMemoryConfidentialStorage {
    async fn save(&self, owner_id: Uuid, key: &str, value: &GuardedString) -> SecretResult<()> {
        let sealed = self.cipher.encrypt(owner_id, value)?;
        self.entries
            .write()
            .await
            .insert((owner_id, key.to_string()), sealed);
        Ok(())
    }

    async fn get(&self, owner_id: Uuid, key: &str) -> SecretResult<Option<GuardedString>> {
        let entries = self.entries.read().await;
        entries
            .get(&(owner_id, key.to_string()))
            .map(|sealed| self.cipher.decrypt(owner_id, sealed))
            .transpose()
    }

    async fn delete(&self, owner_id: Uuid, key: &str) -> SecretResult<bool> {
        Ok(self
            .entries
            .write()
            .await
            .remove(&(owner_id, key.to_string()))
            .is_some())
    }

    async fn keys(&self, owner_id: Uuid) -> SecretResult<Vec<String>> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|(owner, _)| *owner == owner_id)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn apply(&self, writes: Vec<SecretWrite>) -> SecretResult<()> {
        // Seal everything before touching the map so a failure leaves it unchanged.
        let mut sealed = Vec::with_capacity(writes.len());
        for write in writes {
            match write {
                SecretWrite::Put {
                    owner_id,
                    key,
                    value,
                } => sealed.push(((owner_id, key), Some(self.cipher.encrypt(owner_id, &value)?))),
                SecretWrite::Remove { owner_id, key } => sealed.push(((owner_id, key), None)),
            }
        }

        let mut entries = self.entries.write().await;
        for (entry_key, value) in sealed {
            match value {
                Some(bytes) => {
                    entries.insert(entry_key, bytes);
                }
                None => {
                    entries.remove(&entry_key);
                }
            }
        }
        Ok(())
    }
}

/// Fetch a value that must exist.
pub async fn require(
    storage: &dyn ConfidentialStorage,
    owner_id: Uuid,
    key: &str,
) -> SecretResult<GuardedString> {
    storage
        .get(owner_id, key)
        .await?
        .ok_or_else(|| SecretError::NotFound {
            owner_id,
            key: key.to_string(),
        })
}
