//! In-memory stores for tests and embedded use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idm_core::{
    AccountId, BatchId, BreakConfigId, EntityId, OperationId, SystemEntityId, SystemId,
    SystemMappingId,
};
use idm_connector::OperationType;
use idm_secrets::{ConfidentialStorage, InMemoryConfidentialStorage, SecretWrite};
use tokio::sync::RwLock;

use super::{
    AccountStore, BreakConfigStore, EntityLookup, MappingStore, ProvisioningStore, StagedWrite,
    StoreError, StoreResult, SystemEntityStore, SystemStore, UnitOfWork,
};
use crate::breaker::ProvisioningBreakConfig;
use crate::mapping::{AttributeMapping, MappingPurpose, SystemMapping};
use crate::model::{
    Account, AccountAttributeOverride, ProvisioningEntity, System, SystemEntity, SystemEntityType,
};
use crate::operation::{
    OperationState, ProvisioningArchive, ProvisioningAttribute, ProvisioningBatch,
    ProvisioningOperation,
};

// ============================================================================
// Provisioning queue
// ============================================================================

#[derive(Debug, Clone, Default)]
struct QueueTables {
    operations: HashMap<OperationId, ProvisioningOperation>,
    batches: HashMap<BatchId, ProvisioningBatch>,
    archives: Vec<ProvisioningArchive>,
    attributes: HashMap<OperationId, Vec<ProvisioningAttribute>>,
}

impl QueueTables {
    fn apply(&mut self, write: StagedWrite, secrets: &mut Vec<SecretWrite>) -> StoreResult<()> {
        match write {
            StagedWrite::SaveOperation(operation) => {
                self.operations.insert(operation.id, *operation);
            }
            StagedWrite::EnqueueOperation {
                mut operation,
                batch,
            } => {
                let existing = self
                    .batches
                    .values()
                    .find(|b| {
                        b.system_id == batch.system_id
                            && b.system_entity_id == batch.system_entity_id
                    })
                    .map(|b| b.id);
                let batch_id = match existing {
                    Some(id) => id,
                    None => {
                        let id = batch.id;
                        self.batches.insert(id, batch);
                        id
                    }
                };
                operation.batch_id = Some(batch_id);
                self.operations.insert(operation.id, *operation);
            }
            StagedWrite::ClaimOperation {
                operation,
                expected_state,
                expected_attempt,
            } => {
                let claimable = self.operations.get(&operation.id).is_some_and(|stored| {
                    stored.state() == expected_state
                        && stored.state().is_claimable()
                        && stored.current_attempt == expected_attempt
                });
                if !claimable {
                    return Err(StoreError::NotClaimable {
                        operation_id: operation.id,
                    });
                }
                self.operations.insert(operation.id, *operation);
            }
            StagedWrite::DeleteOperation(id) => {
                self.operations.remove(&id);
            }
            StagedWrite::SaveBatch(batch) => {
                self.batches.insert(batch.id, batch);
            }
            StagedWrite::AppendArchive(archive) => self.archives.push(*archive),
            StagedWrite::ReplaceAttributes {
                operation_id,
                attributes,
            } => {
                self.attributes.insert(operation_id, attributes);
            }
            StagedWrite::DeleteAttributes(operation_id) => {
                self.attributes.remove(&operation_id);
            }
            StagedWrite::Secret(write) => secrets.push(write),
        }
        Ok(())
    }
}

/// In-memory provisioning queue.
///
/// A commit is applied to a copy of the tables, secrets are written, and only
/// then is the copy swapped in.
#[derive(Clone)]
pub struct InMemoryProvisioningStore {
    tables: Arc<RwLock<QueueTables>>,
    secrets: Arc<dyn ConfidentialStorage>,
    fail_next_commit: Arc<AtomicBool>,
}

impl Default for InMemoryProvisioningStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvisioningStore {
    /// Create a store backed by a fresh in-memory confidential storage.
    #[must_use]
    pub fn new() -> Self {
        Self::with_secrets(Arc::new(InMemoryConfidentialStorage::new()))
    }

    /// Create a store writing secrets to `secrets`.
    #[must_use]
    pub fn with_secrets(secrets: Arc<dyn ConfidentialStorage>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(QueueTables::default())),
            secrets,
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make the next commit fail without applying anything (for testing).
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of queued operations.
    pub async fn operation_count(&self) -> usize {
        self.tables.read().await.operations.len()
    }

    /// Number of batches.
    pub async fn batch_count(&self) -> usize {
        self.tables.read().await.batches.len()
    }

    /// Number of archive records.
    pub async fn archive_count(&self) -> usize {
        self.tables.read().await.archives.len()
    }

    /// Clear all data.
    pub async fn clear(&self) {
        *self.tables.write().await = QueueTables::default();
    }
}

#[async_trait]
impl ProvisioningStore for InMemoryProvisioningStore {
    async fn commit(&self, unit: UnitOfWork) -> StoreResult<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "injected commit failure".to_string(),
            });
        }

        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        let mut secrets = Vec::new();
        for write in unit.into_writes() {
            staged.apply(write, &mut secrets)?;
        }
        if !secrets.is_empty() {
            self.secrets.apply(secrets).await?;
        }
        *tables = staged;
        Ok(())
    }

    async fn get_operation(&self, id: OperationId) -> StoreResult<Option<ProvisioningOperation>> {
        Ok(self.tables.read().await.operations.get(&id).cloned())
    }

    async fn list_batch_operations(
        &self,
        batch_id: BatchId,
    ) -> StoreResult<Vec<ProvisioningOperation>> {
        Ok(self
            .tables
            .read()
            .await
            .operations
            .values()
            .filter(|op| op.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn list_operations_in_state(
        &self,
        state: OperationState,
    ) -> StoreResult<Vec<ProvisioningOperation>> {
        let mut operations: Vec<ProvisioningOperation> = self
            .tables
            .read()
            .await
            .operations
            .values()
            .filter(|op| op.state() == state)
            .cloned()
            .collect();
        operations.sort_by_key(ProvisioningOperation::timeline_key);
        Ok(operations)
    }

    async fn get_batch(&self, id: BatchId) -> StoreResult<Option<ProvisioningBatch>> {
        Ok(self.tables.read().await.batches.get(&id).cloned())
    }

    async fn find_batch(
        &self,
        system_id: SystemId,
        system_entity_id: SystemEntityId,
    ) -> StoreResult<Option<ProvisioningBatch>> {
        Ok(self
            .tables
            .read()
            .await
            .batches
            .values()
            .find(|b| b.system_id == system_id && b.system_entity_id == system_entity_id)
            .cloned())
    }

    async fn list_due_batches(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ProvisioningBatch>> {
        let mut due: Vec<ProvisioningBatch> = self
            .tables
            .read()
            .await
            .batches
            .values()
            .filter(|b| b.next_attempt.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|b| (b.next_attempt, b.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn list_archives(
        &self,
        system_entity_id: SystemEntityId,
    ) -> StoreResult<Vec<ProvisioningArchive>> {
        Ok(self
            .tables
            .read()
            .await
            .archives
            .iter()
            .filter(|a| a.system_entity_id == Some(system_entity_id))
            .cloned()
            .collect())
    }

    async fn list_attributes(
        &self,
        operation_id: OperationId,
    ) -> StoreResult<Vec<ProvisioningAttribute>> {
        Ok(self
            .tables
            .read()
            .await
            .attributes
            .get(&operation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn purge_operation(&self, id: OperationId) -> StoreResult<bool> {
        Ok(self.tables.write().await.operations.remove(&id).is_some())
    }

    fn confidential_storage(&self) -> Arc<dyn ConfidentialStorage> {
        Arc::clone(&self.secrets)
    }
}

// ============================================================================
// Accounts and system entities
// ============================================================================

/// In-memory account store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccountStore {
    accounts: Arc<RwLock<HashMap<AccountId, Account>>>,
}

impl InMemoryAccountStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accounts.
    pub async fn count(&self) -> usize {
        self.accounts.read().await.len()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.accounts.read().await.get(&id).cloned())
    }

    async fn save(&self, account: &Account) -> StoreResult<()> {
        self.accounts
            .write()
            .await
            .insert(account.id, account.clone());
        Ok(())
    }

    async fn find_by_uid(&self, system_id: SystemId, uid: &str) -> StoreResult<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| a.system_id == system_id && a.uid == uid)
            .cloned())
    }

    async fn find_by_system_entity(
        &self,
        system_entity_id: SystemEntityId,
    ) -> StoreResult<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| a.system_entity_id == Some(system_entity_id))
            .cloned())
    }

    async fn list_by_entity(&self, entity_id: EntityId) -> StoreResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .read()
            .await
            .values()
            .filter(|a| a.entity_id == entity_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(accounts)
    }
}

/// In-memory system entity store.
#[derive(Debug, Clone, Default)]
pub struct InMemorySystemEntityStore {
    entities: Arc<RwLock<HashMap<SystemEntityId, SystemEntity>>>,
}

impl InMemorySystemEntityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SystemEntityStore for InMemorySystemEntityStore {
    async fn get(&self, id: SystemEntityId) -> StoreResult<Option<SystemEntity>> {
        Ok(self.entities.read().await.get(&id).cloned())
    }

    async fn find(
        &self,
        system_id: SystemId,
        entity_type: SystemEntityType,
        uid: &str,
    ) -> StoreResult<Option<SystemEntity>> {
        Ok(self
            .entities
            .read()
            .await
            .values()
            .find(|e| e.system_id == system_id && e.entity_type == entity_type && e.uid == uid)
            .cloned())
    }

    async fn save(&self, entity: &SystemEntity) -> StoreResult<()> {
        let mut entities = self.entities.write().await;
        let clash = entities.values().any(|e| {
            e.id != entity.id
                && e.system_id == entity.system_id
                && e.entity_type == entity.entity_type
                && e.uid == entity.uid
        });
        if clash {
            return Err(StoreError::Conflict {
                message: format!(
                    "system entity '{}' already exists on system {}",
                    entity.uid, entity.system_id
                ),
            });
        }
        entities.insert(entity.id, entity.clone());
        Ok(())
    }
}

// ============================================================================
// Systems, mappings and entities
// ============================================================================

/// In-memory system catalogue.
#[derive(Debug, Clone, Default)]
pub struct InMemorySystemStore {
    systems: Arc<RwLock<HashMap<SystemId, System>>>,
}

impl InMemorySystemStore {
    /// Create an empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a system.
    pub async fn insert(&self, system: System) {
        self.systems.write().await.insert(system.id, system);
    }
}

#[async_trait]
impl SystemStore for InMemorySystemStore {
    async fn get(&self, id: SystemId) -> StoreResult<Option<System>> {
        Ok(self.systems.read().await.get(&id).cloned())
    }
}

#[derive(Debug, Default)]
struct MappingTables {
    system_mappings: HashMap<SystemMappingId, SystemMapping>,
    attributes: Vec<AttributeMapping>,
    role_overloads: HashMap<AccountId, Vec<AttributeMapping>>,
    account_overrides: HashMap<AccountId, Vec<AccountAttributeOverride>>,
}

/// In-memory mapping configuration.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMappingStore {
    tables: Arc<RwLock<MappingTables>>,
}

impl InMemoryMappingStore {
    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a system mapping.
    pub async fn insert_system_mapping(&self, mapping: SystemMapping) {
        self.tables
            .write()
            .await
            .system_mappings
            .insert(mapping.id, mapping);
    }

    /// Register a default attribute mapping.
    pub async fn insert_attribute(&self, mapping: AttributeMapping) {
        self.tables.write().await.attributes.push(mapping);
    }

    /// Attach a role overload to an account, as if a role granting it were assigned.
    pub async fn grant_overload(&self, account_id: AccountId, overload: AttributeMapping) {
        self.tables
            .write()
            .await
            .role_overloads
            .entry(account_id)
            .or_default()
            .push(overload);
    }

    /// Register an account-level override.
    pub async fn insert_account_override(&self, value: AccountAttributeOverride) {
        self.tables
            .write()
            .await
            .account_overrides
            .entry(value.account_id)
            .or_default()
            .push(value);
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn find_provisioning_mapping(
        &self,
        system_id: SystemId,
        entity_type: SystemEntityType,
    ) -> StoreResult<Option<SystemMapping>> {
        Ok(self
            .tables
            .read()
            .await
            .system_mappings
            .values()
            .find(|m| {
                m.system_id == system_id
                    && m.entity_type == entity_type
                    && m.purpose == MappingPurpose::Provisioning
            })
            .cloned())
    }

    async fn get_system_mapping(&self, id: SystemMappingId) -> StoreResult<Option<SystemMapping>> {
        Ok(self.tables.read().await.system_mappings.get(&id).cloned())
    }

    async fn list_attributes(
        &self,
        system_mapping_id: SystemMappingId,
    ) -> StoreResult<Vec<AttributeMapping>> {
        Ok(self
            .tables
            .read()
            .await
            .attributes
            .iter()
            .filter(|m| m.system_mapping_id == system_mapping_id)
            .cloned()
            .collect())
    }

    async fn list_role_overloads(
        &self,
        account_id: AccountId,
        system_mapping_id: SystemMappingId,
    ) -> StoreResult<Vec<AttributeMapping>> {
        Ok(self
            .tables
            .read()
            .await
            .role_overloads
            .get(&account_id)
            .map(|overloads| {
                overloads
                    .iter()
                    .filter(|m| m.system_mapping_id == system_mapping_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_account_overrides(
        &self,
        account_id: AccountId,
    ) -> StoreResult<Vec<AccountAttributeOverride>> {
        Ok(self
            .tables
            .read()
            .await
            .account_overrides
            .get(&account_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory entity directory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEntityLookup {
    entities: Arc<RwLock<HashMap<EntityId, ProvisioningEntity>>>,
}

impl InMemoryEntityLookup {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an entity.
    pub async fn insert(&self, entity: ProvisioningEntity) {
        self.entities.write().await.insert(entity.id, entity);
    }
}

#[async_trait]
impl EntityLookup for InMemoryEntityLookup {
    async fn load(
        &self,
        id: EntityId,
        entity_type: SystemEntityType,
    ) -> StoreResult<Option<ProvisioningEntity>> {
        Ok(self
            .entities
            .read()
            .await
            .get(&id)
            .filter(|e| e.entity_type == entity_type)
            .cloned())
    }
}

// ============================================================================
// Break configurations
// ============================================================================

/// In-memory break configuration store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBreakConfigStore {
    configs: Arc<RwLock<HashMap<BreakConfigId, ProvisioningBreakConfig>>>,
}

impl InMemoryBreakConfigStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakConfigStore for InMemoryBreakConfigStore {
    async fn get(&self, id: BreakConfigId) -> StoreResult<Option<ProvisioningBreakConfig>> {
        Ok(self.configs.read().await.get(&id).cloned())
    }

    async fn find(
        &self,
        system_id: SystemId,
        operation_type: OperationType,
    ) -> StoreResult<Option<ProvisioningBreakConfig>> {
        Ok(self
            .configs
            .read()
            .await
            .values()
            .find(|c| c.system_id == system_id && c.operation_type == operation_type)
            .cloned())
    }

    async fn list(&self, system_id: SystemId) -> StoreResult<Vec<ProvisioningBreakConfig>> {
        let mut configs: Vec<ProvisioningBreakConfig> = self
            .configs
            .read()
            .await
            .values()
            .filter(|c| c.system_id == system_id)
            .cloned()
            .collect();
        configs.sort_by_key(|c| c.operation_type.as_str());
        Ok(configs)
    }

    async fn save(&self, config: &ProvisioningBreakConfig) -> StoreResult<()> {
        let mut configs = self.configs.write().await;
        let taken = configs.values().any(|c| {
            c.id != config.id
                && c.system_id == config.system_id
                && c.operation_type == config.operation_type
        });
        if taken {
            return Err(StoreError::Conflict {
                message: format!(
                    "break configuration for system {} and {} exists",
                    config.system_id, config.operation_type
                ),
            });
        }
        configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn delete(&self, id: BreakConfigId) -> StoreResult<bool> {
        Ok(self.configs.write().await.remove(&id).is_some())
    }
}
