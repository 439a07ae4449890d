//! Persistence seams of the provisioning engine.
//!
//! Every collaborator owning data is a `Send + Sync` trait with an in-memory
//! implementation in [`memory`]. The operation queue persists through a
//! [`UnitOfWork`]: writes are staged in memory and applied atomically by
//! [`ProvisioningStore::commit`]. Dropping a unit without committing discards
//! it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idm_core::{
    AccountId, BatchId, BreakConfigId, EntityId, OperationId, SystemEntityId, SystemId,
    SystemMappingId,
};
use idm_connector::OperationType;
use idm_secrets::{ConfidentialStorage, GuardedString, SecretError, SecretWrite};
use std::sync::Arc;
use thiserror::Error;

use crate::breaker::ProvisioningBreakConfig;
use crate::mapping::{AttributeMapping, SystemMapping};
use crate::model::{
    Account, AccountAttributeOverride, ProvisioningEntity, System, SystemEntity, SystemEntityType,
};
use crate::operation::{
    OperationState, ProvisioningArchive, ProvisioningAttribute, ProvisioningBatch,
    ProvisioningOperation,
};

// ============================================================================
// Errors
// ============================================================================

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or query failed.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// A uniqueness constraint was violated.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The operation was changed or claimed by another caller.
    #[error("Operation {operation_id} cannot be claimed")]
    NotClaimable { operation_id: OperationId },

    /// A persisted row could not be decoded.
    #[error("Corrupt row: {message}")]
    Corrupt { message: String },

    /// Serialization of a JSON column failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Confidential storage failure during commit.
    #[error("Secret storage error: {0}")]
    Secret(#[from] SecretError),
}

/// Result alias for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Unit of work
// ============================================================================

/// A staged write of the provisioning queue.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    SaveOperation(Box<ProvisioningOperation>),
    /// Insert an operation into the batch of its system entity, creating
    /// `batch` when the entity has none yet.
    EnqueueOperation {
        operation: Box<ProvisioningOperation>,
        batch: ProvisioningBatch,
    },
    /// Replace an operation only while its stored row still has the expected
    /// state and attempt; fails with [`StoreError::NotClaimable`] otherwise.
    ClaimOperation {
        operation: Box<ProvisioningOperation>,
        expected_state: OperationState,
        expected_attempt: u32,
    },
    DeleteOperation(OperationId),
    SaveBatch(ProvisioningBatch),
    AppendArchive(Box<ProvisioningArchive>),
    ReplaceAttributes {
        operation_id: OperationId,
        attributes: Vec<ProvisioningAttribute>,
    },
    DeleteAttributes(OperationId),
    Secret(SecretWrite),
}

/// Writes applied together or not at all.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    writes: Vec<StagedWrite>,
}

impl UnitOfWork {
    /// Start an empty unit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an operation row.
    pub fn save_operation(&mut self, operation: &ProvisioningOperation) {
        self.writes
            .push(StagedWrite::SaveOperation(Box::new(operation.clone())));
    }

    /// Insert a new operation, attaching it to the existing batch of its
    /// (system, system entity) or to `batch` when there is none.
    pub fn enqueue_operation(&mut self, operation: &ProvisioningOperation, batch: ProvisioningBatch) {
        self.writes.push(StagedWrite::EnqueueOperation {
            operation: Box::new(operation.clone()),
            batch,
        });
    }

    /// Move `claimed` into place if the stored row still matches `current`.
    pub fn claim_operation(
        &mut self,
        claimed: &ProvisioningOperation,
        current: &ProvisioningOperation,
    ) {
        self.writes.push(StagedWrite::ClaimOperation {
            operation: Box::new(claimed.clone()),
            expected_state: current.state(),
            expected_attempt: current.current_attempt,
        });
    }

    /// Remove an operation row.
    pub fn delete_operation(&mut self, id: OperationId) {
        self.writes.push(StagedWrite::DeleteOperation(id));
    }

    /// Insert or replace a batch.
    pub fn save_batch(&mut self, batch: &ProvisioningBatch) {
        self.writes.push(StagedWrite::SaveBatch(batch.clone()));
    }

    /// Append an archive record.
    pub fn append_archive(&mut self, archive: ProvisioningArchive) {
        self.writes.push(StagedWrite::AppendArchive(Box::new(archive)));
    }

    /// Replace the diff rows of an operation.
    pub fn replace_attributes(
        &mut self,
        operation_id: OperationId,
        attributes: Vec<ProvisioningAttribute>,
    ) {
        self.writes.push(StagedWrite::ReplaceAttributes {
            operation_id,
            attributes,
        });
    }

    /// Remove the diff rows of an operation.
    pub fn delete_attributes(&mut self, operation_id: OperationId) {
        self.writes.push(StagedWrite::DeleteAttributes(operation_id));
    }

    /// Store a secret of an operation.
    pub fn put_secret(&mut self, operation_id: OperationId, key: &str, value: GuardedString) {
        self.writes.push(StagedWrite::Secret(SecretWrite::Put {
            owner_id: operation_id.into_inner(),
            key: key.to_string(),
            value,
        }));
    }

    /// Remove a secret of an operation.
    pub fn remove_secret(&mut self, operation_id: OperationId, key: &str) {
        self.writes.push(StagedWrite::Secret(SecretWrite::Remove {
            owner_id: operation_id.into_inner(),
            key: key.to_string(),
        }));
    }

    /// Whether nothing was staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Consume the unit, returning its writes in staging order.
    #[must_use]
    pub fn into_writes(self) -> Vec<StagedWrite> {
        self.writes
    }
}

// ============================================================================
// Store traits
// ============================================================================

/// Queue, batch, archive and diff-row persistence.
#[async_trait]
pub trait ProvisioningStore: Send + Sync {
    /// Apply a unit of work atomically.
    async fn commit(&self, unit: UnitOfWork) -> StoreResult<()>;

    /// Get an operation.
    async fn get_operation(&self, id: OperationId) -> StoreResult<Option<ProvisioningOperation>>;

    /// Operations of a batch, in no particular order.
    async fn list_batch_operations(&self, batch_id: BatchId)
        -> StoreResult<Vec<ProvisioningOperation>>;

    /// Operations in a given state.
    async fn list_operations_in_state(
        &self,
        state: OperationState,
    ) -> StoreResult<Vec<ProvisioningOperation>>;

    /// Get a batch.
    async fn get_batch(&self, id: BatchId) -> StoreResult<Option<ProvisioningBatch>>;

    /// Batch of a (system, system entity).
    async fn find_batch(
        &self,
        system_id: SystemId,
        system_entity_id: SystemEntityId,
    ) -> StoreResult<Option<ProvisioningBatch>>;

    /// Batches whose next attempt is due at `now`, earliest first.
    async fn list_due_batches(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ProvisioningBatch>>;

    /// Archive records of a system entity, oldest first.
    async fn list_archives(
        &self,
        system_entity_id: SystemEntityId,
    ) -> StoreResult<Vec<ProvisioningArchive>>;

    /// Diff rows of an operation.
    async fn list_attributes(
        &self,
        operation_id: OperationId,
    ) -> StoreResult<Vec<ProvisioningAttribute>>;

    /// Remove an operation row directly, bypassing archival and cleanup.
    async fn purge_operation(&self, id: OperationId) -> StoreResult<bool>;

    /// Secret store the unit of work writes secrets to.
    fn confidential_storage(&self) -> Arc<dyn ConfidentialStorage>;
}

/// Account persistence.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Get an account.
    async fn get(&self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Insert or replace an account.
    async fn save(&self, account: &Account) -> StoreResult<()>;

    /// Account with `uid` on `system_id`.
    async fn find_by_uid(&self, system_id: SystemId, uid: &str) -> StoreResult<Option<Account>>;

    /// Account linked to a system entity.
    async fn find_by_system_entity(
        &self,
        system_entity_id: SystemEntityId,
    ) -> StoreResult<Option<Account>>;

    /// Accounts owned by an entity.
    async fn list_by_entity(&self, entity_id: EntityId) -> StoreResult<Vec<Account>>;
}

/// System entity persistence.
#[async_trait]
pub trait SystemEntityStore: Send + Sync {
    /// Get a system entity.
    async fn get(&self, id: SystemEntityId) -> StoreResult<Option<SystemEntity>>;

    /// System entity keyed by (system, entity type, uid).
    async fn find(
        &self,
        system_id: SystemId,
        entity_type: SystemEntityType,
        uid: &str,
    ) -> StoreResult<Option<SystemEntity>>;

    /// Insert or replace a system entity.
    async fn save(&self, entity: &SystemEntity) -> StoreResult<()>;
}

/// Target systems.
#[async_trait]
pub trait SystemStore: Send + Sync {
    /// Get a system.
    async fn get(&self, id: SystemId) -> StoreResult<Option<System>>;
}

/// Attribute mappings, role overloads and account overrides.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Provisioning mapping of (system, entity type).
    async fn find_provisioning_mapping(
        &self,
        system_id: SystemId,
        entity_type: SystemEntityType,
    ) -> StoreResult<Option<SystemMapping>>;

    /// Get a system mapping.
    async fn get_system_mapping(&self, id: SystemMappingId) -> StoreResult<Option<SystemMapping>>;

    /// Default attribute mappings of a system mapping.
    async fn list_attributes(
        &self,
        system_mapping_id: SystemMappingId,
    ) -> StoreResult<Vec<AttributeMapping>>;

    /// Overloads defined by the roles granting `account_id`.
    async fn list_role_overloads(
        &self,
        account_id: AccountId,
        system_mapping_id: SystemMappingId,
    ) -> StoreResult<Vec<AttributeMapping>>;

    /// Account-level overrides of `account_id`.
    async fn list_account_overrides(
        &self,
        account_id: AccountId,
    ) -> StoreResult<Vec<AccountAttributeOverride>>;
}

/// Loads the internal entity behind an account.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    /// Load an entity.
    async fn load(
        &self,
        id: EntityId,
        entity_type: SystemEntityType,
    ) -> StoreResult<Option<ProvisioningEntity>>;
}

/// Provisioning break configuration persistence.
#[async_trait]
pub trait BreakConfigStore: Send + Sync {
    /// Get a configuration.
    async fn get(&self, id: BreakConfigId) -> StoreResult<Option<ProvisioningBreakConfig>>;

    /// Configuration of (system, operation type).
    async fn find(
        &self,
        system_id: SystemId,
        operation_type: OperationType,
    ) -> StoreResult<Option<ProvisioningBreakConfig>>;

    /// Configurations of a system.
    async fn list(&self, system_id: SystemId) -> StoreResult<Vec<ProvisioningBreakConfig>>;

    /// Insert or replace a configuration.
    ///
    /// Fails with [`StoreError::Conflict`] when another configuration already
    /// covers the same (system, operation type).
    async fn save(&self, config: &ProvisioningBreakConfig) -> StoreResult<()>;

    /// Remove a configuration.
    async fn delete(&self, id: BreakConfigId) -> StoreResult<bool>;
}

/// The read-side collaborators of the provisioning service.
#[derive(Clone)]
pub struct ProvisioningStores {
    pub accounts: Arc<dyn AccountStore>,
    pub system_entities: Arc<dyn SystemEntityStore>,
    pub systems: Arc<dyn SystemStore>,
    pub mappings: Arc<dyn MappingStore>,
    pub entities: Arc<dyn EntityLookup>,
}
