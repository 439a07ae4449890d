//! Provisioning operations, batches and archive records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use idm_core::{ArchiveId, BatchId, EntityId, MappingId, OperationId, SystemEntityId, SystemId};
use idm_connector::{AttributeValue, ConnectorObject, OperationType};
use serde::{Deserialize, Serialize};

use crate::mapping::{AttributeMapping, AttributeMappingStrategy};
use crate::model::SystemEntityType;

// ============================================================================
// Account object
// ============================================================================

/// Composite key of an account object entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeKey {
    /// Mapping that produced the value (first member for merged attributes).
    pub mapping_id: MappingId,
    /// Schema attribute name on the target.
    pub schema_attribute: String,
    /// Schema attribute class type.
    pub class_type: String,
    /// Strategy the value was resolved with.
    pub strategy: AttributeMappingStrategy,
    /// Send even when unchanged.
    pub send_always: bool,
    /// Skip when null.
    pub send_only_if_not_null: bool,
}

impl AttributeKey {
    /// Key for a compiled mapping.
    #[must_use]
    pub fn for_mapping(mapping: &AttributeMapping) -> Self {
        Self {
            mapping_id: mapping.id,
            schema_attribute: mapping.schema_attribute.name.clone(),
            class_type: mapping.schema_attribute.class_type.clone(),
            strategy: mapping.strategy,
            send_always: mapping.send_always,
            send_only_if_not_null: mapping.send_only_if_not_null,
        }
    }
}

/// One entry of an account object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountObjectEntry {
    pub key: AttributeKey,
    pub value: AttributeValue,
}

/// Desired attribute values of an account, in mapping order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountObject(Vec<AccountObjectEntry>);

impl AccountObject {
    /// Create an empty account object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing an entry with the same key.
    pub fn insert(&mut self, key: AttributeKey, value: AttributeValue) {
        match self.0.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => entry.value = value,
            None => self.0.push(AccountObjectEntry { key, value }),
        }
    }

    /// Value of the first entry targeting `schema_attribute`.
    #[must_use]
    pub fn get(&self, schema_attribute: &str) -> Option<&AttributeValue> {
        self.0
            .iter()
            .find(|entry| entry.key.schema_attribute == schema_attribute)
            .map(|entry| &entry.value)
    }

    /// Whether an entry with `schema_attribute` and `strategy` exists.
    #[must_use]
    pub fn contains(&self, schema_attribute: &str, strategy: AttributeMappingStrategy) -> bool {
        self.0.iter().any(|entry| {
            entry.key.schema_attribute == schema_attribute && entry.key.strategy == strategy
        })
    }

    /// Iterate over the entries.
    pub fn iter(&self) -> impl Iterator<Item = &AccountObjectEntry> {
        self.0.iter()
    }

    /// Iterate mutably over the entries.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AccountObjectEntry> {
        self.0.iter_mut()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Operation result
// ============================================================================

/// State of a provisioning operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    /// Accepted by the queue, not yet sent.
    Created,
    /// Being sent to the target.
    Running,
    /// Sent successfully.
    Executed,
    /// Sending failed; will be retried.
    Exception,
    /// Not sent and never will be (read-only system, dry run, nothing to send).
    NotExecuted,
    /// Held back by a disabled system or the provisioning breaker.
    Blocked,
    /// Canceled by an administrator.
    Canceled,
}

impl OperationState {
    /// Whether a dispatcher may pick the operation up.
    #[must_use]
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Created | Self::Exception | Self::Blocked)
    }

    /// Database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Executed => "EXECUTED",
            Self::Exception => "EXCEPTION",
            Self::NotExecuted => "NOT_EXECUTED",
            Self::Blocked => "BLOCKED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "EXECUTED" => Ok(Self::Executed),
            "EXCEPTION" => Ok(Self::Exception),
            "NOT_EXECUTED" => Ok(Self::NotExecuted),
            "BLOCKED" => Ok(Self::Blocked),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("invalid operation state: {other}")),
        }
    }
}

/// Result of the latest attempt of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// State.
    pub state: OperationState,
    /// Result code.
    pub code: Option<String>,
    /// Failure cause.
    pub cause: Option<String>,
}

impl OperationResult {
    /// Result with a state and code.
    pub fn new(state: OperationState, code: impl Into<String>) -> Self {
        Self {
            state,
            code: Some(code.into()),
            cause: None,
        }
    }

    /// Result of a freshly created operation.
    #[must_use]
    pub fn created() -> Self {
        Self {
            state: OperationState::Created,
            code: None,
            cause: None,
        }
    }

    /// Attach a cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

// ============================================================================
// Operation
// ============================================================================

/// One create/update/delete request against a target system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningOperation {
    /// Unique identifier; owner of the operation's secrets.
    pub id: OperationId,
    /// Target system.
    pub system_id: SystemId,
    /// Target object; `None` only for structurally invalid rows.
    pub system_entity_id: Option<SystemEntityId>,
    /// UID of the target object when the operation was built.
    pub system_entity_uid: String,
    /// Batch the operation belongs to; assigned by the queue.
    pub batch_id: Option<BatchId>,
    /// Requested change.
    pub operation_type: OperationType,
    /// Kind of the provisioned entity.
    pub entity_type: SystemEntityType,
    /// Provisioned entity.
    pub entity_identifier: Option<EntityId>,
    /// Desired values keyed by attribute key.
    pub account_object: AccountObject,
    /// Object handed to the connector.
    pub connector_object: ConnectorObject,
    /// Result of the latest attempt.
    pub result: OperationResult,
    /// Attempts made so far.
    pub current_attempt: u32,
    /// Maximum attempts before manual resolution is needed.
    pub max_attempts: u32,
    /// Build without persisting or sending.
    pub dry_run: bool,
    /// Creation time; orders operations within a batch.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningOperation {
    /// Create a new operation in state `CREATED`.
    #[must_use]
    pub fn new(
        system_id: SystemId,
        system_entity_id: SystemEntityId,
        system_entity_uid: impl Into<String>,
        operation_type: OperationType,
        entity_type: SystemEntityType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            system_id,
            system_entity_id: Some(system_entity_id),
            system_entity_uid: system_entity_uid.into(),
            batch_id: None,
            operation_type,
            entity_type,
            entity_identifier: None,
            account_object: AccountObject::new(),
            connector_object: ConnectorObject::default(),
            result: OperationResult::created(),
            current_attempt: 0,
            max_attempts: 0,
            dry_run: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        self.result.state
    }

    /// Whether all attempts were used.
    #[must_use]
    pub fn attempts_exhausted(&self) -> bool {
        self.max_attempts > 0 && self.current_attempt >= self.max_attempts
    }

    /// Ordering key inside a batch.
    #[must_use]
    pub fn timeline_key(&self) -> (DateTime<Utc>, OperationId) {
        (self.created_at, self.id)
    }
}

/// Per system-entity queue with a shared retry clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningBatch {
    /// Unique identifier.
    pub id: BatchId,
    /// Target system.
    pub system_id: SystemId,
    /// Target object.
    pub system_entity_id: SystemEntityId,
    /// When the first operation should be retried.
    pub next_attempt: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ProvisioningBatch {
    /// Create an empty batch.
    #[must_use]
    pub fn new(system_id: SystemId, system_entity_id: SystemEntityId) -> Self {
        Self {
            id: BatchId::new(),
            system_id,
            system_entity_id,
            next_attempt: None,
            created_at: Utc::now(),
        }
    }
}

/// Immutable record of an operation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningArchive {
    /// Unique identifier.
    pub id: ArchiveId,
    /// Archived operation.
    pub operation_id: OperationId,
    /// Target system.
    pub system_id: SystemId,
    /// Target object.
    pub system_entity_id: Option<SystemEntityId>,
    /// UID of the target object.
    pub system_entity_uid: String,
    /// Requested change.
    pub operation_type: OperationType,
    /// Kind of the provisioned entity.
    pub entity_type: SystemEntityType,
    /// Provisioned entity.
    pub entity_identifier: Option<EntityId>,
    /// Account object as persisted (secrets are references).
    pub account_object: AccountObject,
    /// Connector object as persisted (secrets are references).
    pub connector_object: ConnectorObject,
    /// Outcome.
    pub result: OperationResult,
    /// Attempt the record describes.
    pub attempt: u32,
    /// Creation time of the operation.
    pub operation_created_at: DateTime<Utc>,
    /// Archival time.
    pub archived_at: DateTime<Utc>,
}

impl ProvisioningArchive {
    /// Snapshot an operation.
    #[must_use]
    pub fn of(operation: &ProvisioningOperation) -> Self {
        Self {
            id: ArchiveId::new(),
            operation_id: operation.id,
            system_id: operation.system_id,
            system_entity_id: operation.system_entity_id,
            system_entity_uid: operation.system_entity_uid.clone(),
            operation_type: operation.operation_type,
            entity_type: operation.entity_type,
            entity_identifier: operation.entity_identifier,
            account_object: operation.account_object.clone(),
            connector_object: operation.connector_object.clone(),
            result: operation.result.clone(),
            attempt: operation.current_attempt,
            operation_created_at: operation.created_at,
            archived_at: Utc::now(),
        }
    }
}

/// Per-attribute diff row of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningAttribute {
    /// Owning operation.
    pub operation_id: OperationId,
    /// Schema attribute name.
    pub name: String,
    /// Whether the attribute is cleared on the target.
    pub removed: bool,
}

impl ProvisioningAttribute {
    /// Diff rows of an operation's connector object.
    #[must_use]
    pub fn of(operation: &ProvisioningOperation) -> Vec<Self> {
        operation
            .connector_object
            .attributes
            .iter()
            .map(|attribute| Self {
                operation_id: operation.id,
                name: attribute.name.clone(),
                removed: attribute.values.is_empty(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idm_connector::{ConnectorAttribute, SchemaAttribute};
    use idm_core::SystemMappingId;

    fn key(name: &str) -> AttributeKey {
        let mapping = AttributeMapping::new(
            SystemMappingId::new(),
            name,
            SchemaAttribute::new(name, "__ACCOUNT__"),
        );
        AttributeKey::for_mapping(&mapping)
    }

    #[test]
    fn test_account_object_replaces_same_key() {
        let mut object = AccountObject::new();
        let mail = key("mail");
        object.insert(mail.clone(), "a@example.com".into());
        object.insert(mail, "b@example.com".into());
        assert_eq!(object.len(), 1);
        assert_eq!(object.get("mail"), Some(&AttributeValue::from("b@example.com")));
    }

    #[test]
    fn test_attempts_exhausted() {
        let mut operation = ProvisioningOperation::new(
            SystemId::new(),
            SystemEntityId::new(),
            "jdoe",
            OperationType::Update,
            SystemEntityType::Identity,
        );
        assert!(!operation.attempts_exhausted());
        operation.max_attempts = 2;
        operation.current_attempt = 2;
        assert!(operation.attempts_exhausted());
    }

    #[test]
    fn test_diff_rows_mark_cleared_attributes() {
        let mut operation = ProvisioningOperation::new(
            SystemId::new(),
            SystemEntityId::new(),
            "jdoe",
            OperationType::Update,
            SystemEntityType::Identity,
        );
        operation
            .connector_object
            .set(ConnectorAttribute::new("mail", "a@example.com".into()));
        operation
            .connector_object
            .set(ConnectorAttribute::new("phone", AttributeValue::Null));

        let rows = ProvisioningAttribute::of(&operation);
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].removed);
        assert!(rows[1].removed);
    }

    #[test]
    fn test_state_roundtrip() {
        assert_eq!(
            "NOT_EXECUTED".parse::<OperationState>().unwrap(),
            OperationState::NotExecuted
        );
    }
}
