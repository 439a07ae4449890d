//! Provisioning errors.
//!
//! Domain errors abort a single provisioning attempt and are reported to the
//! caller; they are never retried. Store and secret failures are
//! infrastructure errors and may succeed on a later attempt.

use idm_core::{AccountId, SystemId};
use idm_connector::OperationType;
use idm_secrets::SecretError;
use thiserror::Error;

use crate::mapping::AttributeMappingStrategy;
use crate::store::StoreError;
use crate::transform::TransformError;

/// Errors raised by the provisioning engine.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The UID attribute resolved to null.
    #[error("UID attribute '{attribute}' resolved to null")]
    UidIsNull { attribute: String },

    /// The UID attribute resolved to a non-string value.
    #[error("UID attribute '{attribute}' must resolve to a string, got {found}")]
    UidNotString {
        attribute: String,
        found: &'static str,
    },

    /// An update targeted a schema attribute that cannot be updated.
    #[error("Schema attribute '{attribute}' on system {system_id} is not updateable")]
    AttributeNotUpdateable {
        attribute: String,
        system_id: SystemId,
    },

    /// A merge strategy was used on a single-valued schema attribute.
    #[error("Attribute '{attribute}' uses {strategy} but the schema attribute is not multivalued")]
    MergeOnSingleValued {
        attribute: String,
        strategy: AttributeMappingStrategy,
    },

    /// Two roles define the same schema attribute with incompatible strategies.
    #[error(
        "Strategy conflict on attribute '{attribute}': {first_role} uses {first_strategy}, \
         {second_role} uses {second_strategy}"
    )]
    StrategyConflict {
        attribute: String,
        first_role: String,
        first_strategy: AttributeMappingStrategy,
        second_role: String,
        second_strategy: AttributeMappingStrategy,
    },

    /// Another account already owns the UID on the same system.
    #[error("UID '{uid}' on system {system_id} is already used by account {existing_account}")]
    DuplicateUid {
        uid: String,
        system_id: SystemId,
        existing_account: AccountId,
    },

    /// A transformation produced a value of the wrong shape.
    #[error("Transformation of '{attribute}' returned {found}, expected {expected}")]
    TransformWrongType {
        attribute: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A transformation failed.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The target system has no connector configured.
    #[error("System {system_id} has no connector configuration")]
    MissingConnectorConfiguration { system_id: SystemId },

    /// A referenced object does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A break configuration already exists for the (system, operation type).
    #[error("Provisioning break configuration for system {system_id} and {operation_type} already exists")]
    BreakConfigDuplicate {
        system_id: SystemId,
        operation_type: OperationType,
    },

    /// The global break configuration is read-only.
    #[error("Global provisioning break configuration cannot be saved or deleted")]
    BreakConfigGlobal,

    /// A break configuration is not valid.
    #[error("Invalid provisioning break configuration: {message}")]
    InvalidBreakConfig { message: String },

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Confidential storage failure.
    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),
}

/// Result type for provisioning operations.
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

impl ProvisioningError {
    /// Stable result code stored on operation results and returned to callers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UidIsNull { .. } => "PROVISIONING_UID_IS_NULL",
            Self::UidNotString { .. } => "PROVISIONING_UID_NOT_STRING",
            Self::AttributeNotUpdateable { .. } => "PROVISIONING_SCHEMA_ATTRIBUTE_NOT_UPDATEABLE",
            Self::MergeOnSingleValued { .. } => "PROVISIONING_MERGE_ATTRIBUTE_NOT_MULTIVALUED",
            Self::StrategyConflict { .. } => "PROVISIONING_ATTRIBUTE_STRATEGY_CONFLICT",
            Self::DuplicateUid { .. } => "PROVISIONING_DUPLICATE_ACCOUNT_UID",
            Self::TransformWrongType { .. } => "PROVISIONING_TRANSFORM_WRONG_TYPE",
            Self::Transform(_) => "PROVISIONING_TRANSFORM_FAILED",
            Self::MissingConnectorConfiguration { .. } => "PROVISIONING_CONNECTOR_NOT_CONFIGURED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::BreakConfigDuplicate { .. } => "PROVISIONING_BREAK_CONFIG_DUPLICATE",
            Self::BreakConfigGlobal => "PROVISIONING_BREAK_GLOBAL_CONFIG_READ_ONLY",
            Self::InvalidBreakConfig { .. } => "PROVISIONING_BREAK_CONFIG_INVALID",
            Self::Store(_) => "PROVISIONING_STORE_ERROR",
            Self::Secret(_) => "PROVISIONING_SECRET_ERROR",
        }
    }

    /// Whether a later attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Secret(_))
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_are_not_retryable() {
        let err = ProvisioningError::UidIsNull {
            attribute: "__NAME__".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "PROVISIONING_UID_IS_NULL");
    }

    #[test]
    fn test_strategy_conflict_names_both_roles() {
        let err = ProvisioningError::StrategyConflict {
            attribute: "memberOf".to_string(),
            first_role: "role 'A'".to_string(),
            first_strategy: AttributeMappingStrategy::Set,
            second_role: "role 'B'".to_string(),
            second_strategy: AttributeMappingStrategy::Merge,
        };
        let message = err.to_string();
        assert!(message.contains("role 'A'"));
        assert!(message.contains("role 'B'"));
    }

    #[test]
    fn test_store_errors_are_retryable() {
        let err = ProvisioningError::Store(StoreError::Unavailable {
            message: "pool timed out".to_string(),
        });
        assert!(err.is_retryable());
    }
}
