//! Strongly Typed Identifiers
//!
//! Newtype wrappers around [`Uuid`] for every provisioning entity.
//!
//! # Example
//!
//! ```
//! use idm_core::{BatchId, OperationId};
//!
//! let operation = OperationId::new();
//! let batch = BatchId::new();
//!
//! fn requires_batch(id: BatchId) -> String {
//!     id.to_string()
//! }
//!
//! let _ = requires_batch(batch);
//! // requires_batch(operation); // does not compile
//! # let _ = operation;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Error type for ID parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The underlying UUID parse error message.
    pub message: String,
}

impl Display for ParseIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.id_type, self.message)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random ID (UUID v4).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Borrows the underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Consumes the ID, returning the UUID.
            #[must_use]
            pub fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    message: e.to_string(),
                })
            }
        }
    };
}

define_id!(
    /// Target system (an LDAP directory, a database, a SaaS application...).
    SystemId
);

define_id!(
    /// Identity of an object on a target system, keyed by (system, entity type, uid).
    SystemEntityId
);

define_id!(
    /// Binding of an internal entity to a UID on a target system.
    AccountId
);

define_id!(
    /// Internal entity being provisioned (identity, role, contract...).
    EntityId
);

define_id!(
    /// A queued or executed provisioning operation.
    ///
    /// Also the owner key under which the operation's secrets are stored.
    OperationId
);

define_id!(
    /// Per system-entity queue of operations sharing one retry clock.
    BatchId
);

define_id!(
    /// Immutable archive record of an operation outcome.
    ArchiveId
);

define_id!(
    /// A single attribute mapping (default or role overload).
    MappingId
);

define_id!(
    /// Default mapping set of one (system, entity type, operation type).
    SystemMappingId
);

define_id!(
    /// Role owning attribute overloads.
    RoleId
);

define_id!(
    /// Attribute in a target system schema.
    SchemaAttributeId
);

define_id!(
    /// Provisioning break (circuit breaker) configuration row.
    BreakConfigId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique() {
        assert_ne!(OperationId::new(), OperationId::new());
    }

    #[test]
    fn test_parse_roundtrip_through_display() {
        let id = BatchId::new();
        let parsed: BatchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_error_names_type() {
        let err = "not-a-uuid".parse::<SystemId>().unwrap_err();
        assert_eq!(err.id_type, "SystemId");
        assert!(err.to_string().starts_with("invalid SystemId"));
    }

    #[test]
    fn test_serde_is_transparent() {
        let uuid = Uuid::new_v4();
        let id = AccountId::from_uuid(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));
    }
}
