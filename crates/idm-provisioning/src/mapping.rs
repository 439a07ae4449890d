//! Attribute mappings and their strategies.
//!
//! A single [`AttributeMapping`] type covers the default mappings of a system
//! mapping, role overloads and account-level overrides. The [`MappingOrigin`]
//! tag tells them apart and carries what is specific to each: the owning role
//! and its priority for overloads, the fixed value for account overrides.

use std::fmt;
use std::str::FromStr;

use idm_core::{MappingId, RoleId, SchemaAttributeId, SystemId, SystemMappingId};
use idm_connector::{AttributeValue, SchemaAttribute};
use serde::{Deserialize, Serialize};

use crate::model::SystemEntityType;

/// Conflict-resolution policy of an attribute mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeMappingStrategy {
    /// Written only when the object is created.
    Create,
    /// Always overwritten.
    Set,
    /// Written only when the target holds no value.
    WriteIfNull,
    /// Values of all contributors are merged with the target's values.
    Merge,
    /// Values of all contributors replace those previously contributed.
    AuthoritativeMerge,
}

impl AttributeMappingStrategy {
    /// All strategies in resolution order.
    pub const ALL: [AttributeMappingStrategy; 5] = [
        AttributeMappingStrategy::Create,
        AttributeMappingStrategy::Set,
        AttributeMappingStrategy::WriteIfNull,
        AttributeMappingStrategy::Merge,
        AttributeMappingStrategy::AuthoritativeMerge,
    ];

    /// Database / configuration representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Set => "SET",
            Self::WriteIfNull => "WRITE_IF_NULL",
            Self::Merge => "MERGE",
            Self::AuthoritativeMerge => "AUTHORITATIVE_MERGE",
        }
    }

    /// Whether values of several contributors are combined.
    #[must_use]
    pub fn is_merge(&self) -> bool {
        matches!(self, Self::Merge | Self::AuthoritativeMerge)
    }

    /// Whether the strategy never competes with another strategy on the
    /// same attribute.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::Create | Self::WriteIfNull)
    }
}

impl fmt::Display for AttributeMappingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`AttributeMappingStrategy`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid attribute mapping strategy: {0}")]
pub struct ParseStrategyError(pub String);

impl FromStr for AttributeMappingStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "SET" => Ok(Self::Set),
            "WRITE_IF_NULL" => Ok(Self::WriteIfNull),
            "MERGE" => Ok(Self::Merge),
            "AUTHORITATIVE_MERGE" => Ok(Self::AuthoritativeMerge),
            _ => Err(ParseStrategyError(s.to_string())),
        }
    }
}

/// Where an attribute mapping comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingOrigin {
    /// Default mapping of the system mapping.
    System,
    /// Overload defined by a role assigned to the account's owner.
    Role {
        role_id: RoleId,
        role_code: String,
        priority: i32,
    },
    /// Account-level override carrying a fixed value.
    Account { value: AttributeValue },
}

/// Kind of system mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingPurpose {
    /// Outbound: internal entity to target.
    Provisioning,
    /// Inbound: target to internal entity.
    Synchronization,
}

/// Default mapping set of one (system, entity type, purpose).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMapping {
    /// Unique identifier.
    pub id: SystemMappingId,
    /// Target system.
    pub system_id: SystemId,
    /// Entity type the mapping applies to.
    pub entity_type: SystemEntityType,
    /// Provisioning or synchronization.
    pub purpose: MappingPurpose,
    /// Object class written on the target.
    pub object_class: String,
}

impl SystemMapping {
    /// Create a provisioning mapping for `__ACCOUNT__` objects.
    #[must_use]
    pub fn provisioning(system_id: SystemId, entity_type: SystemEntityType) -> Self {
        Self {
            id: SystemMappingId::new(),
            system_id,
            entity_type,
            purpose: MappingPurpose::Provisioning,
            object_class: "__ACCOUNT__".to_string(),
        }
    }
}

/// Rule mapping an internal value to a target schema attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMapping {
    /// Unique identifier.
    pub id: MappingId,
    /// System mapping the rule belongs to.
    pub system_mapping_id: SystemMappingId,
    /// Display name.
    pub name: String,
    /// Default, role overload or account override.
    pub origin: MappingOrigin,
    /// Target schema attribute.
    pub schema_attribute: SchemaAttribute,
    /// Entity property the raw value is read from.
    pub idm_property: Option<String>,
    /// Expression applied before writing to the target.
    pub transform_to_resource: Option<String>,
    /// Expression applied when reading from the target.
    pub transform_from_resource: Option<String>,
    /// Conflict-resolution policy.
    pub strategy: AttributeMappingStrategy,
    /// Whether the value is the object's UID.
    pub uid: bool,
    /// Whether the rule is switched off.
    pub disabled: bool,
    /// Whether the rule carries the account password.
    pub password: bool,
    /// Send even when the value did not change.
    pub send_always: bool,
    /// Skip when the value is null.
    pub send_only_if_not_null: bool,
    /// Send together with password changes.
    pub send_on_password_change: bool,
    /// Whether values may be cached by the synchronization side.
    pub cached: bool,
}

impl AttributeMapping {
    /// Create an enabled `SET` default mapping reading `schema_attribute.name`.
    pub fn new(
        system_mapping_id: SystemMappingId,
        name: impl Into<String>,
        schema_attribute: SchemaAttribute,
    ) -> Self {
        Self {
            id: MappingId::new(),
            system_mapping_id,
            name: name.into(),
            origin: MappingOrigin::System,
            schema_attribute,
            idm_property: None,
            transform_to_resource: None,
            transform_from_resource: None,
            strategy: AttributeMappingStrategy::Set,
            uid: false,
            disabled: false,
            password: false,
            send_always: false,
            send_only_if_not_null: false,
            send_on_password_change: false,
            cached: true,
        }
    }

    /// Set the entity property.
    #[must_use]
    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.idm_property = Some(property.into());
        self
    }

    /// Set the outbound transformation.
    #[must_use]
    pub fn with_transform(mut self, expression: impl Into<String>) -> Self {
        self.transform_to_resource = Some(expression.into());
        self
    }

    /// Set the strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: AttributeMappingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Mark as the UID attribute.
    #[must_use]
    pub fn as_uid(mut self) -> Self {
        self.uid = true;
        self
    }

    /// Mark as the password attribute.
    #[must_use]
    pub fn as_password(mut self) -> Self {
        self.password = true;
        self
    }

    /// Mark as disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Mark as sent together with password changes.
    #[must_use]
    pub fn sent_on_password_change(mut self) -> Self {
        self.send_on_password_change = true;
        self
    }

    /// Derive a role overload of this mapping.
    ///
    /// The overload starts as a copy of this mapping with a fresh id.
    #[must_use]
    pub fn overload(&self, role_id: RoleId, role_code: impl Into<String>, priority: i32) -> Self {
        let mut overload = self.clone();
        overload.id = MappingId::new();
        overload.origin = MappingOrigin::Role {
            role_id,
            role_code: role_code.into(),
            priority,
        };
        overload
    }

    /// Derive an account-level override fixing the value.
    #[must_use]
    pub fn account_override(&self, value: AttributeValue) -> Self {
        let mut account = self.clone();
        account.origin = MappingOrigin::Account { value };
        account.strategy = AttributeMappingStrategy::Set;
        account.transform_to_resource = None;
        account
    }

    /// Conflict-resolution policy.
    #[must_use]
    pub fn strategy(&self) -> AttributeMappingStrategy {
        self.strategy
    }

    /// Referenced schema attribute.
    #[must_use]
    pub fn schema_attribute_id(&self) -> SchemaAttributeId {
        self.schema_attribute.id
    }

    /// Whether the rule is switched off.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Priority of the owning role, role overloads only.
    #[must_use]
    pub fn priority(&self) -> Option<i32> {
        match &self.origin {
            MappingOrigin::Role { priority, .. } => Some(*priority),
            _ => None,
        }
    }

    /// Code of the owning role, role overloads only.
    #[must_use]
    pub fn role_code(&self) -> Option<&str> {
        match &self.origin {
            MappingOrigin::Role { role_code, .. } => Some(role_code),
            _ => None,
        }
    }

    /// Whether the values of several contributors can be merged.
    #[must_use]
    pub fn is_merge_capable(&self) -> bool {
        self.strategy.is_merge() && self.schema_attribute.multivalued
    }

    /// Human-readable owner, used in error messages.
    #[must_use]
    pub fn owner_label(&self) -> String {
        match &self.origin {
            MappingOrigin::System => format!("system mapping '{}'", self.name),
            MappingOrigin::Role { role_code, .. } => format!("role '{role_code}'"),
            MappingOrigin::Account { .. } => format!("account override '{}'", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> AttributeMapping {
        AttributeMapping::new(
            SystemMappingId::new(),
            "mail",
            SchemaAttribute::new("mail", "__ACCOUNT__"),
        )
    }

    #[test]
    fn test_strategy_parse_and_display() {
        for strategy in AttributeMappingStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<AttributeMappingStrategy>().unwrap(), strategy);
        }
        assert!("APPEND".parse::<AttributeMappingStrategy>().is_err());
    }

    #[test]
    fn test_overload_keeps_schema_attribute() {
        let base = mapping();
        let overload = base.overload(RoleId::new(), "R1", 10);
        assert_ne!(overload.id, base.id);
        assert_eq!(overload.schema_attribute_id(), base.schema_attribute_id());
        assert_eq!(overload.priority(), Some(10));
        assert_eq!(overload.role_code(), Some("R1"));
        assert_eq!(base.priority(), None);
    }

    #[test]
    fn test_merge_capability_requires_multivalued() {
        let single = mapping().with_strategy(AttributeMappingStrategy::Merge);
        assert!(!single.is_merge_capable());

        let mut multi = single.clone();
        multi.schema_attribute.multivalued = true;
        assert!(multi.is_merge_capable());
    }

    #[test]
    fn test_account_override_is_set() {
        let account = mapping()
            .with_strategy(AttributeMappingStrategy::Merge)
            .account_override("x".into());
        assert_eq!(account.strategy, AttributeMappingStrategy::Set);
        assert!(matches!(account.origin, MappingOrigin::Account { .. }));
    }
}
