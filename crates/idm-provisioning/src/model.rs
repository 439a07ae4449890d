//! Systems, accounts and the entities provisioned to them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use idm_core::{AccountId, EntityId, SystemEntityId, SystemId, SystemMappingId};
use idm_connector::AttributeValue;
use serde::{Deserialize, Serialize};

/// Kind of internal entity provisioned to a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemEntityType {
    Identity,
    Role,
    Contract,
    TreeNode,
    RoleCatalogue,
}

impl SystemEntityType {
    /// Database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Role => "ROLE",
            Self::Contract => "CONTRACT",
            Self::TreeNode => "TREE_NODE",
            Self::RoleCatalogue => "ROLE_CATALOGUE",
        }
    }
}

impl fmt::Display for SystemEntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemEntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDENTITY" => Ok(Self::Identity),
            "ROLE" => Ok(Self::Role),
            "CONTRACT" => Ok(Self::Contract),
            "TREE_NODE" => Ok(Self::TreeNode),
            "ROLE_CATALOGUE" => Ok(Self::RoleCatalogue),
            other => Err(format!("invalid system entity type: {other}")),
        }
    }
}

/// A target system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    /// Unique identifier.
    pub id: SystemId,
    /// Display name.
    pub name: String,
    /// Connector instance key; `None` when no connector is configured.
    pub connector_key: Option<String>,
    /// Operations are recorded but never sent.
    pub readonly: bool,
    /// Operations are queued but held back.
    pub provisioning_disabled: bool,
    /// Whether the connector can change passwords.
    pub supports_password_change: bool,
}

impl System {
    /// Create an enabled system using the given connector.
    pub fn new(name: impl Into<String>, connector_key: impl Into<String>) -> Self {
        Self {
            id: SystemId::new(),
            name: name.into(),
            connector_key: Some(connector_key.into()),
            readonly: false,
            provisioning_disabled: false,
            supports_password_change: true,
        }
    }
}

/// Identity of an object on a target system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEntity {
    /// Unique identifier.
    pub id: SystemEntityId,
    /// Target system.
    pub system_id: SystemId,
    /// Kind of entity.
    pub entity_type: SystemEntityType,
    /// UID on the target.
    pub uid: String,
    /// Whether the object is only wished for and does not exist on the target yet.
    pub wish: bool,
}

impl SystemEntity {
    /// Create a wished-for system entity.
    pub fn wish(system_id: SystemId, entity_type: SystemEntityType, uid: impl Into<String>) -> Self {
        Self {
            id: SystemEntityId::new(),
            system_id,
            entity_type,
            uid: uid.into(),
            wish: true,
        }
    }
}

/// Binding of an internal entity to a UID on a system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique identifier.
    pub id: AccountId,
    /// UID on the target.
    pub uid: String,
    /// Target system.
    pub system_id: SystemId,
    /// Owning entity.
    pub entity_id: EntityId,
    /// Kind of the owning entity.
    pub entity_type: SystemEntityType,
    /// Linked system entity.
    pub system_entity_id: Option<SystemEntityId>,
    /// System mapping used to provision the account.
    pub system_mapping_id: Option<SystemMappingId>,
    /// Account is protected against changes (e.g. after its role was removed).
    pub in_protection: bool,
    /// End of protection, if time-limited.
    pub end_of_protection: Option<DateTime<Utc>>,
    /// Account is frozen by an administrator.
    pub frozen: bool,
}

impl Account {
    /// Create an unlinked account.
    pub fn new(
        system_id: SystemId,
        entity_id: EntityId,
        entity_type: SystemEntityType,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            id: AccountId::new(),
            uid: uid.into(),
            system_id,
            entity_id,
            entity_type,
            system_entity_id: None,
            system_mapping_id: None,
            in_protection: false,
            end_of_protection: None,
            frozen: false,
        }
    }

    /// Whether the account is currently protected at `now`.
    #[must_use]
    pub fn is_protected(&self, now: DateTime<Utc>) -> bool {
        self.in_protection && self.end_of_protection.map_or(true, |end| end > now)
    }
}

/// The internal entity whose values are provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningEntity {
    /// Entity id.
    pub id: EntityId,
    /// Kind of entity.
    pub entity_type: SystemEntityType,
    /// Property values by name.
    pub properties: BTreeMap<String, AttributeValue>,
}

impl ProvisioningEntity {
    /// Create an entity without properties.
    #[must_use]
    pub fn new(id: EntityId, entity_type: SystemEntityType) -> Self {
        Self {
            id,
            entity_type,
            properties: BTreeMap::new(),
        }
    }

    /// Set a property.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Property value, `Null` when absent.
    #[must_use]
    pub fn property(&self, name: &str) -> AttributeValue {
        self.properties
            .get(name)
            .cloned()
            .unwrap_or(AttributeValue::Null)
    }
}

/// Account-level value overriding a mapped attribute (an EAV form value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAttributeOverride {
    /// Account the value belongs to.
    pub account_id: AccountId,
    /// Name of the default attribute mapping it overrides.
    pub mapping_name: String,
    /// The value.
    pub value: AttributeValue,
}
