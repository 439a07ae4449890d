//! Provisioning context: the account object and connector object of an
//! operation, evaluated from compiled attribute mappings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use idm_core::{MappingId, SchemaAttributeId};
use idm_connector::{AttributeValue, ConnectorAttribute, ConnectorObject, OperationType};
use tracing::{debug, info};

use crate::error::{ProvisioningError, ProvisioningResult};
use crate::mapping::{AttributeMapping, AttributeMappingStrategy, MappingOrigin};
use crate::model::{Account, ProvisioningEntity};
use crate::operation::{AccountObject, AttributeKey};
use crate::store::AccountStore;
use crate::transform::TransformEvaluator;

/// Evaluated values of one provisioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningContext {
    /// Desired values keyed by attribute key.
    pub account_object: AccountObject,
    /// Object handed to the connector.
    pub connector_object: ConnectorObject,
    /// Whether the UID attribute changed the account's UID.
    pub uid_changed: bool,
}

/// Builds provisioning contexts.
pub struct ProvisioningContextBuilder {
    transformer: Arc<dyn TransformEvaluator>,
    accounts: Arc<dyn AccountStore>,
}

impl ProvisioningContextBuilder {
    /// Create a builder.
    pub fn new(transformer: Arc<dyn TransformEvaluator>, accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            transformer,
            accounts,
        }
    }

    /// Evaluate `attributes` for `account`.
    ///
    /// A changed UID is applied to `account` in memory; persisting it is left
    /// to the caller. `target_uid` is the UID the object currently has on the
    /// target system.
    pub async fn build(
        &self,
        operation_type: OperationType,
        attributes: &[AttributeMapping],
        account: &mut Account,
        entity: &ProvisioningEntity,
        object_class: &str,
        target_uid: &str,
    ) -> ProvisioningResult<ProvisioningContext> {
        let account_object = match operation_type {
            OperationType::Delete => AccountObject::new(),
            OperationType::Create | OperationType::Update => {
                self.account_object(attributes, account, entity).await?
            }
        };
        let uid_changed = account.uid != target_uid;
        let connector_object =
            self.connector_object(operation_type, attributes, &account_object, object_class, target_uid)?;

        Ok(ProvisioningContext {
            account_object,
            connector_object,
            uid_changed,
        })
    }

    /// Evaluate the account object: single-value strategies first, then merges.
    pub async fn account_object(
        &self,
        attributes: &[AttributeMapping],
        account: &mut Account,
        entity: &ProvisioningEntity,
    ) -> ProvisioningResult<AccountObject> {
        let mut object = AccountObject::new();

        for mapping in attributes
            .iter()
            .filter(|m| !m.strategy().is_merge() && !m.is_disabled() && !m.password)
        {
            let value = self.evaluate(mapping, entity)?;
            if mapping.uid {
                let uid = uid_value(mapping, &value)?;
                if uid != account.uid {
                    self.change_uid(account, uid).await?;
                }
            }
            object.insert(AttributeKey::for_mapping(mapping), value);
        }

        let mut resolved: HashSet<(SchemaAttributeId, AttributeMappingStrategy)> = HashSet::new();
        for mapping in attributes
            .iter()
            .filter(|m| m.strategy().is_merge() && !m.is_disabled())
        {
            let group = (mapping.schema_attribute_id(), mapping.strategy());
            if !resolved.insert(group) {
                continue;
            }
            if !mapping.schema_attribute.multivalued {
                return Err(ProvisioningError::MergeOnSingleValued {
                    attribute: mapping.schema_attribute.name.clone(),
                    strategy: mapping.strategy(),
                });
            }

            let mut seen = HashSet::new();
            let mut merged = Vec::new();
            for member in attributes.iter().filter(|m| {
                !m.is_disabled() && (m.schema_attribute_id(), m.strategy()) == group
            }) {
                for value in self.evaluate(member, entity)?.flatten() {
                    if seen.insert(value.clone()) {
                        merged.push(value);
                    }
                }
            }
            object.insert(AttributeKey::for_mapping(mapping), AttributeValue::Array(merged));
        }

        debug!(account_id = %account.id, entries = object.len(), "Evaluated account object");
        Ok(object)
    }

    /// Translate an account object into the object sent to the connector.
    pub fn connector_object(
        &self,
        operation_type: OperationType,
        attributes: &[AttributeMapping],
        account_object: &AccountObject,
        object_class: &str,
        target_uid: &str,
    ) -> ProvisioningResult<ConnectorObject> {
        let mut object = ConnectorObject::new(object_class, Some(target_uid.to_string()));
        if operation_type == OperationType::Delete {
            return Ok(object);
        }

        let by_id: HashMap<MappingId, &AttributeMapping> =
            attributes.iter().map(|m| (m.id, m)).collect();

        for entry in account_object.iter() {
            let key = &entry.key;
            let Some(mapping) = by_id.get(&key.mapping_id) else {
                continue;
            };
            let schema = &mapping.schema_attribute;

            let sendable = match operation_type {
                OperationType::Create => schema.createable,
                _ => schema.updateable && key.strategy != AttributeMappingStrategy::Create,
            };
            if !sendable || (key.send_only_if_not_null && entry.value.is_null()) {
                continue;
            }

            if !schema.multivalued {
                check_single_value(mapping, &entry.value)?;
            }
            let attribute = ConnectorAttribute::new(key.schema_attribute.clone(), entry.value.clone());
            // A conditional value never displaces one that is always written.
            if key.strategy == AttributeMappingStrategy::WriteIfNull {
                if object.get(&key.schema_attribute).is_none() {
                    object.set(attribute.only_if_empty());
                }
            } else {
                object.set(attribute);
            }
        }
        Ok(object)
    }

    /// Raw value of a mapping passed through its outbound transformation.
    pub fn evaluate(
        &self,
        mapping: &AttributeMapping,
        entity: &ProvisioningEntity,
    ) -> ProvisioningResult<AttributeValue> {
        let raw = match (&mapping.origin, mapping.idm_property.as_deref()) {
            (MappingOrigin::Account { value }, _) => return Ok(value.clone()),
            (_, Some(property)) => entity.property(property),
            (_, None) => AttributeValue::Null,
        };
        self.transform(mapping, entity, raw)
    }

    /// Pass a value supplied by the caller through the mapping's outbound
    /// transformation. Single-valued attributes unwrap one-element arrays.
    pub fn transform(
        &self,
        mapping: &AttributeMapping,
        entity: &ProvisioningEntity,
        raw: AttributeValue,
    ) -> ProvisioningResult<AttributeValue> {
        let value = self.transformer.to_resource(mapping, entity, raw)?;

        if mapping.schema_attribute.multivalued {
            return Ok(value);
        }
        match value {
            AttributeValue::Array(mut values) if values.len() <= 1 => {
                Ok(values.pop().unwrap_or(AttributeValue::Null))
            }
            other => Ok(other),
        }
    }

    async fn change_uid(&self, account: &mut Account, uid: String) -> ProvisioningResult<()> {
        if let Some(existing) = self.accounts.find_by_uid(account.system_id, &uid).await? {
            if existing.id != account.id {
                return Err(ProvisioningError::DuplicateUid {
                    uid,
                    system_id: account.system_id,
                    existing_account: existing.id,
                });
            }
        }
        info!(
            account_id = %account.id,
            old_uid = %account.uid,
            new_uid = %uid,
            "Account UID changed by mapping"
        );
        account.uid = uid;
        Ok(())
    }
}

fn uid_value(mapping: &AttributeMapping, value: &AttributeValue) -> ProvisioningResult<String> {
    match value {
        AttributeValue::Null => Err(ProvisioningError::UidIsNull {
            attribute: mapping.schema_attribute.name.clone(),
        }),
        AttributeValue::String(uid) => Ok(uid.clone()),
        other => Err(ProvisioningError::UidNotString {
            attribute: mapping.schema_attribute.name.clone(),
            found: other.type_name(),
        }),
    }
}

fn check_single_value(mapping: &AttributeMapping, value: &AttributeValue) -> ProvisioningResult<()> {
    if let AttributeValue::Array(_) = value {
        return Err(ProvisioningError::TransformWrongType {
            attribute: mapping.schema_attribute.name.clone(),
            expected: "single value",
            found: value.type_name(),
        });
    }
    Ok(())
}
