//! Secret value vault.
//!
//! Guarded values of an operation are moved to the confidential storage
//! before the operation is persisted and replaced by [`ConfidentialReference`]s.
//! Keys have the form `prefix:property:index` and are scoped to the
//! operation id, so the same operation always produces the same keys.

use std::collections::HashMap;
use std::sync::Arc;

use idm_connector::{AttributeValue, ConfidentialReference};
use idm_secrets::storage::require;
use idm_secrets::{ConfidentialStorage, SecretResult};
use tracing::debug;

use crate::operation::ProvisioningOperation;
use crate::store::UnitOfWork;

/// Key prefix for values of the account object.
pub const ACCOUNT_OBJECT_PREFIX: &str = "sys:account";

/// Key prefix for values of the connector object.
pub const CONNECTOR_OBJECT_PREFIX: &str = "sys:connector";

/// Moves guarded values in and out of the confidential storage.
#[derive(Clone)]
pub struct SecretValueVault {
    storage: Arc<dyn ConfidentialStorage>,
}

impl SecretValueVault {
    /// Create a vault over `storage`.
    pub fn new(storage: Arc<dyn ConfidentialStorage>) -> Self {
        Self { storage }
    }

    /// Replace every guarded value of `operation` with a reference, staging
    /// the plaintext into `unit`. Returns the number of values protected.
    pub fn protect(&self, operation: &mut ProvisioningOperation, unit: &mut UnitOfWork) -> usize {
        let owner = operation.id;
        let mut staged = Vec::new();

        let mut indexes = HashMap::new();
        for entry in operation.account_object.iter_mut() {
            let property = entry.key.schema_attribute.clone();
            let index = indexes.entry(property.clone()).or_insert(0);
            let value = std::mem::take(&mut entry.value);
            entry.value = seal(value, ACCOUNT_OBJECT_PREFIX, &property, index, &mut staged);
        }

        let mut indexes = HashMap::new();
        for attribute in &mut operation.connector_object.attributes {
            let property = attribute.name.clone();
            let index = indexes.entry(property.clone()).or_insert(0);
            let values = std::mem::take(&mut attribute.values);
            attribute.values = values
                .into_iter()
                .map(|value| seal(value, CONNECTOR_OBJECT_PREFIX, &property, index, &mut staged))
                .collect();
        }

        let count = staged.len();
        for (reference, plaintext) in staged {
            unit.put_secret(owner, reference.key(), plaintext);
        }
        if count > 0 {
            debug!(operation_id = %owner, secrets = count, "Protected guarded values");
        }
        count
    }

    /// Copy of `operation` with every reference replaced by its plaintext.
    pub async fn resolve(
        &self,
        operation: &ProvisioningOperation,
    ) -> SecretResult<ProvisioningOperation> {
        let owner = operation.id.into_inner();
        let mut plaintexts = HashMap::new();
        for key in references(operation) {
            let value = require(self.storage.as_ref(), owner, &key).await?;
            plaintexts.insert(key, value);
        }

        let mut resolved = operation.clone();
        for entry in resolved.account_object.iter_mut() {
            let value = std::mem::take(&mut entry.value);
            entry.value = unseal(value, &plaintexts);
        }
        for attribute in &mut resolved.connector_object.attributes {
            let values = std::mem::take(&mut attribute.values);
            attribute.values = values
                .into_iter()
                .map(|value| unseal(value, &plaintexts))
                .collect();
        }
        Ok(resolved)
    }

    /// Stage the removal of every secret reachable from `operation`.
    pub fn release(&self, operation: &ProvisioningOperation, unit: &mut UnitOfWork) -> usize {
        let keys = references(operation);
        for key in &keys {
            unit.remove_secret(operation.id, key);
        }
        keys.len()
    }
}

/// Replace guarded leaves of `value`; `index` counts leaves per property.
fn seal(
    value: AttributeValue,
    prefix: &str,
    property: &str,
    index: &mut usize,
    staged: &mut Vec<(ConfidentialReference, idm_secrets::GuardedString)>,
) -> AttributeValue {
    match value {
        AttributeValue::Array(items) => AttributeValue::Array(
            items
                .into_iter()
                .map(|item| seal(item, prefix, property, index, staged))
                .collect(),
        ),
        AttributeValue::Guarded(secret) => {
            let reference = ConfidentialReference::new(prefix, property, *index);
            *index += 1;
            staged.push((reference.clone(), secret));
            AttributeValue::Confidential(reference)
        }
        other => {
            *index += 1;
            other
        }
    }
}

fn unseal(
    value: AttributeValue,
    plaintexts: &HashMap<String, idm_secrets::GuardedString>,
) -> AttributeValue {
    match value {
        AttributeValue::Confidential(reference) => match plaintexts.get(reference.key()) {
            Some(secret) => AttributeValue::Guarded(secret.clone()),
            None => AttributeValue::Confidential(reference),
        },
        AttributeValue::Array(items) => AttributeValue::Array(
            items
                .into_iter()
                .map(|item| unseal(item, plaintexts))
                .collect(),
        ),
        other => other,
    }
}

/// Sorted, distinct secret keys referenced by `operation`.
fn references(operation: &ProvisioningOperation) -> Vec<String> {
    let mut keys = Vec::new();
    for entry in operation.account_object.iter() {
        collect_references(&entry.value, &mut keys);
    }
    for attribute in &operation.connector_object.attributes {
        for value in &attribute.values {
            collect_references(value, &mut keys);
        }
    }
    keys.sort();
    keys.dedup();
    keys
}

fn collect_references(value: &AttributeValue, keys: &mut Vec<String>) {
    match value {
        AttributeValue::Confidential(reference) => keys.push(reference.key().to_string()),
        AttributeValue::Array(items) => {
            for item in items {
                collect_references(item, keys);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::AttributeMapping;
    use crate::model::SystemEntityType;
    use crate::operation::AttributeKey;
    use crate::store::memory::InMemoryProvisioningStore;
    use crate::store::ProvisioningStore;
    use idm_connector::{ConnectorAttribute, OperationType, SchemaAttribute};
    use idm_core::{SystemEntityId, SystemId, SystemMappingId};
    use idm_secrets::{GuardedString, InMemoryConfidentialStorage};

    fn operation_with_secrets() -> ProvisioningOperation {
        let mut op = ProvisioningOperation::new(
            SystemId::new(),
            SystemEntityId::new(),
            "jdoe",
            OperationType::Create,
            SystemEntityType::Identity,
        );
        let password = AttributeMapping::new(
            SystemMappingId::new(),
            "password",
            SchemaAttribute::new("__PASSWORD__", "__ACCOUNT__").password(),
        )
        .as_password();
        let keys = AttributeMapping::new(
            SystemMappingId::new(),
            "keys",
            SchemaAttribute::new("apiKeys", "__ACCOUNT__").multivalued(),
        );
        op.account_object.insert(
            AttributeKey::for_mapping(&password),
            AttributeValue::Guarded(GuardedString::new("s3cret")),
        );
        op.account_object.insert(
            AttributeKey::for_mapping(&keys),
            AttributeValue::Array(vec![
                AttributeValue::from("public"),
                AttributeValue::Guarded(GuardedString::new("private")),
            ]),
        );
        op.connector_object.set(ConnectorAttribute::new(
            "__PASSWORD__",
            AttributeValue::Guarded(GuardedString::new("s3cret")),
        ));
        op
    }

    #[tokio::test]
    async fn test_secret_round_trip() {
        let secrets = Arc::new(InMemoryConfidentialStorage::new());
        let store = InMemoryProvisioningStore::with_secrets(secrets.clone());
        let vault = SecretValueVault::new(secrets.clone());
        let original = operation_with_secrets();

        let mut op = original.clone();
        let mut unit = UnitOfWork::new();
        assert_eq!(vault.protect(&mut op, &mut unit), 3);
        unit.save_operation(&op);
        store.commit(unit).await.unwrap();

        let persisted = store.get_operation(op.id).await.unwrap().unwrap();
        let json = serde_json::to_string(&persisted).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(!json.contains("private"));
        assert!(persisted
            .account_object
            .iter()
            .all(|e| !e.value.contains_guarded()));
        assert_eq!(
            persisted.account_object.get("__PASSWORD__"),
            Some(&AttributeValue::Confidential(ConfidentialReference::from_key(
                "sys:account:__PASSWORD__:0"
            )))
        );

        let resolved = vault.resolve(&persisted).await.unwrap();
        assert_eq!(resolved.account_object, original.account_object);
        assert_eq!(resolved.connector_object, original.connector_object);

        let mut unit = UnitOfWork::new();
        assert_eq!(vault.release(&persisted, &mut unit), 3);
        unit.delete_operation(persisted.id);
        store.commit(unit).await.unwrap();
        assert_eq!(secrets.count().await, 0);
        assert!(secrets
            .get(op.id.into_inner(), "sys:account:__PASSWORD__:0")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_mixed_array_keeps_plain_elements() {
        let vault = SecretValueVault::new(Arc::new(InMemoryConfidentialStorage::new()));
        let mut op = operation_with_secrets();
        let mut unit = UnitOfWork::new();
        vault.protect(&mut op, &mut unit);

        assert_eq!(
            op.account_object.get("apiKeys"),
            Some(&AttributeValue::Array(vec![
                AttributeValue::from("public"),
                AttributeValue::Confidential(ConfidentialReference::from_key(
                    "sys:account:apiKeys:1"
                )),
            ]))
        );
    }

    #[test]
    fn test_protect_is_idempotent() {
        let vault = SecretValueVault::new(Arc::new(InMemoryConfidentialStorage::new()));
        let mut op = operation_with_secrets();
        vault.protect(&mut op, &mut UnitOfWork::new());
        let protected = op.clone();

        let mut unit = UnitOfWork::new();
        assert_eq!(vault.protect(&mut op, &mut unit), 0);
        assert!(unit.is_empty());
        assert_eq!(op, protected);
    }

    #[tokio::test]
    async fn test_resolve_missing_secret_fails() {
        let vault = SecretValueVault::new(Arc::new(InMemoryConfidentialStorage::new()));
        let mut op = operation_with_secrets();
        vault.protect(&mut op, &mut UnitOfWork::new());

        assert!(vault.resolve(&op).await.is_err());
    }
}
