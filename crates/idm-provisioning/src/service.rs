//! Provisioning service: the entry points used by the rest of the platform.
//!
//! Each call compiles the account's attribute mappings, evaluates them into
//! an operation, queues it and hands it to the executor. Missing system
//! entities are created on demand as "wished for" objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use idm_connector::{AttributeValue, OperationType};
use idm_core::EntityId;
use tracing::{debug, info, instrument, warn};

use crate::config::ProvisioningConfig;
use crate::context::ProvisioningContextBuilder;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::executor::ProvisioningExecutor;
use crate::mapping::{AttributeMapping, SystemMapping};
use crate::model::{Account, ProvisioningEntity, System, SystemEntity, SystemEntityType};
use crate::operation::{
    AccountObject, AttributeKey, OperationResult, OperationState, ProvisioningOperation,
};
use crate::password::{AccountOperationResult, PasswordChangeOrchestrator, PasswordChangeRequest};
use crate::queue::ProvisioningOperationQueue;
use crate::resolver::AttributeMappingResolver;
use crate::store::ProvisioningStores;
use crate::transform::TransformEvaluator;

/// Result code of a dry-run operation.
pub const DRY_RUN_CODE: &str = "PROVISIONING_DRY_RUN";

/// Object class used when no system mapping names one.
pub const DEFAULT_OBJECT_CLASS: &str = "__ACCOUNT__";

/// Provisioning façade.
pub struct ProvisioningService {
    resolver: AttributeMappingResolver,
    contexts: ProvisioningContextBuilder,
    stores: ProvisioningStores,
    queue: Arc<ProvisioningOperationQueue>,
    executor: Arc<ProvisioningExecutor>,
    config: ProvisioningConfig,
}

impl ProvisioningService {
    /// Create a service.
    pub fn new(
        stores: ProvisioningStores,
        transformer: Arc<dyn TransformEvaluator>,
        executor: Arc<ProvisioningExecutor>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            resolver: AttributeMappingResolver::new(),
            contexts: ProvisioningContextBuilder::new(transformer, stores.accounts.clone()),
            queue: executor.queue().clone(),
            stores,
            executor,
            config,
        }
    }

    /// The operation queue.
    pub fn queue(&self) -> &Arc<ProvisioningOperationQueue> {
        &self.queue
    }

    /// The executor.
    pub fn executor(&self) -> &Arc<ProvisioningExecutor> {
        &self.executor
    }

    pub(crate) fn stores(&self) -> &ProvisioningStores {
        &self.stores
    }

    pub(crate) fn contexts(&self) -> &ProvisioningContextBuilder {
        &self.contexts
    }

    pub(crate) fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Provision an account with the current values of its owning entity.
    pub async fn do_provisioning(
        &self,
        account: &mut Account,
    ) -> ProvisioningResult<Option<ProvisioningOperation>> {
        let entity = self.load_entity(account.entity_id, account.entity_type).await?;
        self.do_internal_provisioning(account, &entity, false).await
    }

    /// Provision an account with the values of `entity`, optionally
    /// overriding some of its properties.
    pub async fn do_provisioning_for_entity(
        &self,
        account: &mut Account,
        entity: &ProvisioningEntity,
        properties: Option<BTreeMap<String, AttributeValue>>,
    ) -> ProvisioningResult<Option<ProvisioningOperation>> {
        match properties {
            Some(properties) => {
                let mut entity = entity.clone();
                entity.properties.extend(properties);
                self.do_internal_provisioning(account, &entity, false).await
            }
            None => self.do_internal_provisioning(account, entity, false).await,
        }
    }

    /// Build an operation for `account` and, unless `dry_run`, queue and
    /// execute it.
    ///
    /// Returns `None` when the account has nothing mapped. A dry run returns
    /// the built operation in `NOT_EXECUTED` without persisting anything
    /// except a system entity created on demand.
    #[instrument(skip(self, account, entity), fields(account_id = %account.id, system_id = %account.system_id))]
    pub async fn do_internal_provisioning(
        &self,
        account: &mut Account,
        entity: &ProvisioningEntity,
        dry_run: bool,
    ) -> ProvisioningResult<Option<ProvisioningOperation>> {
        let system = self.load_system(account).await?;
        let Some((system_mapping, attributes)) = self.mapped_attributes(account).await? else {
            debug!("No provisioning mapping, nothing to provision");
            return Ok(None);
        };
        if attributes.is_empty() {
            debug!("No attributes mapped, nothing to provision");
            return Ok(None);
        }

        let mut system_entity = self.ensure_system_entity(account, &system).await?;
        let operation_type = if system_entity.wish {
            OperationType::Create
        } else {
            OperationType::Update
        };

        let previous_uid = account.uid.clone();
        let mut context = self
            .contexts
            .build(
                operation_type,
                &attributes,
                account,
                entity,
                &system_mapping.object_class,
                &system_entity.uid,
            )
            .await?;

        if context.uid_changed && system_entity.wish && !dry_run {
            // Nothing exists on the target yet: the object is created under the new UID.
            system_entity.uid = account.uid.clone();
            self.stores.system_entities.save(&system_entity).await?;
            context.connector_object.uid = Some(account.uid.clone());
        }
        if account.uid != previous_uid && !dry_run {
            self.stores.accounts.save(account).await?;
        }

        let mut operation = ProvisioningOperation::new(
            system.id,
            system_entity.id,
            system_entity.uid.clone(),
            operation_type,
            account.entity_type,
        );
        operation.entity_identifier = Some(entity.id);
        operation.account_object = context.account_object;
        operation.connector_object = context.connector_object;
        operation.dry_run = dry_run;

        if dry_run {
            operation.result = OperationResult::new(OperationState::NotExecuted, DRY_RUN_CODE);
            info!(operation_type = %operation_type, "Dry run, operation not queued");
            return Ok(Some(operation));
        }
        self.queue_and_execute(operation).await.map(Some)
    }

    /// Delete the object behind `account` on its system.
    ///
    /// Returns `None` when the object was never created on the target.
    #[instrument(skip(self, account), fields(account_id = %account.id, system_id = %account.system_id))]
    pub async fn do_delete_provisioning(
        &self,
        account: &Account,
        entity_id: Option<EntityId>,
    ) -> ProvisioningResult<Option<ProvisioningOperation>> {
        let system_entity = match account.system_entity_id {
            Some(id) => self.stores.system_entities.get(id).await?,
            None => {
                self.stores
                    .system_entities
                    .find(account.system_id, account.entity_type, &account.uid)
                    .await?
            }
        };
        let Some(system_entity) = system_entity else {
            debug!("Account has no system entity, nothing to delete");
            return Ok(None);
        };
        if system_entity.wish {
            debug!(uid = %system_entity.uid, "Object was never created on the target");
            return Ok(None);
        }

        let object_class = match self.system_mapping(account).await? {
            Some(mapping) => mapping.object_class,
            None => DEFAULT_OBJECT_CLASS.to_string(),
        };
        let connector_object = self.contexts.connector_object(
            OperationType::Delete,
            &[],
            &AccountObject::new(),
            &object_class,
            &system_entity.uid,
        )?;

        let mut operation = ProvisioningOperation::new(
            system_entity.system_id,
            system_entity.id,
            system_entity.uid.clone(),
            OperationType::Delete,
            system_entity.entity_type,
        );
        operation.entity_identifier = entity_id;
        operation.connector_object = connector_object;
        self.queue_and_execute(operation).await.map(Some)
    }

    /// Provision a single attribute of an existing system entity.
    #[instrument(skip(self, system_entity, mapping, value, entity), fields(system_id = %system_entity.system_id, attribute = %mapping.schema_attribute.name))]
    pub async fn do_provisioning_for_attribute(
        &self,
        system_entity: &SystemEntity,
        mapping: &AttributeMapping,
        value: AttributeValue,
        entity: &ProvisioningEntity,
    ) -> ProvisioningResult<ProvisioningOperation> {
        if !mapping.schema_attribute.updateable {
            return Err(ProvisioningError::AttributeNotUpdateable {
                attribute: mapping.schema_attribute.name.clone(),
                system_id: system_entity.system_id,
            });
        }

        let value = self.contexts.transform(mapping, entity, value)?;
        let mut account_object = AccountObject::new();
        account_object.insert(AttributeKey::for_mapping(mapping), value);

        let object_class = self
            .stores
            .mappings
            .get_system_mapping(mapping.system_mapping_id)
            .await?
            .map_or_else(|| DEFAULT_OBJECT_CLASS.to_string(), |m| m.object_class);
        let connector_object = self.contexts.connector_object(
            OperationType::Update,
            std::slice::from_ref(mapping),
            &account_object,
            &object_class,
            &system_entity.uid,
        )?;

        let mut operation = ProvisioningOperation::new(
            system_entity.system_id,
            system_entity.id,
            system_entity.uid.clone(),
            OperationType::Update,
            system_entity.entity_type,
        );
        operation.entity_identifier = Some(entity.id);
        operation.account_object = account_object;
        operation.connector_object = connector_object;
        self.queue_and_execute(operation).await
    }

    /// Change the password of an entity's accounts.
    pub async fn change_password(
        &self,
        entity: &ProvisioningEntity,
        request: PasswordChangeRequest,
    ) -> ProvisioningResult<Vec<AccountOperationResult>> {
        PasswordChangeOrchestrator::new(self)
            .change_password(entity, request)
            .await
    }

    /// Compile the attribute mappings of `account` on `system` for `entity`.
    ///
    /// Role overloads come from the roles `entity` holds for the account, so
    /// an entity other than the account's owner only gets the defaults and
    /// the account's own overrides.
    pub async fn resolve_mapped_attributes(
        &self,
        account: &Account,
        entity: &ProvisioningEntity,
        system: &System,
        entity_type: SystemEntityType,
    ) -> ProvisioningResult<Vec<AttributeMapping>> {
        let system_mapping = match account.system_mapping_id {
            Some(id) => self.stores.mappings.get_system_mapping(id).await?,
            None => {
                self.stores
                    .mappings
                    .find_provisioning_mapping(system.id, entity_type)
                    .await?
            }
        };
        match system_mapping {
            Some(system_mapping) => self.compile(account, entity.id, &system_mapping).await,
            None => Ok(Vec::new()),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(crate) async fn queue_and_execute(
        &self,
        operation: ProvisioningOperation,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let queued = self.queue.create_operation(operation).await?;
        self.executor.execute(queued).await
    }

    /// The account's system mapping with its compiled attributes.
    pub(crate) async fn mapped_attributes(
        &self,
        account: &Account,
    ) -> ProvisioningResult<Option<(SystemMapping, Vec<AttributeMapping>)>> {
        let Some(system_mapping) = self.system_mapping(account).await? else {
            return Ok(None);
        };
        let attributes = self.compile(account, account.entity_id, &system_mapping).await?;
        Ok(Some((system_mapping, attributes)))
    }

    async fn compile(
        &self,
        account: &Account,
        entity_id: EntityId,
        system_mapping: &SystemMapping,
    ) -> ProvisioningResult<Vec<AttributeMapping>> {
        let mappings = &self.stores.mappings;
        let defaults = mappings.list_attributes(system_mapping.id).await?;
        let overloads = if entity_id == account.entity_id {
            mappings
                .list_role_overloads(account.id, system_mapping.id)
                .await?
        } else {
            debug!(account_id = %account.id, %entity_id, "Entity does not own the account, skipping role overloads");
            Vec::new()
        };
        let overrides = mappings.list_account_overrides(account.id).await?;
        self.resolver.resolve(&defaults, &overloads, &overrides)
    }

    async fn system_mapping(&self, account: &Account) -> ProvisioningResult<Option<SystemMapping>> {
        let mappings = &self.stores.mappings;
        Ok(match account.system_mapping_id {
            Some(id) => mappings.get_system_mapping(id).await?,
            None => {
                mappings
                    .find_provisioning_mapping(account.system_id, account.entity_type)
                    .await?
            }
        })
    }

    /// The system entity of `account`, created as a wish when missing.
    pub(crate) async fn ensure_system_entity(
        &self,
        account: &mut Account,
        system: &System,
    ) -> ProvisioningResult<SystemEntity> {
        if let Some(id) = account.system_entity_id {
            if let Some(existing) = self.stores.system_entities.get(id).await? {
                return Ok(existing);
            }
            warn!(system_entity_id = %id, "Linked system entity is gone, relinking");
        }

        let entities = &self.stores.system_entities;
        let system_entity = match entities
            .find(system.id, account.entity_type, &account.uid)
            .await?
        {
            Some(existing) => existing,
            None => {
                let created = SystemEntity::wish(system.id, account.entity_type, account.uid.clone());
                entities.save(&created).await?;
                info!(uid = %created.uid, "Created wished system entity");
                created
            }
        };

        account.system_entity_id = Some(system_entity.id);
        self.stores.accounts.save(account).await?;
        Ok(system_entity)
    }

    pub(crate) async fn load_system(&self, account: &Account) -> ProvisioningResult<System> {
        self.stores
            .systems
            .get(account.system_id)
            .await?
            .ok_or_else(|| ProvisioningError::not_found("system", account.system_id))
    }

    async fn load_entity(
        &self,
        id: EntityId,
        entity_type: SystemEntityType,
    ) -> ProvisioningResult<ProvisioningEntity> {
        self.stores
            .entities
            .load(id, entity_type)
            .await?
            .ok_or_else(|| ProvisioningError::not_found("entity", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use idm_connector::{
        ConnectorDispatcher, ConnectorResult, DispatchOutcome, DispatchRequest, SchemaAttribute,
    };
    use idm_core::RoleId;

    use crate::breaker::{BreakerCounterStore, ProvisioningBreaker};
    use crate::config::GlobalBreakConfig;
    use crate::events::InMemoryEventPublisher;
    use crate::mapping::AttributeMappingStrategy;
    use crate::retry::ExponentialBackoff;
    use crate::store::memory::{
        InMemoryAccountStore, InMemoryBreakConfigStore, InMemoryEntityLookup,
        InMemoryMappingStore, InMemoryProvisioningStore, InMemorySystemEntityStore,
        InMemorySystemStore,
    };
    use crate::store::SystemEntityStore;
    use crate::transform::TemplateTransformEvaluator;

    #[derive(Default)]
    struct CountingDispatcher {
        calls: AtomicUsize,
        last: Mutex<Option<DispatchRequest>>,
    }

    #[async_trait]
    impl ConnectorDispatcher for CountingDispatcher {
        async fn send(&self, request: &DispatchRequest) -> ConnectorResult<DispatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request.clone());
            Ok(DispatchOutcome::default())
        }
    }

    struct Fixture {
        service: ProvisioningService,
        store: InMemoryProvisioningStore,
        mappings: InMemoryMappingStore,
        system_entities: InMemorySystemEntityStore,
        dispatcher: Arc<CountingDispatcher>,
        system: System,
        system_mapping: SystemMapping,
        account: Account,
        entity: ProvisioningEntity,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryProvisioningStore::new();
        let accounts = InMemoryAccountStore::new();
        let system_entities = InMemorySystemEntityStore::new();
        let systems = InMemorySystemStore::new();
        let mappings = InMemoryMappingStore::new();
        let entities = InMemoryEntityLookup::new();
        let dispatcher = Arc::new(CountingDispatcher::default());

        let config = ProvisioningConfig::default();
        let queue = Arc::new(ProvisioningOperationQueue::new(
            Arc::new(store.clone()),
            Arc::new(ExponentialBackoff::new(config.retry.clone())),
            &config.retry,
        ));
        let executor = Arc::new(ProvisioningExecutor::new(
            queue,
            Arc::new(ProvisioningBreaker::new(
                Arc::new(InMemoryBreakConfigStore::new()),
                Arc::new(BreakerCounterStore::new()),
                GlobalBreakConfig::default(),
            )),
            dispatcher.clone(),
            Arc::new(systems.clone()),
            Arc::new(system_entities.clone()),
            Arc::new(InMemoryEventPublisher::new()),
        ));
        let stores = ProvisioningStores {
            accounts: Arc::new(accounts.clone()),
            system_entities: Arc::new(system_entities.clone()),
            systems: Arc::new(systems.clone()),
            mappings: Arc::new(mappings.clone()),
            entities: Arc::new(entities.clone()),
        };
        let service = ProvisioningService::new(
            stores,
            Arc::new(TemplateTransformEvaluator::new()),
            executor,
            config,
        );

        let system = System::new("ldap", "ldap-main");
        systems.insert(system.clone()).await;
        let system_mapping = SystemMapping::provisioning(system.id, SystemEntityType::Identity);
        mappings.insert_system_mapping(system_mapping.clone()).await;
        mappings
            .insert_attribute(
                AttributeMapping::new(
                    system_mapping.id,
                    "uid",
                    SchemaAttribute::new("__NAME__", DEFAULT_OBJECT_CLASS),
                )
                .with_property("login")
                .as_uid(),
            )
            .await;
        mappings
            .insert_attribute(
                AttributeMapping::new(
                    system_mapping.id,
                    "firstName",
                    SchemaAttribute::new("givenName", DEFAULT_OBJECT_CLASS),
                )
                .with_property("firstName"),
            )
            .await;

        let entity = ProvisioningEntity::new(EntityId::new(), SystemEntityType::Identity)
            .with("login", "jdoe")
            .with("firstName", "Jane");
        entities.insert(entity.clone()).await;
        let account = Account::new(system.id, entity.id, SystemEntityType::Identity, "jdoe");

        Fixture {
            service,
            store,
            mappings,
            system_entities,
            dispatcher,
            system,
            system_mapping,
            account,
            entity,
        }
    }

    #[tokio::test]
    async fn test_first_provisioning_creates_then_updates() {
        let mut f = fixture().await;

        let created = f.service.do_provisioning(&mut f.account).await.unwrap().unwrap();
        assert_eq!(created.operation_type, OperationType::Create);
        assert_eq!(created.state(), OperationState::Executed);

        let system_entity_id = f.account.system_entity_id.unwrap();
        let system_entity = f.system_entities.get(system_entity_id).await.unwrap().unwrap();
        assert!(!system_entity.wish);

        let updated = f.service.do_provisioning(&mut f.account).await.unwrap().unwrap();
        assert_eq!(updated.operation_type, OperationType::Update);
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.store.archive_count().await, 2);
    }

    #[tokio::test]
    async fn test_dry_run_persists_nothing() {
        let mut f = fixture().await;
        let entity = f.entity.clone();

        let operation = f
            .service
            .do_internal_provisioning(&mut f.account, &entity, true)
            .await
            .unwrap()
            .unwrap();
        assert!(operation.dry_run);
        assert_eq!(operation.state(), OperationState::NotExecuted);
        assert_eq!(operation.result.code.as_deref(), Some(DRY_RUN_CODE));
        assert_eq!(operation.account_object.get("givenName"), Some(&"Jane".into()));
        assert_eq!(f.store.operation_count().await, 0);
        assert_eq!(f.dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_properties_override_entity_values() {
        let mut f = fixture().await;
        let entity = f.entity.clone();
        let properties = BTreeMap::from([("firstName".to_string(), AttributeValue::from("Janet"))]);

        let operation = f
            .service
            .do_provisioning_for_entity(&mut f.account, &entity, Some(properties))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(operation.account_object.get("givenName"), Some(&"Janet".into()));
    }

    #[tokio::test]
    async fn test_no_mapping_means_nothing_to_do() {
        let mut f = fixture().await;
        f.account.entity_type = SystemEntityType::Role;
        let entity = ProvisioningEntity::new(f.entity.id, SystemEntityType::Role);

        let result = f
            .service
            .do_internal_provisioning(&mut f.account, &entity, false)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_delete_of_wished_entity_is_skipped() {
        let mut f = fixture().await;
        let system = f.system.clone();
        f.service.ensure_system_entity(&mut f.account, &system).await.unwrap();

        let result = f
            .service
            .do_delete_provisioning(&f.account, Some(f.entity.id))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_delete_resets_wish() {
        let mut f = fixture().await;
        f.service.do_provisioning(&mut f.account).await.unwrap();

        let deleted = f
            .service
            .do_delete_provisioning(&f.account, Some(f.entity.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted.state(), OperationState::Executed);

        let request = f.dispatcher.last.lock().unwrap().clone().unwrap();
        assert_eq!(request.operation_type, OperationType::Delete);
        assert_eq!(request.object.uid.as_deref(), Some("jdoe"));

        let system_entity_id = f.account.system_entity_id.unwrap();
        assert!(f.system_entities.get(system_entity_id).await.unwrap().unwrap().wish);
    }

    #[tokio::test]
    async fn test_attribute_provisioning_rejects_non_updateable() {
        let f = fixture().await;
        let mut mapping = AttributeMapping::new(
            f.system_mapping.id,
            "employeeNumber",
            SchemaAttribute::new("employeeNumber", DEFAULT_OBJECT_CLASS),
        );
        mapping.schema_attribute.updateable = false;
        let system_entity = SystemEntity::wish(f.system.id, SystemEntityType::Identity, "jdoe");

        let err = f
            .service
            .do_provisioning_for_attribute(&system_entity, &mapping, "42".into(), &f.entity)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::AttributeNotUpdateable { .. }));
    }

    #[tokio::test]
    async fn test_attribute_provisioning_sends_single_attribute() {
        let f = fixture().await;
        let mapping = AttributeMapping::new(
            f.system_mapping.id,
            "mail",
            SchemaAttribute::new("mail", DEFAULT_OBJECT_CLASS),
        )
        .with_transform("${value|lower}");
        let mut system_entity = SystemEntity::wish(f.system.id, SystemEntityType::Identity, "jdoe");
        system_entity.wish = false;
        f.system_entities.save(&system_entity).await.unwrap();

        let operation = f
            .service
            .do_provisioning_for_attribute(&system_entity, &mapping, "Jane@Example.com".into(), &f.entity)
            .await
            .unwrap();
        assert_eq!(operation.state(), OperationState::Executed);

        let request = f.dispatcher.last.lock().unwrap().clone().unwrap();
        assert_eq!(request.object.attributes.len(), 1);
        assert_eq!(
            request.object.get("mail").unwrap().values,
            vec![AttributeValue::from("jane@example.com")]
        );
    }

    #[tokio::test]
    async fn test_resolve_mapped_attributes_applies_role_overloads() {
        let f = fixture().await;
        let defaults = f
            .service
            .resolve_mapped_attributes(&f.account, &f.entity, &f.system, SystemEntityType::Identity)
            .await
            .unwrap();
        assert_eq!(defaults.len(), 2);

        let first_name = defaults.iter().find(|m| m.name == "firstName").unwrap();
        f.mappings
            .grant_overload(
                f.account.id,
                first_name.overload(RoleId::new(), "R1", 10).disabled(),
            )
            .await;
        let resolved = f
            .service
            .resolve_mapped_attributes(&f.account, &f.entity, &f.system, SystemEntityType::Identity)
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].uid);
        assert!(resolved
            .iter()
            .all(|m| m.strategy() == AttributeMappingStrategy::Set));
    }

    #[tokio::test]
    async fn test_resolve_mapped_attributes_for_other_entity_ignores_owner_roles() {
        let f = fixture().await;
        let defaults = f
            .service
            .resolve_mapped_attributes(&f.account, &f.entity, &f.system, SystemEntityType::Identity)
            .await
            .unwrap();
        let first_name = defaults.iter().find(|m| m.name == "firstName").unwrap();
        f.mappings
            .grant_overload(
                f.account.id,
                first_name.overload(RoleId::new(), "R1", 10).disabled(),
            )
            .await;

        let stranger = ProvisioningEntity::new(EntityId::new(), SystemEntityType::Identity);
        let resolved = f
            .service
            .resolve_mapped_attributes(&f.account, &stranger, &f.system, SystemEntityType::Identity)
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|m| m.role_code().is_none()));
    }
}
