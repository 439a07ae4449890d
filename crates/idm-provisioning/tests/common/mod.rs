//! Common test utilities for provisioning integration tests.
//!
//! Everything runs against the in-memory stores; no database is needed.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use idm_connector::{
    ConnectorDispatcher, ConnectorError, ConnectorResult, DispatchOutcome, DispatchRequest,
    SchemaAttribute, NAME_ATTRIBUTE, PASSWORD_ATTRIBUTE,
};
use idm_core::{EntityId, SystemId};
use idm_provisioning::breaker::BreakerCounterStore;
use idm_provisioning::store::memory::{
    InMemoryAccountStore, InMemoryBreakConfigStore, InMemoryEntityLookup, InMemoryMappingStore,
    InMemoryProvisioningStore, InMemorySystemEntityStore, InMemorySystemStore,
};
use idm_provisioning::store::AccountStore;
use idm_provisioning::{
    Account, AttributeMapping, BackoffCalculator, InMemoryEventPublisher, ProvisioningBreaker,
    ProvisioningConfig, ProvisioningEntity, ProvisioningExecutor, ProvisioningOperation,
    ProvisioningOperationQueue, ProvisioningService, ProvisioningStores, ProvisioningWorker,
    System, SystemEntityType, SystemMapping, TemplateTransformEvaluator,
};
use idm_secrets::InMemoryConfidentialStorage;

static INIT: Once = Once::new();

/// Initialize logging for tests (once). Enabled by `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

// =============================================================================
// Mock dispatcher
// =============================================================================

/// Dispatcher behavior switch.
pub const SUCCEED: usize = 0;
pub const CONNECTION_ERROR: usize = 1;
pub const CONSTRAINT_VIOLATION: usize = 2;

/// Dispatcher whose outcome is switched with an `AtomicUsize`.
#[derive(Default)]
pub struct MockDispatcher {
    behavior: AtomicUsize,
    calls: AtomicUsize,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl MockDispatcher {
    pub fn set_behavior(&self, behavior: usize) {
        self.behavior.store(behavior, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn last_request(&self) -> Option<DispatchRequest> {
        self.requests.lock().await.last().cloned()
    }
}

#[async_trait]
impl ConnectorDispatcher for MockDispatcher {
    async fn send(&self, request: &DispatchRequest) -> ConnectorResult<DispatchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());
        match self.behavior.load(Ordering::SeqCst) {
            CONNECTION_ERROR => Err(ConnectorError::ConnectionFailed {
                message: "connection refused".to_string(),
            }),
            CONSTRAINT_VIOLATION => Err(ConnectorError::ConstraintViolation {
                message: "rejected by target".to_string(),
            }),
            _ => Ok(DispatchOutcome::default()),
        }
    }
}

/// Backoff that schedules the next attempt at a fixed offset, in seconds.
pub struct FixedBackoff(pub i64);

impl BackoffCalculator for FixedBackoff {
    fn next_attempt(&self, operation: &ProvisioningOperation, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::seconds(self.0 * i64::from(operation.current_attempt))
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A fully wired engine over in-memory stores.
pub struct TestHarness {
    pub store: InMemoryProvisioningStore,
    pub secrets: Arc<InMemoryConfidentialStorage>,
    pub accounts: InMemoryAccountStore,
    pub system_entities: InMemorySystemEntityStore,
    pub systems: InMemorySystemStore,
    pub mappings: InMemoryMappingStore,
    pub entities: InMemoryEntityLookup,
    pub events: InMemoryEventPublisher,
    pub break_configs: InMemoryBreakConfigStore,
    pub dispatcher: Arc<MockDispatcher>,
    pub breaker: Arc<ProvisioningBreaker>,
    pub queue: Arc<ProvisioningOperationQueue>,
    pub executor: Arc<ProvisioningExecutor>,
    pub service: ProvisioningService,
    pub config: ProvisioningConfig,
}

impl TestHarness {
    /// Harness with the default configuration and backoff.
    pub fn new() -> Self {
        Self::with(ProvisioningConfig::default(), Arc::new(FixedBackoff(60)))
    }

    /// Harness with a custom configuration and backoff.
    pub fn with(config: ProvisioningConfig, backoff: Arc<dyn BackoffCalculator>) -> Self {
        init_tracing();

        let secrets = Arc::new(InMemoryConfidentialStorage::new());
        let store = InMemoryProvisioningStore::with_secrets(secrets.clone());
        let accounts = InMemoryAccountStore::new();
        let system_entities = InMemorySystemEntityStore::new();
        let systems = InMemorySystemStore::new();
        let mappings = InMemoryMappingStore::new();
        let entities = InMemoryEntityLookup::new();
        let events = InMemoryEventPublisher::new();
        let break_configs = InMemoryBreakConfigStore::new();
        let dispatcher = Arc::new(MockDispatcher::default());

        let breaker = Arc::new(ProvisioningBreaker::new(
            Arc::new(break_configs.clone()),
            Arc::new(BreakerCounterStore::new()),
            config.global_break.clone(),
        ));
        let queue = Arc::new(ProvisioningOperationQueue::new(
            Arc::new(store.clone()),
            backoff,
            &config.retry,
        ));
        let executor = Arc::new(ProvisioningExecutor::new(
            queue.clone(),
            breaker.clone(),
            dispatcher.clone(),
            Arc::new(systems.clone()),
            Arc::new(system_entities.clone()),
            Arc::new(events.clone()),
        ));
        let service = ProvisioningService::new(
            ProvisioningStores {
                accounts: Arc::new(accounts.clone()),
                system_entities: Arc::new(system_entities.clone()),
                systems: Arc::new(systems.clone()),
                mappings: Arc::new(mappings.clone()),
                entities: Arc::new(entities.clone()),
            },
            Arc::new(TemplateTransformEvaluator::new()),
            executor.clone(),
            config.clone(),
        );

        Self {
            store,
            secrets,
            accounts,
            system_entities,
            systems,
            mappings,
            entities,
            events,
            break_configs,
            dispatcher,
            breaker,
            queue,
            executor,
            service,
            config,
        }
    }

    /// A retry worker over this harness's executor.
    pub fn worker(&self) -> ProvisioningWorker {
        ProvisioningWorker::new(self.executor.clone(), self.config.worker.clone())
    }

    /// Register a system with a provisioning mapping holding a UID
    /// (`login`), a `givenName` (`firstName`) and a password attribute.
    pub async fn add_system(&self, name: &str) -> (System, SystemMapping) {
        let system = System::new(name, format!("{name}-connector"));
        self.systems.insert(system.clone()).await;

        let mapping = SystemMapping::provisioning(system.id, SystemEntityType::Identity);
        self.mappings.insert_system_mapping(mapping.clone()).await;
        for attribute in [
            AttributeMapping::new(
                mapping.id,
                "uid",
                SchemaAttribute::new(NAME_ATTRIBUTE, &mapping.object_class),
            )
            .with_property("login")
            .as_uid(),
            AttributeMapping::new(
                mapping.id,
                "firstName",
                SchemaAttribute::new("givenName", &mapping.object_class),
            )
            .with_property("firstName"),
            AttributeMapping::new(
                mapping.id,
                "password",
                SchemaAttribute::new(PASSWORD_ATTRIBUTE, &mapping.object_class),
            )
            .as_password(),
        ] {
            self.mappings.insert_attribute(attribute).await;
        }
        (system, mapping)
    }

    /// Register a system mapping attribute.
    pub async fn add_attribute(&self, attribute: AttributeMapping) -> AttributeMapping {
        self.mappings.insert_attribute(attribute.clone()).await;
        attribute
    }

    /// Register an identity with a login and a first name.
    pub async fn add_identity(&self, login: &str, first_name: &str) -> ProvisioningEntity {
        let entity = ProvisioningEntity::new(EntityId::new(), SystemEntityType::Identity)
            .with("login", login)
            .with("firstName", first_name);
        self.entities.insert(entity.clone()).await;
        entity
    }

    /// Register an account of `entity` on `system_id`.
    pub async fn add_account(&self, system_id: SystemId, entity: &ProvisioningEntity) -> Account {
        let login = entity
            .property("login")
            .as_string()
            .map(str::to_string)
            .unwrap_or_default();
        let account = Account::new(system_id, entity.id, entity.entity_type, login);
        self.accounts.save(&account).await.unwrap();
        account
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
