//! # Provisioning Engine
//!
//! Decides the desired attribute values of an entity's account on a target
//! system, builds the change request, protects its secrets at rest and
//! dispatches, queues and retries it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐   ┌─────────────────────────┐   ┌────────────────────┐
//! │ ProvisioningService│──►│ AttributeMappingResolver│──►│ ContextBuilder     │
//! └─────────┬──────────┘   └─────────────────────────┘   └─────────┬──────────┘
//!           │                                                      │
//!           ▼                                                      ▼
//! ┌────────────────────┐   ┌─────────────────────────┐   ┌────────────────────┐
//! │ OperationQueue     │──►│ SecretValueVault        │   │ Executor           │
//! │ (batches, archive) │   │ (confidential storage)  │   │ breaker, dispatch  │
//! └─────────▲──────────┘   └─────────────────────────┘   └─────────┬──────────┘
//!           │                                                      │
//!           └───────────── success / failure ◄─────────────────────┘
//!                                   ▲
//!                          ┌────────┴───────┐
//!                          │ RetryWorker    │
//!                          └────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Attribute resolution**: role overloads by priority, merges, account overrides
//! - **Operation queue**: per system-entity batches with a shared retry clock
//! - **Secret vault**: guarded values replaced by confidential references before persistence
//! - **Provisioning break**: per (system, operation type) thresholds with a global fallback
//! - **Password fan-out**: one password change across accounts and password attributes
//!
//! ## Example
//!
//! ```ignore
//! use idm_provisioning::{ProvisioningService, PasswordChangeRequest};
//!
//! let operation = service.do_provisioning(&mut account).await?;
//!
//! let results = service
//!     .change_password(&entity, PasswordChangeRequest::all("n3w-s3cret"))
//!     .await?;
//! ```

pub mod breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod lookup;
pub mod mapping;
pub mod model;
pub mod operation;
pub mod password;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod service;
pub mod store;
pub mod transform;
pub mod vault;
pub mod worker;

pub use breaker::{
    BreakConfigView, BreakerCounterStore, BreakerDecision, BreakerStatus, ProvisioningBreakConfig,
    ProvisioningBreaker,
};
pub use config::{
    BreakLimits, ConfigError, GlobalBreakConfig, ProvisioningConfig, RetryConfig, WorkerConfig,
};
pub use context::{ProvisioningContext, ProvisioningContextBuilder};
pub use error::{ProvisioningError, ProvisioningResult};
pub use events::{
    InMemoryEventPublisher, ProvisioningEvent, ProvisioningEventKind, ProvisioningEventPublisher,
    TracingEventPublisher,
};
pub use executor::ProvisioningExecutor;
pub use mapping::{AttributeMapping, AttributeMappingStrategy, MappingOrigin, SystemMapping};
pub use model::{
    Account, AccountAttributeOverride, ProvisioningEntity, System, SystemEntity, SystemEntityType,
};
pub use operation::{
    AccountObject, OperationResult, OperationState, ProvisioningArchive, ProvisioningAttribute,
    ProvisioningBatch, ProvisioningOperation,
};
pub use password::{AccountOperationResult, PasswordChangeOrchestrator, PasswordChangeRequest};
pub use queue::ProvisioningOperationQueue;
pub use resolver::AttributeMappingResolver;
pub use retry::{BackoffCalculator, ExponentialBackoff};
pub use service::ProvisioningService;
pub use store::{ProvisioningStores, StoreError, UnitOfWork};
pub use transform::{TemplateTransformEvaluator, TransformError, TransformEvaluator};
pub use vault::SecretValueVault;
pub use worker::ProvisioningWorker;
