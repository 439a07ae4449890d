//! Provisioning events.
//!
//! The executor publishes an event when an operation starts, succeeds, fails
//! or is blocked, and when a breaker threshold is crossed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idm_connector::OperationType;
use idm_core::{OperationId, SystemId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisioningEventKind {
    /// Dispatch is about to start.
    Started,
    /// The target accepted the operation.
    Succeeded,
    /// The target rejected the operation or could not be reached.
    Failed { code: String, cause: String },
    /// The operation was not dispatched.
    Blocked { code: String },
    /// The breaker counter reached the warning limit.
    BreakerWarning { count: u32, limit: u32 },
    /// The breaker counter reached the disable limit.
    BreakerDisabled { count: u32, limit: u32 },
}

/// An event about one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningEvent {
    pub operation_id: OperationId,
    pub system_id: SystemId,
    pub operation_type: OperationType,
    pub system_entity_uid: String,
    #[serde(flatten)]
    pub kind: ProvisioningEventKind,
    pub occurred_at: DateTime<Utc>,
}

/// Sink for provisioning events.
#[async_trait]
pub trait ProvisioningEventPublisher: Send + Sync {
    /// Publish an event. Failures are the publisher's concern.
    async fn publish(&self, event: ProvisioningEvent);
}

/// Publishes events as log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventPublisher;

#[async_trait]
impl ProvisioningEventPublisher for TracingEventPublisher {
    async fn publish(&self, event: ProvisioningEvent) {
        let ProvisioningEvent {
            operation_id,
            system_id,
            operation_type,
            system_entity_uid,
            kind,
            ..
        } = event;
        match kind {
            ProvisioningEventKind::Started => info!(
                %operation_id, %system_id, %operation_type, uid = %system_entity_uid,
                "Provisioning started"
            ),
            ProvisioningEventKind::Succeeded => info!(
                %operation_id, %system_id, %operation_type, uid = %system_entity_uid,
                "Provisioning succeeded"
            ),
            ProvisioningEventKind::Failed { code, cause } => warn!(
                %operation_id, %system_id, %operation_type, uid = %system_entity_uid,
                code = %code, cause = %cause,
                "Provisioning failed"
            ),
            ProvisioningEventKind::Blocked { code } => warn!(
                %operation_id, %system_id, %operation_type, uid = %system_entity_uid,
                code = %code,
                "Provisioning blocked"
            ),
            ProvisioningEventKind::BreakerWarning { count, limit } => warn!(
                %system_id, %operation_type, count, limit,
                "Provisioning break warning limit reached"
            ),
            ProvisioningEventKind::BreakerDisabled { count, limit } => warn!(
                %system_id, %operation_type, count, limit,
                "Provisioning break disable limit reached"
            ),
        }
    }
}

/// Keeps published events in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventPublisher {
    events: Arc<RwLock<Vec<ProvisioningEvent>>>,
}

impl InMemoryEventPublisher {
    /// Create an empty publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub async fn events(&self) -> Vec<ProvisioningEvent> {
        self.events.read().await.clone()
    }

    /// Events of one operation.
    pub async fn events_for(&self, operation_id: OperationId) -> Vec<ProvisioningEventKind> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.operation_id == operation_id)
            .map(|e| e.kind.clone())
            .collect()
    }

    /// Clear all events.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl ProvisioningEventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: ProvisioningEvent) {
        self.events.write().await.push(event);
    }
}
