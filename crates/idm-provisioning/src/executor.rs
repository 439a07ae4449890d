//! Provisioning executor: the dispatch path of queued operations.
//!
//! ```text
//! queued op ──► order check ──► claim (RUNNING) ──► system checks ──► breaker
//!                                                                      │
//!                      resolve secrets ◄───────────────────────────────┘
//!                             │
//!                      ConnectorDispatcher::send
//!                        │              │
//!                   success          failure
//!                 archive+delete   EXCEPTION+backoff
//!                        │
//!                 next operation of the batch
//! ```

use std::sync::Arc;

use chrono::Utc;
use idm_connector::{ConnectorDispatcher, DispatchOutcome, DispatchRequest, OperationType};
use idm_core::BatchId;
use tracing::{debug, error, info, instrument, warn};

use crate::breaker::{BreakerDecision, ProvisioningBreaker};
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::events::{ProvisioningEvent, ProvisioningEventKind, ProvisioningEventPublisher};
use crate::operation::{OperationState, ProvisioningOperation};
use crate::queue::ProvisioningOperationQueue;
use crate::store::{SystemEntityStore, SystemStore};

/// Result code of an operation on a read-only system.
pub const SYSTEM_READONLY_CODE: &str = "PROVISIONING_SYSTEM_READONLY";

/// Result code of an operation on a system with provisioning disabled.
pub const SYSTEM_DISABLED_CODE: &str = "PROVISIONING_SYSTEM_DISABLED";

/// Result code of an operation held back by the breaker.
pub const BREAK_DISABLED_CODE: &str = "PROVISIONING_BREAK_DISABLE_LIMIT";

/// Result code of an operation whose secrets could not be read.
pub const SECRET_UNAVAILABLE_CODE: &str = "PROVISIONING_SECRET_UNAVAILABLE";

/// Dispatches queued operations to their target systems.
pub struct ProvisioningExecutor {
    queue: Arc<ProvisioningOperationQueue>,
    breaker: Arc<ProvisioningBreaker>,
    dispatcher: Arc<dyn ConnectorDispatcher>,
    systems: Arc<dyn SystemStore>,
    system_entities: Arc<dyn SystemEntityStore>,
    events: Arc<dyn ProvisioningEventPublisher>,
}

impl ProvisioningExecutor {
    /// Create an executor.
    pub fn new(
        queue: Arc<ProvisioningOperationQueue>,
        breaker: Arc<ProvisioningBreaker>,
        dispatcher: Arc<dyn ConnectorDispatcher>,
        systems: Arc<dyn SystemStore>,
        system_entities: Arc<dyn SystemEntityStore>,
        events: Arc<dyn ProvisioningEventPublisher>,
    ) -> Self {
        Self {
            queue,
            breaker,
            dispatcher,
            systems,
            system_entities,
            events,
        }
    }

    /// The queue this executor drains.
    pub fn queue(&self) -> &Arc<ProvisioningOperationQueue> {
        &self.queue
    }

    /// Execute a queued operation, then the operations queued behind it.
    ///
    /// An operation behind an earlier one in its batch is left untouched and
    /// returned as is.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id, system_id = %operation.system_id))]
    pub async fn execute(
        &self,
        operation: ProvisioningOperation,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let Some(batch_id) = operation.batch_id else {
            return self.dispatch(operation).await;
        };

        if let Some(first) = self.queue.first_operation(batch_id).await? {
            if first.id != operation.id {
                debug!(waiting_for = %first.id, "Operation queued behind an earlier one");
                return Ok(operation);
            }
        }

        let done = self.dispatch(operation).await?;
        if finished(&done) {
            self.drain(batch_id).await?;
        }
        Ok(done)
    }

    /// Execute the earliest operation of a batch.
    pub async fn execute_batch(
        &self,
        batch_id: BatchId,
    ) -> ProvisioningResult<Option<ProvisioningOperation>> {
        match self.queue.first_operation(batch_id).await? {
            Some(operation) => self.execute(operation).await.map(Some),
            None => Ok(None),
        }
    }

    /// Start-up recovery: fail operations left running and reset counters.
    pub async fn recover(&self) -> ProvisioningResult<usize> {
        let recovered = self.queue.recover_interrupted().await?;
        self.breaker.clear_all().await;
        info!(recovered, "Provisioning executor recovered");
        Ok(recovered)
    }

    async fn drain(&self, batch_id: BatchId) -> ProvisioningResult<()> {
        while let Some(next) = self.queue.first_operation(batch_id).await? {
            if next.state() == OperationState::Blocked {
                break;
            }
            let done = self.dispatch(next).await?;
            if !finished(&done) {
                break;
            }
        }
        Ok(())
    }

    /// Claim and send one operation. An operation claimed elsewhere is
    /// returned untouched.
    async fn dispatch(
        &self,
        operation: ProvisioningOperation,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let system = self
            .systems
            .get(operation.system_id)
            .await?
            .ok_or_else(|| ProvisioningError::not_found("system", operation.system_id))?;

        let Some(running) = self.queue.mark_running(&operation).await? else {
            return Ok(operation);
        };

        if system.readonly {
            let done = self
                .queue
                .handle_not_executed(&running, SYSTEM_READONLY_CODE)
                .await?;
            self.publish(&done, blocked(SYSTEM_READONLY_CODE)).await;
            return Ok(done);
        }
        if system.provisioning_disabled {
            let done = self.queue.mark_blocked(&running, SYSTEM_DISABLED_CODE).await?;
            self.publish(&done, blocked(SYSTEM_DISABLED_CODE)).await;
            return Ok(done);
        }
        let Some(connector_key) = system.connector_key.clone() else {
            self.queue.release(&operation).await?;
            return Err(ProvisioningError::MissingConnectorConfiguration {
                system_id: system.id,
            });
        };

        let status = match self
            .breaker
            .status(running.system_id, running.operation_type)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                self.queue.release(&operation).await?;
                return Err(e);
            }
        };
        match (status.decision, status.disable_limit, status.warning_limit) {
            (BreakerDecision::Block, Some(limit), _) => {
                let done = self.queue.mark_blocked(&running, BREAK_DISABLED_CODE).await?;
                let kind = ProvisioningEventKind::BreakerDisabled {
                    count: status.count,
                    limit,
                };
                self.publish(&done, kind).await;
                self.publish(&done, blocked(BREAK_DISABLED_CODE)).await;
                return Ok(done);
            }
            (BreakerDecision::Warn, _, Some(limit)) => {
                let kind = ProvisioningEventKind::BreakerWarning {
                    count: status.count,
                    limit,
                };
                self.publish(&running, kind).await;
            }
            _ => {}
        }

        self.publish(&running, ProvisioningEventKind::Started).await;

        let resolved = match self.queue.vault().resolve(&running).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(error = %e, "Failed to resolve confidential values");
                return self
                    .fail(&running, SECRET_UNAVAILABLE_CODE, &e.to_string())
                    .await;
            }
        };

        let request = DispatchRequest {
            operation_id: running.id,
            system_id: running.system_id,
            connector_key,
            operation_type: running.operation_type,
            object: resolved.connector_object,
        };
        self.breaker
            .record(running.system_id, running.operation_type)
            .await;

        match self.dispatcher.send(&request).await {
            Ok(outcome) => {
                let done = self.queue.handle_successful(&running).await?;
                self.after_success(&done, &outcome).await?;
                self.publish(&done, ProvisioningEventKind::Succeeded).await;
                Ok(done)
            }
            Err(e) => {
                debug!(transient = e.is_transient(), "Connector rejected operation");
                self.fail(&running, e.error_code(), &e.to_string()).await
            }
        }
    }

    async fn fail(
        &self,
        operation: &ProvisioningOperation,
        code: &str,
        cause: &str,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let done = self.queue.handle_failed(operation, code, cause).await?;
        let kind = ProvisioningEventKind::Failed {
            code: code.to_string(),
            cause: cause.to_string(),
        };
        self.publish(&done, kind).await;
        Ok(done)
    }

    /// Keep the system entity in line with what the target now holds.
    async fn after_success(
        &self,
        operation: &ProvisioningOperation,
        outcome: &DispatchOutcome,
    ) -> ProvisioningResult<()> {
        let Some(system_entity_id) = operation.system_entity_id else {
            return Ok(());
        };
        let Some(mut entity) = self.system_entities.get(system_entity_id).await? else {
            warn!(%system_entity_id, "System entity of executed operation is gone");
            return Ok(());
        };

        let mut changed = false;
        match operation.operation_type {
            OperationType::Create | OperationType::Update if entity.wish => {
                entity.wish = false;
                changed = true;
            }
            OperationType::Delete if !entity.wish => {
                entity.wish = true;
                changed = true;
            }
            _ => {}
        }
        if let Some(uid) = outcome.uid.as_deref() {
            if operation.operation_type != OperationType::Delete && uid != entity.uid {
                info!(old_uid = %entity.uid, new_uid = %uid, "Target reported a new UID");
                entity.uid = uid.to_string();
                changed = true;
            }
        }
        if changed {
            self.system_entities.save(&entity).await?;
        }
        Ok(())
    }

    async fn publish(&self, operation: &ProvisioningOperation, kind: ProvisioningEventKind) {
        self.events
            .publish(ProvisioningEvent {
                operation_id: operation.id,
                system_id: operation.system_id,
                operation_type: operation.operation_type,
                system_entity_uid: operation.system_entity_uid.clone(),
                kind,
                occurred_at: Utc::now(),
            })
            .await;
    }
}

fn finished(operation: &ProvisioningOperation) -> bool {
    matches!(
        operation.state(),
        OperationState::Executed | OperationState::NotExecuted
    )
}

fn blocked(code: &str) -> ProvisioningEventKind {
    ProvisioningEventKind::Blocked {
        code: code.to_string(),
    }
}
