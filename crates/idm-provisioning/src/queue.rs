//! Provisioning operation queue.
//!
//! Operations are queued per (system, system entity) batch and ordered by
//! creation time. Every state change is written through its own
//! [`UnitOfWork`], independent from whatever triggered it, so queue and
//! archive history survive a caller that later fails.
//!
//! Only the earliest operation of a batch moves the batch's retry clock.

use std::sync::Arc;

use chrono::Utc;
use idm_core::{BatchId, OperationId, SystemEntityId};
use tracing::{debug, info, instrument, warn};

use crate::config::RetryConfig;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::operation::{
    OperationResult, OperationState, ProvisioningArchive, ProvisioningAttribute,
    ProvisioningBatch, ProvisioningOperation,
};
use crate::retry::BackoffCalculator;
use crate::store::{ProvisioningStore, StoreError, UnitOfWork};
use crate::vault::SecretValueVault;

/// Result code of a successful dispatch.
pub const EXECUTED_CODE: &str = "PROVISIONING_EXECUTED";

/// Result code of an operation found running at start-up.
pub const INTERRUPTED_CODE: &str = "OPERATION_INTERRUPTED";

/// Result code of an operation removed from the queue by an administrator.
pub const CANCELED_CODE: &str = "PROVISIONING_CANCELED";

/// Durable queue of provisioning operations.
pub struct ProvisioningOperationQueue {
    store: Arc<dyn ProvisioningStore>,
    vault: SecretValueVault,
    backoff: Arc<dyn BackoffCalculator>,
    max_attempts: u32,
}

impl ProvisioningOperationQueue {
    /// Create a queue. Secrets go to the store's confidential storage.
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        backoff: Arc<dyn BackoffCalculator>,
        retry: &RetryConfig,
    ) -> Self {
        let vault = SecretValueVault::new(store.confidential_storage());
        Self {
            store,
            vault,
            backoff,
            max_attempts: retry.max_attempts,
        }
    }

    /// The vault protecting this queue's secrets.
    pub fn vault(&self) -> &SecretValueVault {
        &self.vault
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn ProvisioningStore> {
        &self.store
    }

    /// Queue a new operation in state `CREATED`.
    ///
    /// The operation joins the batch of its system entity, created on demand.
    /// Guarded values are moved to the confidential storage in the same unit
    /// of work. The returned operation carries references, not plaintext.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id, system_id = %operation.system_id))]
    pub async fn create_operation(
        &self,
        mut operation: ProvisioningOperation,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let system_entity_id = operation.system_entity_id.ok_or_else(|| {
            ProvisioningError::not_found("system entity", &operation.system_entity_uid)
        })?;

        let system_id = operation.system_id;
        operation.batch_id = None;
        operation.result = OperationResult::created();
        operation.max_attempts = self.max_attempts;
        operation.updated_at = Utc::now();

        let mut unit = UnitOfWork::new();
        self.vault.protect(&mut operation, &mut unit);
        let candidate = ProvisioningBatch::new(system_id, system_entity_id);
        let candidate_id = candidate.id;
        unit.enqueue_operation(&operation, candidate);
        unit.replace_attributes(operation.id, ProvisioningAttribute::of(&operation));
        self.store.commit(unit).await?;

        let batch_id = match self.store.find_batch(system_id, system_entity_id).await? {
            Some(batch) => batch.id,
            None => candidate_id,
        };
        operation.batch_id = Some(batch_id);

        info!(%batch_id, operation_type = %operation.operation_type, "Provisioning operation queued");
        Ok(operation)
    }

    /// Claim an operation for dispatch by persisting the state `RUNNING`.
    ///
    /// The claim only succeeds while the stored row is still in the state and
    /// attempt `operation` was read with. `None` means another caller changed
    /// or claimed it first; the operation must then be left alone.
    pub async fn mark_running(
        &self,
        operation: &ProvisioningOperation,
    ) -> ProvisioningResult<Option<ProvisioningOperation>> {
        let mut running = operation.clone();
        running.result = OperationResult {
            state: OperationState::Running,
            code: None,
            cause: None,
        };
        running.updated_at = Utc::now();

        let mut unit = UnitOfWork::new();
        unit.claim_operation(&running, operation);
        match self.store.commit(unit).await {
            Ok(()) => Ok(Some(running)),
            Err(StoreError::NotClaimable { .. }) => {
                debug!(operation_id = %operation.id, state = %operation.state(), "Operation already claimed");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give up a claim without dispatching, restoring the row as it was read.
    pub async fn release(&self, operation: &ProvisioningOperation) -> ProvisioningResult<()> {
        let mut unit = UnitOfWork::new();
        unit.save_operation(operation);
        self.store.commit(unit).await?;
        Ok(())
    }

    /// Record a successful dispatch: archive, release secrets, remove the
    /// live row and stop the batch's retry clock.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    pub async fn handle_successful(
        &self,
        operation: &ProvisioningOperation,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let mut operation = operation.clone();
        operation.current_attempt += 1;
        operation.result = OperationResult::new(OperationState::Executed, EXECUTED_CODE);
        operation.updated_at = Utc::now();

        let mut unit = UnitOfWork::new();
        unit.save_operation(&operation);
        unit.append_archive(ProvisioningArchive::of(&operation));
        self.remove_in(&operation, &mut unit);
        if let Some(mut batch) = self.batch_of(&operation).await? {
            if batch.next_attempt.take().is_some() {
                unit.save_batch(&batch);
            }
        }
        self.store.commit(unit).await?;

        info!(attempt = operation.current_attempt, "Provisioning operation executed");
        Ok(operation)
    }

    /// Record a failed dispatch. The operation stays queued in `EXCEPTION`
    /// and is archived as well. The earliest operation of the batch
    /// reschedules the batch; exhausted operations stop being rescheduled.
    #[instrument(skip(self, operation, cause), fields(operation_id = %operation.id))]
    pub async fn handle_failed(
        &self,
        operation: &ProvisioningOperation,
        code: &str,
        cause: &str,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let mut operation = operation.clone();
        operation.current_attempt += 1;
        operation.max_attempts = self.max_attempts;
        operation.result = OperationResult::new(OperationState::Exception, code).with_cause(cause);
        let now = Utc::now();
        operation.updated_at = now;

        let mut unit = UnitOfWork::new();
        unit.save_operation(&operation);
        unit.append_archive(ProvisioningArchive::of(&operation));

        if let Some(mut batch) = self.batch_of(&operation).await? {
            let first = self.first_operation(batch.id).await?;
            if first.is_some_and(|first| first.id == operation.id) {
                batch.next_attempt = if operation.attempts_exhausted() {
                    warn!(
                        attempts = operation.current_attempt,
                        "Provisioning attempts exhausted, operation left for manual resolution"
                    );
                    None
                } else {
                    Some(self.backoff.next_attempt(&operation, now))
                };
                unit.save_batch(&batch);
            }
        }
        self.store.commit(unit).await?;

        warn!(
            attempt = operation.current_attempt,
            max_attempts = operation.max_attempts,
            code,
            "Provisioning operation failed"
        );
        Ok(operation)
    }

    /// Finish an operation that will never be sent: archived as
    /// `NOT_EXECUTED` and removed from the queue.
    pub async fn handle_not_executed(
        &self,
        operation: &ProvisioningOperation,
        code: &str,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let mut operation = operation.clone();
        operation.result = OperationResult::new(OperationState::NotExecuted, code);
        operation.updated_at = Utc::now();

        let mut unit = UnitOfWork::new();
        unit.append_archive(ProvisioningArchive::of(&operation));
        self.remove_in(&operation, &mut unit);
        self.store.commit(unit).await?;

        info!(operation_id = %operation.id, code, "Provisioning operation not executed");
        Ok(operation)
    }

    /// Hold an operation back; it stays queued in `BLOCKED` and its batch is
    /// no longer polled until the operation is executed again explicitly.
    pub async fn mark_blocked(
        &self,
        operation: &ProvisioningOperation,
        code: &str,
    ) -> ProvisioningResult<ProvisioningOperation> {
        let mut operation = operation.clone();
        operation.result = OperationResult::new(OperationState::Blocked, code);
        operation.updated_at = Utc::now();

        let mut unit = UnitOfWork::new();
        unit.save_operation(&operation);
        if let Some(mut batch) = self.batch_of(&operation).await? {
            if batch.next_attempt.take().is_some() {
                unit.save_batch(&batch);
            }
        }
        self.store.commit(unit).await?;

        warn!(operation_id = %operation.id, code, "Provisioning operation blocked");
        Ok(operation)
    }

    /// Remove an operation from the queue: secrets, archive record, diff rows
    /// and the row itself go in one unit of work. Rows never linked to a
    /// system entity are deleted directly.
    #[instrument(skip(self, operation), fields(operation_id = %operation.id))]
    pub async fn delete_operation(&self, operation: &ProvisioningOperation) -> ProvisioningResult<()> {
        if operation.system_entity_id.is_none() {
            warn!("Operation has no system entity, purging row");
            self.store.purge_operation(operation.id).await?;
            return Ok(());
        }

        let mut archived = operation.clone();
        if !matches!(
            archived.state(),
            OperationState::Executed | OperationState::NotExecuted
        ) {
            archived.result = OperationResult::new(OperationState::Canceled, CANCELED_CODE);
        }

        let mut unit = UnitOfWork::new();
        unit.append_archive(ProvisioningArchive::of(&archived));
        self.remove_in(operation, &mut unit);
        self.store.commit(unit).await?;

        info!("Provisioning operation deleted");
        Ok(())
    }

    /// Mark operations left `RUNNING` by a previous process as failed and
    /// schedule their batches now. Returns the number of operations reset.
    pub async fn recover_interrupted(&self) -> ProvisioningResult<usize> {
        let running = self
            .store
            .list_operations_in_state(OperationState::Running)
            .await?;
        let now = Utc::now();

        for operation in &running {
            let mut operation = operation.clone();
            operation.result = OperationResult::new(OperationState::Exception, INTERRUPTED_CODE)
                .with_cause("operation was running when the previous process stopped");
            operation.updated_at = now;

            let mut unit = UnitOfWork::new();
            unit.save_operation(&operation);
            if let Some(mut batch) = self.batch_of(&operation).await? {
                batch.next_attempt = Some(now);
                unit.save_batch(&batch);
            }
            self.store.commit(unit).await?;
            debug!(operation_id = %operation.id, "Reset interrupted operation");
        }

        if !running.is_empty() {
            warn!(count = running.len(), "Recovered interrupted provisioning operations");
        }
        Ok(running.len())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Operations of a batch in creation order.
    pub async fn batch_timeline(
        &self,
        batch_id: BatchId,
    ) -> ProvisioningResult<Vec<ProvisioningOperation>> {
        let mut operations = self.store.list_batch_operations(batch_id).await?;
        operations.sort_by_key(ProvisioningOperation::timeline_key);
        Ok(operations)
    }

    /// Earliest operation of a batch.
    pub async fn first_operation(
        &self,
        batch_id: BatchId,
    ) -> ProvisioningResult<Option<ProvisioningOperation>> {
        Ok(self
            .store
            .list_batch_operations(batch_id)
            .await?
            .into_iter()
            .min_by_key(ProvisioningOperation::timeline_key))
    }

    /// Latest operation of a batch.
    pub async fn last_operation(
        &self,
        batch_id: BatchId,
    ) -> ProvisioningResult<Option<ProvisioningOperation>> {
        Ok(self
            .store
            .list_batch_operations(batch_id)
            .await?
            .into_iter()
            .max_by_key(ProvisioningOperation::timeline_key))
    }

    /// Get a queued operation.
    pub async fn get(&self, id: OperationId) -> ProvisioningResult<Option<ProvisioningOperation>> {
        Ok(self.store.get_operation(id).await?)
    }

    /// Archive records of a system entity, oldest first.
    pub async fn archives(
        &self,
        system_entity_id: SystemEntityId,
    ) -> ProvisioningResult<Vec<ProvisioningArchive>> {
        Ok(self.store.list_archives(system_entity_id).await?)
    }

    async fn batch_of(
        &self,
        operation: &ProvisioningOperation,
    ) -> ProvisioningResult<Option<ProvisioningBatch>> {
        match operation.batch_id {
            Some(batch_id) => Ok(self.store.get_batch(batch_id).await?),
            None => Ok(None),
        }
    }

    fn remove_in(&self, operation: &ProvisioningOperation, unit: &mut UnitOfWork) {
        self.vault.release(operation, unit);
        unit.delete_attributes(operation.id);
        unit.delete_operation(operation.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemEntityType;
    use crate::retry::ExponentialBackoff;
    use crate::store::memory::InMemoryProvisioningStore;
    use idm_connector::{AttributeValue, ConnectorAttribute, OperationType};
    use idm_core::SystemId;
    use idm_secrets::{GuardedString, InMemoryConfidentialStorage};

    struct Fixture {
        store: InMemoryProvisioningStore,
        secrets: Arc<InMemoryConfidentialStorage>,
        queue: ProvisioningOperationQueue,
        system_id: SystemId,
        system_entity_id: SystemEntityId,
    }

    fn fixture() -> Fixture {
        let secrets = Arc::new(InMemoryConfidentialStorage::new());
        let store = InMemoryProvisioningStore::with_secrets(secrets.clone());
        let queue = ProvisioningOperationQueue::new(
            Arc::new(store.clone()),
            Arc::new(ExponentialBackoff::default()),
            &RetryConfig::default(),
        );
        Fixture {
            store,
            secrets,
            queue,
            system_id: SystemId::new(),
            system_entity_id: SystemEntityId::new(),
        }
    }

    fn operation(f: &Fixture) -> ProvisioningOperation {
        let mut op = ProvisioningOperation::new(
            f.system_id,
            f.system_entity_id,
            "jdoe",
            OperationType::Update,
            SystemEntityType::Identity,
        );
        op.connector_object.set(ConnectorAttribute::new(
            "__PASSWORD__",
            AttributeValue::Guarded(GuardedString::new("s3cret")),
        ));
        op
    }

    #[tokio::test]
    async fn test_operations_share_batch_of_system_entity() {
        let f = fixture();
        let first = f.queue.create_operation(operation(&f)).await.unwrap();
        let second = f.queue.create_operation(operation(&f)).await.unwrap();

        assert_eq!(first.state(), OperationState::Created);
        assert_eq!(first.batch_id, second.batch_id);
        assert_eq!(f.store.batch_count().await, 1);
        assert_eq!(first.max_attempts, RetryConfig::default().max_attempts);

        let batch_id = first.batch_id.unwrap();
        assert_eq!(f.queue.first_operation(batch_id).await.unwrap().unwrap().id, first.id);
        assert_eq!(f.queue.last_operation(batch_id).await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_failures_push_next_attempt_and_success_clears_it() {
        let f = fixture();
        let mut op = f.queue.create_operation(operation(&f)).await.unwrap();
        let batch_id = op.batch_id.unwrap();

        let mut previous = None;
        for _ in 0..3 {
            op = f.queue.handle_failed(&op, "CONNECTOR_TIMEOUT", "timed out").await.unwrap();
            let next = f.store.get_batch(batch_id).await.unwrap().unwrap().next_attempt;
            assert!(next.is_some());
            if let Some(previous) = previous {
                assert!(next > previous);
            }
            previous = Some(next);
        }
        assert_eq!(op.current_attempt, 3);
        assert_eq!(op.state(), OperationState::Exception);
        assert_eq!(f.store.archive_count().await, 3);

        f.queue.handle_successful(&op).await.unwrap();
        let batch = f.store.get_batch(batch_id).await.unwrap().unwrap();
        assert!(batch.next_attempt.is_none());
        assert!(f.store.get_operation(op.id).await.unwrap().is_none());
        assert_eq!(f.secrets.count().await, 0);
    }

    #[tokio::test]
    async fn test_only_earliest_operation_moves_retry_clock() {
        let f = fixture();
        let first = f.queue.create_operation(operation(&f)).await.unwrap();
        let second = f.queue.create_operation(operation(&f)).await.unwrap();
        let batch_id = first.batch_id.unwrap();

        f.queue.handle_failed(&second, "ERR", "boom").await.unwrap();
        assert!(f.store.get_batch(batch_id).await.unwrap().unwrap().next_attempt.is_none());

        f.queue.handle_failed(&first, "ERR", "boom").await.unwrap();
        assert!(f.store.get_batch(batch_id).await.unwrap().unwrap().next_attempt.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_operation_stays_queued_unscheduled() {
        let f = fixture();
        let mut op = f.queue.create_operation(operation(&f)).await.unwrap();
        for _ in 0..RetryConfig::default().max_attempts {
            op = f.queue.handle_failed(&op, "ERR", "boom").await.unwrap();
        }
        assert!(op.attempts_exhausted());
        let batch = f.store.get_batch(op.batch_id.unwrap()).await.unwrap().unwrap();
        assert!(batch.next_attempt.is_none());
        assert!(f.store.get_operation(op.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_secrets_and_archives() {
        let f = fixture();
        let op = f.queue.create_operation(operation(&f)).await.unwrap();
        assert_eq!(f.secrets.count().await, 1);
        assert_eq!(f.store.list_attributes(op.id).await.unwrap().len(), 1);

        f.queue.delete_operation(&op).await.unwrap();
        assert_eq!(f.secrets.count().await, 0);
        assert!(f.store.list_attributes(op.id).await.unwrap().is_empty());
        let archives = f.queue.archives(f.system_entity_id).await.unwrap();
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].result.state, OperationState::Canceled);
    }

    #[tokio::test]
    async fn test_delete_without_system_entity_purges_row() {
        let f = fixture();
        let mut op = f.queue.create_operation(operation(&f)).await.unwrap();
        op.system_entity_id = None;

        f.queue.delete_operation(&op).await.unwrap();
        assert!(f.store.get_operation(op.id).await.unwrap().is_none());
        assert_eq!(f.store.archive_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_does_not_queue() {
        let f = fixture();
        f.store.fail_next_commit();
        assert!(f.queue.create_operation(operation(&f)).await.is_err());
        assert_eq!(f.store.operation_count().await, 0);
        assert_eq!(f.secrets.count().await, 0);
    }

    #[tokio::test]
    async fn test_recover_interrupted_schedules_batch_now() {
        let f = fixture();
        let op = f.queue.create_operation(operation(&f)).await.unwrap();
        f.queue.mark_running(&op).await.unwrap().unwrap();

        assert_eq!(f.queue.recover_interrupted().await.unwrap(), 1);
        let recovered = f.store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(recovered.state(), OperationState::Exception);
        assert_eq!(recovered.result.code.as_deref(), Some(INTERRUPTED_CODE));
        let due = f.store.list_due_batches(Utc::now(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_operation_is_claimed_once() {
        let f = fixture();
        let op = f.queue.create_operation(operation(&f)).await.unwrap();

        let running = f.queue.mark_running(&op).await.unwrap().unwrap();
        assert_eq!(running.state(), OperationState::Running);
        assert!(f.queue.mark_running(&op).await.unwrap().is_none());
        assert!(f.queue.mark_running(&running).await.unwrap().is_none());

        f.queue.release(&op).await.unwrap();
        let stored = f.store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), OperationState::Created);
        assert!(f.queue.mark_running(&stored).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_copy_cannot_be_claimed_after_a_failure() {
        let f = fixture();
        let op = f.queue.create_operation(operation(&f)).await.unwrap();
        let running = f.queue.mark_running(&op).await.unwrap().unwrap();
        let failed = f.queue.handle_failed(&running, "ERR", "boom").await.unwrap();

        let mut stale = failed.clone();
        stale.current_attempt = 0;
        assert!(f.queue.mark_running(&stale).await.unwrap().is_none());
        assert!(f.queue.mark_running(&failed).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_share_one_batch() {
        let f = fixture();
        let queue = Arc::new(ProvisioningOperationQueue::new(
            Arc::new(f.store.clone()),
            Arc::new(ExponentialBackoff::default()),
            &RetryConfig::default(),
        ));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let queue = queue.clone();
                let op = operation(&f);
                tokio::spawn(async move { queue.create_operation(op).await })
            })
            .collect();
        let mut batch_ids = Vec::new();
        for handle in handles {
            batch_ids.push(handle.await.unwrap().unwrap().batch_id.unwrap());
        }

        assert_eq!(f.store.batch_count().await, 1);
        assert!(batch_ids.iter().all(|id| *id == batch_ids[0]));
        let queued = f.store.list_batch_operations(batch_ids[0]).await.unwrap();
        assert_eq!(queued.len(), 16);
    }
}
