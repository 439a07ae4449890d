//! Retry worker
//!
//! Background worker that re-executes batches whose retry time has come.
//! On start it recovers operations interrupted by a previous process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use idm_core::BatchId;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, instrument};

use crate::config::WorkerConfig;
use crate::error::ProvisioningResult;
use crate::executor::ProvisioningExecutor;

/// Worker that drains due batches.
pub struct ProvisioningWorker {
    executor: Arc<ProvisioningExecutor>,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashSet<BatchId>>>,
}

impl ProvisioningWorker {
    /// Create a new worker.
    pub fn new(executor: Arc<ProvisioningExecutor>, config: WorkerConfig) -> Self {
        Self {
            executor,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start the worker. Returns once shutdown was requested and in-flight
    /// batches are done.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting provisioning retry worker"
        );

        if let Err(e) = self.executor.recover().await {
            error!(error = %e, "Failed to recover interrupted operations");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        info!("Worker shutdown requested, stopping poll loop");
                        break;
                    }
                    self.poll_and_process(&semaphore).await;
                }
            }
        }

        info!("Waiting for in-flight batches to complete...");
        let permits = u32::try_from(self.config.concurrency).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;
        info!("Worker stopped");
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Execute every due batch once, sequentially. Returns the number of
    /// batches executed.
    pub async fn run_once(&self) -> ProvisioningResult<usize> {
        let batches = self
            .executor
            .queue()
            .store()
            .list_due_batches(Utc::now(), self.config.batch_size)
            .await?;
        for batch in &batches {
            self.executor.execute_batch(batch.id).await?;
        }
        Ok(batches.len())
    }

    async fn poll_and_process(&self, semaphore: &Arc<Semaphore>) {
        let batches = match self
            .executor
            .queue()
            .store()
            .list_due_batches(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(batches) => batches,
            Err(e) => {
                error!(error = %e, "Failed to list due batches");
                return;
            }
        };

        if batches.is_empty() {
            return;
        }
        debug!(count = batches.len(), "Due batches found");

        for batch in batches {
            if !self.in_flight.lock().await.insert(batch.id) {
                continue;
            }
            let permit = if let Ok(p) = semaphore.clone().try_acquire_owned() {
                p
            } else {
                self.in_flight.lock().await.remove(&batch.id);
                debug!("All worker slots busy, skipping remaining batches");
                return;
            };

            let executor = self.executor.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = executor.execute_batch(batch.id).await {
                    error!(batch_id = %batch.id, error = %e, "Failed to execute batch");
                }
                in_flight.lock().await.remove(&batch.id);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use chrono::DateTime;
    use idm_connector::{
        ConnectorDispatcher, ConnectorError, ConnectorResult, DispatchOutcome, DispatchRequest,
        OperationType,
    };

    use crate::breaker::{BreakerCounterStore, ProvisioningBreaker};
    use crate::config::{GlobalBreakConfig, RetryConfig};
    use crate::events::InMemoryEventPublisher;
    use crate::model::{System, SystemEntity, SystemEntityType};
    use crate::operation::{OperationState, ProvisioningOperation};
    use crate::queue::ProvisioningOperationQueue;
    use crate::retry::BackoffCalculator;
    use crate::store::memory::{
        InMemoryBreakConfigStore, InMemoryProvisioningStore, InMemorySystemEntityStore,
        InMemorySystemStore,
    };
    use crate::store::{ProvisioningStore, SystemEntityStore};

    struct Immediate;

    impl BackoffCalculator for Immediate {
        fn next_attempt(&self, _: &ProvisioningOperation, now: DateTime<Utc>) -> DateTime<Utc> {
            now
        }
    }

    struct FlakyDispatcher {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectorDispatcher for FlakyDispatcher {
        async fn send(&self, _: &DispatchRequest) -> ConnectorResult<DispatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ConnectorError::ConnectionTimeout { timeout_secs: 5 });
            }
            Ok(DispatchOutcome::default())
        }
    }

    type Setup = (
        ProvisioningWorker,
        Arc<ProvisioningExecutor>,
        InMemoryProvisioningStore,
        Arc<FlakyDispatcher>,
        ProvisioningOperation,
    );

    async fn setup(failures: usize) -> Setup {
        let store = InMemoryProvisioningStore::new();
        let systems = InMemorySystemStore::new();
        let entities = InMemorySystemEntityStore::new();
        let dispatcher = Arc::new(FlakyDispatcher {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        });
        let queue = Arc::new(ProvisioningOperationQueue::new(
            Arc::new(store.clone()),
            Arc::new(Immediate),
            &RetryConfig::default(),
        ));
        let breaker = Arc::new(ProvisioningBreaker::new(
            Arc::new(InMemoryBreakConfigStore::new()),
            Arc::new(BreakerCounterStore::new()),
            GlobalBreakConfig::default(),
        ));
        let executor = Arc::new(ProvisioningExecutor::new(
            queue.clone(),
            breaker,
            dispatcher.clone(),
            Arc::new(systems.clone()),
            Arc::new(entities.clone()),
            Arc::new(InMemoryEventPublisher::new()),
        ));

        let system = System::new("crm", "crm-rest");
        systems.insert(system.clone()).await;
        let entity = SystemEntity::wish(system.id, SystemEntityType::Identity, "jdoe");
        entities.save(&entity).await.unwrap();
        let op = queue
            .create_operation(ProvisioningOperation::new(
                system.id,
                entity.id,
                "jdoe",
                OperationType::Create,
                SystemEntityType::Identity,
            ))
            .await
            .unwrap();

        let worker = ProvisioningWorker::new(
            executor.clone(),
            WorkerConfig {
                concurrency: 2,
                poll_interval_ms: 10,
                batch_size: 10,
            },
        );
        (worker, executor, store, dispatcher, op)
    }

    #[tokio::test]
    async fn test_run_once_retries_due_batch() {
        let (worker, executor, store, dispatcher, op) = setup(1).await;

        let failed = executor.execute(op.clone()).await.unwrap();
        assert_eq!(failed.state(), OperationState::Exception);

        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
        assert!(store.get_operation(op.id).await.unwrap().is_none());

        assert_eq!(worker.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_new_operations_are_not_due() {
        let (worker, _executor, _store, dispatcher, _op) = setup(0).await;
        assert_eq!(worker.run_once().await.unwrap(), 0);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let (worker, executor, store, _dispatcher, op) = setup(1).await;
        executor.execute(op.clone()).await.unwrap();

        let worker = Arc::new(worker);
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        for _ in 0..100 {
            if store.operation_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.shutdown();
        assert!(worker.is_shutdown());
        handle.await.unwrap();

        assert_eq!(store.operation_count().await, 0);
    }
}
