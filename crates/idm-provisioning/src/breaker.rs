//! Provisioning break: per (system, operation type) counters and thresholds.
//!
//! The breaker only keeps configuration and counts. Callers dispatching
//! operations ask [`ProvisioningBreaker::status`] before sending and act on
//! the returned [`BreakerDecision`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use idm_connector::OperationType;
use idm_core::{BreakConfigId, SystemId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::config::{BreakLimits, GlobalBreakConfig};
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::store::{BreakConfigStore, StoreError};

// ============================================================================
// Configuration
// ============================================================================

/// Break configuration of one (system, operation type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningBreakConfig {
    pub id: BreakConfigId,
    pub system_id: SystemId,
    pub operation_type: OperationType,
    /// Counting window in minutes.
    pub period_minutes: u32,
    pub warning_limit: Option<u32>,
    pub disable_limit: Option<u32>,
    /// Notification template sent at the warning limit.
    pub warning_template: Option<String>,
    /// Notification template sent at the disable limit.
    pub disable_template: Option<String>,
    /// Breaker switched off for this key.
    pub disabled: bool,
    /// Synthesized from the environment configuration; read-only.
    pub global: bool,
}

impl ProvisioningBreakConfig {
    /// Create an enabled configuration without limits.
    #[must_use]
    pub fn new(system_id: SystemId, operation_type: OperationType, period_minutes: u32) -> Self {
        Self {
            id: BreakConfigId::new(),
            system_id,
            operation_type,
            period_minutes,
            warning_limit: None,
            disable_limit: None,
            warning_template: None,
            disable_template: None,
            disabled: false,
            global: false,
        }
    }

    /// Set the warning limit.
    #[must_use]
    pub fn with_warning_limit(mut self, limit: u32) -> Self {
        self.warning_limit = Some(limit);
        self
    }

    /// Set the disable limit.
    #[must_use]
    pub fn with_disable_limit(mut self, limit: u32) -> Self {
        self.disable_limit = Some(limit);
        self
    }

    /// Transient row built from the environment configuration.
    #[must_use]
    pub fn from_global(
        system_id: SystemId,
        operation_type: OperationType,
        limits: &BreakLimits,
    ) -> Self {
        Self {
            period_minutes: limits.period_minutes,
            warning_limit: limits.warning_limit,
            disable_limit: limits.disable_limit,
            disabled: limits.disabled,
            global: true,
            ..Self::new(system_id, operation_type, limits.period_minutes)
        }
    }

    fn validate(&self) -> ProvisioningResult<()> {
        if self.period_minutes == 0 {
            return Err(ProvisioningError::InvalidBreakConfig {
                message: "period must be at least one minute".to_string(),
            });
        }
        if let (Some(warning), Some(disable)) = (self.warning_limit, self.disable_limit) {
            if warning > disable {
                return Err(ProvisioningError::InvalidBreakConfig {
                    message: format!(
                        "warning limit {warning} is greater than disable limit {disable}"
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A configuration with the live counter of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakConfigView {
    pub config: ProvisioningBreakConfig,
    pub current_count: u32,
}

/// What the dispatch path should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    /// Continue, but the warning limit was reached.
    Warn,
    /// Do not dispatch.
    Block,
}

/// Counter and limits of one key at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStatus {
    pub count: u32,
    pub warning_limit: Option<u32>,
    pub disable_limit: Option<u32>,
    pub decision: BreakerDecision,
}

// ============================================================================
// Counters
// ============================================================================

/// Keyed sliding-window counters.
///
/// Concurrent recorders may interleave; counts are best effort.
#[derive(Debug, Default)]
pub struct BreakerCounterStore {
    hits: RwLock<HashMap<(SystemId, OperationType), VecDeque<DateTime<Utc>>>>,
}

impl BreakerCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one dispatch at `now`.
    pub async fn record(&self, system_id: SystemId, operation_type: OperationType, now: DateTime<Utc>) {
        self.hits
            .write()
            .await
            .entry((system_id, operation_type))
            .or_default()
            .push_back(now);
    }

    /// Dispatches within the last `period_minutes`, dropping older ones.
    pub async fn count(
        &self,
        system_id: SystemId,
        operation_type: OperationType,
        period_minutes: u32,
        now: DateTime<Utc>,
    ) -> u32 {
        let mut hits = self.hits.write().await;
        let Some(window) = hits.get_mut(&(system_id, operation_type)) else {
            return 0;
        };
        let since = now - Duration::minutes(i64::from(period_minutes));
        while window.front().is_some_and(|at| *at < since) {
            window.pop_front();
        }
        u32::try_from(window.len()).unwrap_or(u32::MAX)
    }

    /// Reset the counter of one key.
    pub async fn clear(&self, system_id: SystemId, operation_type: OperationType) {
        self.hits.write().await.remove(&(system_id, operation_type));
    }

    /// Reset every counter.
    pub async fn clear_all(&self) {
        self.hits.write().await.clear();
    }
}

// ============================================================================
// Breaker
// ============================================================================

/// Break configuration management and counters.
pub struct ProvisioningBreaker {
    configs: Arc<dyn BreakConfigStore>,
    counters: Arc<BreakerCounterStore>,
    global: GlobalBreakConfig,
}

impl ProvisioningBreaker {
    /// Create a breaker.
    pub fn new(
        configs: Arc<dyn BreakConfigStore>,
        counters: Arc<BreakerCounterStore>,
        global: GlobalBreakConfig,
    ) -> Self {
        Self {
            configs,
            counters,
            global,
        }
    }

    /// Insert or update a per-system configuration.
    #[instrument(skip(self, config), fields(system_id = %config.system_id, operation_type = %config.operation_type))]
    pub async fn save(
        &self,
        config: ProvisioningBreakConfig,
    ) -> ProvisioningResult<ProvisioningBreakConfig> {
        if config.global {
            return Err(ProvisioningError::BreakConfigGlobal);
        }
        config.validate()?;
        match self.configs.save(&config).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(ProvisioningError::BreakConfigDuplicate {
                    system_id: config.system_id,
                    operation_type: config.operation_type,
                });
            }
            Err(e) => return Err(e.into()),
        }
        info!(config_id = %config.id, "Saved provisioning break configuration");
        Ok(config)
    }

    /// Delete a per-system configuration.
    pub async fn delete(&self, config: &ProvisioningBreakConfig) -> ProvisioningResult<()> {
        if config.global {
            return Err(ProvisioningError::BreakConfigGlobal);
        }
        if !self.configs.delete(config.id).await? {
            return Err(ProvisioningError::not_found(
                "provisioning break configuration",
                config.id,
            ));
        }
        info!(config_id = %config.id, system_id = %config.system_id, "Deleted provisioning break configuration");
        Ok(())
    }

    /// Configurations of a system with their live counters.
    ///
    /// With `include_global`, every operation type without a per-system row
    /// gets a transient row built from the environment configuration.
    pub async fn find(
        &self,
        system_id: SystemId,
        include_global: bool,
    ) -> ProvisioningResult<Vec<BreakConfigView>> {
        let mut configs = self.configs.list(system_id).await?;
        if include_global {
            for operation_type in OperationType::ALL {
                if !configs.iter().any(|c| c.operation_type == operation_type) {
                    configs.push(ProvisioningBreakConfig::from_global(
                        system_id,
                        operation_type,
                        self.global.for_operation(operation_type),
                    ));
                }
            }
        }
        configs.sort_by_key(|c| c.operation_type.as_str());

        let now = Utc::now();
        let mut views = Vec::with_capacity(configs.len());
        for config in configs {
            let current_count = self
                .counters
                .count(system_id, config.operation_type, config.period_minutes, now)
                .await;
            views.push(BreakConfigView {
                config,
                current_count,
            });
        }
        Ok(views)
    }

    /// Effective configuration of a key: the per-system row, else the global one.
    pub async fn effective_config(
        &self,
        system_id: SystemId,
        operation_type: OperationType,
    ) -> ProvisioningResult<ProvisioningBreakConfig> {
        Ok(match self.configs.find(system_id, operation_type).await? {
            Some(config) => config,
            None => ProvisioningBreakConfig::from_global(
                system_id,
                operation_type,
                self.global.for_operation(operation_type),
            ),
        })
    }

    /// Counter and decision for a key.
    pub async fn status(
        &self,
        system_id: SystemId,
        operation_type: OperationType,
    ) -> ProvisioningResult<BreakerStatus> {
        let config = self.effective_config(system_id, operation_type).await?;
        let count = self
            .counters
            .count(system_id, operation_type, config.period_minutes, Utc::now())
            .await;

        let reached = |limit: Option<u32>| limit.is_some_and(|limit| count >= limit);
        let decision = if config.disabled {
            BreakerDecision::Allow
        } else if reached(config.disable_limit) {
            BreakerDecision::Block
        } else if reached(config.warning_limit) {
            BreakerDecision::Warn
        } else {
            BreakerDecision::Allow
        };

        Ok(BreakerStatus {
            count,
            warning_limit: config.warning_limit,
            disable_limit: config.disable_limit,
            decision,
        })
    }

    /// Count one dispatch.
    pub async fn record(&self, system_id: SystemId, operation_type: OperationType) {
        self.counters.record(system_id, operation_type, Utc::now()).await;
    }

    /// Reset the counter of a key.
    pub async fn clear_cache(&self, system_id: SystemId, operation_type: OperationType) {
        self.counters.clear(system_id, operation_type).await;
        debug!(%system_id, %operation_type, "Cleared provisioning break counter");
    }

    /// Reset every counter.
    pub async fn clear_all(&self) {
        self.counters.clear_all().await;
    }
}
