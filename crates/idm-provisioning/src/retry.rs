//! Retry timing of failed operations.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::RetryConfig;
use crate::operation::ProvisioningOperation;

/// Computes when a failed operation is attempted again.
pub trait BackoffCalculator: Send + Sync {
    /// Time of the next attempt of `operation`, whose `current_attempt` was
    /// already incremented for the failure being handled.
    fn next_attempt(&self, operation: &ProvisioningOperation, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// Exponential backoff: `initial * multiplier^(attempt - 1)`, capped.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    /// Create a calculator with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    ///
    /// Jitter adds at most a quarter of the growth to the next step, so a
    /// later attempt never gets a shorter delay than an earlier one.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> chrono::Duration {
        let delay_ms = self.base_delay_ms(attempt);
        let final_delay = if self.config.jitter {
            let headroom = self.base_delay_ms(attempt.saturating_add(1)) - delay_ms;
            delay_ms + headroom * rand::thread_rng().gen_range(0.0..0.25)
        } else {
            delay_ms
        };

        // `as` saturates; the cap keeps far-future delays representable.
        chrono::Duration::try_milliseconds(final_delay as i64).unwrap_or(chrono::Duration::MAX)
    }

    fn base_delay_ms(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay =
            self.config.initial_delay.as_millis() as f64 * self.config.backoff_multiplier.powi(exponent);
        base_delay.min(self.config.max_delay.as_millis() as f64).max(0.0)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl BackoffCalculator for ExponentialBackoff {
    fn next_attempt(&self, operation: &ProvisioningOperation, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.calculate_delay(operation.current_attempt))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(RetryConfig {
            max_attempts: 6,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            jitter: false,
        })
    }

    #[test]
    fn test_delay_grows_then_caps() {
        let backoff = backoff();
        assert_eq!(backoff.calculate_delay(1).num_seconds(), 60);
        assert_eq!(backoff.calculate_delay(2).num_seconds(), 120);
        assert_eq!(backoff.calculate_delay(3).num_seconds(), 240);
        assert_eq!(backoff.calculate_delay(5).num_seconds(), 600);
        assert_eq!(backoff.calculate_delay(50).num_seconds(), 600);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut config = backoff().config;
        config.jitter = true;
        let backoff = ExponentialBackoff::new(config);
        for _ in 0..20 {
            let delay = backoff.calculate_delay(1).num_milliseconds();
            assert!((60_000..=75_000).contains(&delay));
            assert_eq!(backoff.calculate_delay(5).num_seconds(), 600);
        }
    }

    #[test]
    fn test_jittered_delays_never_shrink() {
        let mut config = backoff().config;
        config.jitter = true;
        let backoff = ExponentialBackoff::new(config);
        for _ in 0..50 {
            let delays: Vec<i64> = (1..=8)
                .map(|attempt| backoff.calculate_delay(attempt).num_milliseconds())
                .collect();
            assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "{delays:?}");
        }
    }

    #[test]
    fn test_extreme_configuration_does_not_overflow() {
        let backoff = ExponentialBackoff::new(RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_secs(u64::MAX / 4),
            max_delay: Duration::MAX,
            backoff_multiplier: 1e300,
            jitter: true,
        });
        let mut operation = ProvisioningOperation::new(
            idm_core::SystemId::new(),
            idm_core::SystemEntityId::new(),
            "jdoe",
            idm_connector::OperationType::Update,
            crate::model::SystemEntityType::Identity,
        );
        operation.current_attempt = u32::MAX;

        let now = Utc::now();
        assert_eq!(backoff.next_attempt(&operation, now), DateTime::<Utc>::MAX_UTC);
        assert!(backoff.calculate_delay(3) > chrono::Duration::zero());
    }
}
