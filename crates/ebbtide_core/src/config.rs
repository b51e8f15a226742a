//! Table configuration.
//!
//! Configuration is always an explicit value handed to the component that
//! needs it. Nothing here is process-wide.

use crate::compression::CompressionPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use crate::tier::TierConfig;
use ebbtide_storage::TableStructure;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One day, the most common partition period.
pub const DAY: Duration = Duration::from_secs(86_400);

/// How much history a table keeps and how far ahead it pre-creates
/// partitions. Read once at the start of each scheduling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Periods of history that must stay queryable.
    pub retain_periods: u32,
    /// Periods of future partitions to keep ready.
    pub lookahead_periods: u32,
    /// Length of one partition.
    pub period_length: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retain_periods: 30,
            lookahead_periods: 2,
            period_length: DAY,
        }
    }
}

impl RetentionPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(retain_periods: u32, lookahead_periods: u32, period_length: Duration) -> Self {
        Self {
            retain_periods,
            lookahead_periods,
            period_length,
        }
    }

    /// Rejects policies the scheduler cannot act on.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the period is shorter than one second.
    pub fn validate(&self) -> LifecycleResult<()> {
        if self.period_length.as_secs() == 0 {
            return Err(LifecycleError::invalid_policy(
                "period_length must be at least one second",
            ));
        }
        if i64::try_from(self.period_length.as_secs()).is_err() {
            return Err(LifecycleError::invalid_policy("period_length is too large"));
        }
        Ok(())
    }
}

/// Exponential backoff for transient allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };

    /// Returns the delay after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Configuration for opening a partitioned table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Whether to create the table directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Column, index and constraint layout every staging area must match.
    pub structure: TableStructure,

    /// Tiers and aging rule.
    pub tiers: TierConfig,

    /// Compression by position.
    pub compression: CompressionPolicy,

    /// Retention applied when the table has no persisted policy.
    pub retention: RetentionPolicy,

    /// Backoff for allocation failures during scheduling.
    pub retry: RetryPolicy,

    /// Upper bound on adds plus drops in one scheduling run.
    pub max_steps_per_cycle: u32,

    /// Bytes requested for a new staging area when no rows are supplied.
    pub estimated_partition_size: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            structure: TableStructure::default(),
            tiers: TierConfig::default(),
            compression: CompressionPolicy::default(),
            retention: RetentionPolicy::default(),
            retry: RetryPolicy::default(),
            max_steps_per_cycle: 64,
            estimated_partition_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl TableConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the table if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the table layout.
    #[must_use]
    pub fn structure(mut self, structure: TableStructure) -> Self {
        self.structure = structure;
        self
    }

    /// Sets the tier configuration.
    #[must_use]
    pub fn tiers(mut self, tiers: TierConfig) -> Self {
        self.tiers = tiers;
        self
    }

    /// Sets the compression policy.
    #[must_use]
    pub const fn compression(mut self, compression: CompressionPolicy) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the initial retention policy.
    #[must_use]
    pub const fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-run step bound.
    #[must_use]
    pub const fn max_steps_per_cycle(mut self, steps: u32) -> Self {
        self.max_steps_per_cycle = steps;
        self
    }

    /// Validates every policy in the configuration.
    pub fn validate(&self) -> LifecycleResult<()> {
        self.tiers.validate()?;
        self.retention.validate()?;
        if self.max_steps_per_cycle == 0 {
            return Err(LifecycleError::invalid_policy(
                "max_steps_per_cycle must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TableConfig::default();
        assert!(config.create_if_missing);
        assert_eq!(config.retention.period_length, DAY);
        assert_eq!(config.compression.row_partitions, 2);
        config.validate().unwrap();
    }

    #[test]
    fn builder_pattern() {
        let config = TableConfig::new()
            .create_if_missing(false)
            .retention(RetentionPolicy::new(3, 1, Duration::from_secs(3600)))
            .max_steps_per_cycle(8);

        assert!(!config.create_if_missing);
        assert_eq!(config.retention.retain_periods, 3);
        assert_eq!(config.max_steps_per_cycle, 8);
    }

    #[test]
    fn zero_period_rejected() {
        let policy = RetentionPolicy::new(1, 1, Duration::ZERO);
        assert!(matches!(policy.validate(), Err(LifecycleError::InvalidPolicy { .. })));
        let sub_second = RetentionPolicy::new(1, 1, Duration::from_millis(500));
        assert!(sub_second.validate().is_err());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(40), Duration::from_millis(350));
    }
}
