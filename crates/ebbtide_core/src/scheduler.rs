//! Retention scheduling.
//!
//! One run of the scheduler brings a table in line with its retention
//! policy: pre-create future partitions, trim expired ones, then reconcile
//! compression and tier placement for partitions whose age position moved.

use crate::archive::ArchiveSink;
use crate::config::{RetentionPolicy, RetryPolicy};
use crate::error::{LifecycleError, LifecycleResult};
use crate::window::{
    AddedPartition, CancellationToken, CompressionChange, DroppedPartition, SlidingWindowManager,
    TierChange,
};
use ebbtide_storage::PartitionKey;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What one completed cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Partitions added, oldest first.
    pub added: Vec<AddedPartition>,
    /// Partitions dropped, oldest first.
    pub dropped: Vec<DroppedPartition>,
    /// Compression targets the engine accepted.
    pub compression_changes: Vec<CompressionChange>,
    /// Tier relocations the engine performed.
    pub tier_changes: Vec<TierChange>,
    /// Oldest boundary that had to remain.
    pub required_oldest: Option<PartitionKey>,
    /// Newest boundary that had to exist.
    pub required_newest: Option<PartitionKey>,
}

/// Result of [`RetentionScheduler::run_cycle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CycleOutcome {
    /// Another run was in flight; nothing was done.
    Skipped,
    /// The run finished.
    Completed(CycleReport),
}

/// Boundaries a cycle would add and remove, computed without mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CyclePlan {
    /// Boundaries to add, in order.
    pub adds: Vec<PartitionKey>,
    /// Boundaries to merge away, in order.
    pub drops: Vec<PartitionKey>,
    /// Oldest boundary that must remain.
    pub required_oldest: Option<PartitionKey>,
    /// Newest boundary that must exist.
    pub required_newest: Option<PartitionKey>,
}

impl CyclePlan {
    /// Returns true if the cycle has no boundary work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.drops.is_empty()
    }
}

/// Resets the single-flight flag when a run ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The retention control loop for one table.
///
/// The caller owns the cadence: `run_cycle` is meant to be invoked from a
/// timer or orchestrator. Overlapping invocations are skipped, never queued.
pub struct RetentionScheduler {
    manager: Arc<SlidingWindowManager>,
    archive: Arc<dyn ArchiveSink>,
    retry: RetryPolicy,
    max_steps: u32,
    cancel: CancellationToken,
    in_flight: AtomicBool,
}

impl RetentionScheduler {
    /// Creates a scheduler driving `manager` and archiving into `archive`.
    pub fn new(
        manager: Arc<SlidingWindowManager>,
        archive: Arc<dyn ArchiveSink>,
        retry: RetryPolicy,
        max_steps: u32,
    ) -> Self {
        Self {
            manager,
            archive,
            retry,
            max_steps,
            cancel: CancellationToken::new(),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Returns the token that stops the current and future runs.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the current retention policy.
    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        self.manager.retention()
    }

    /// Replaces the retention policy. Takes effect at the next run.
    pub fn set_policy(&self, policy: RetentionPolicy) -> LifecycleResult<bool> {
        self.manager.set_retention(policy)
    }

    /// Returns true while a run is executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Runs one scheduling cycle as of `now`.
    ///
    /// All additions happen before any drop, so the live partition count
    /// never dips below what the policy requires.
    ///
    /// # Errors
    ///
    /// - `StorageAllocation` once the retry budget is exhausted
    /// - `ConcurrentModification` if an administrative call holds the table
    /// - `PartialMigration` if the archive did not acknowledge a drop
    pub fn run_cycle(&self, now: PartitionKey) -> LifecycleResult<CycleOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("retention cycle already in flight, skipping");
            self.manager.stats().record_cycle(true);
            return Ok(CycleOutcome::Skipped);
        }
        let _in_flight = InFlight(&self.in_flight);

        let policy = self.manager.retention();
        let (required_oldest, required_newest) = required_bounds(now, &policy)?;
        debug!(%now, %required_oldest, %required_newest, "retention cycle started");

        let mut report = CycleReport {
            required_oldest: Some(required_oldest),
            required_newest: Some(required_newest),
            ..CycleReport::default()
        };

        let mut steps = 0;
        while let Some(boundary) = self.next_add(now, required_newest, &policy) {
            if steps >= self.max_steps {
                warn!(max_steps = self.max_steps, "add step budget exhausted; continuing next cycle");
                break;
            }
            report.added.push(self.add_with_retry(boundary)?);
            steps += 1;
        }

        steps = 0;
        while self.should_drop(required_oldest) {
            if steps >= self.max_steps {
                warn!(max_steps = self.max_steps, "drop step budget exhausted; continuing next cycle");
                break;
            }
            match self
                .manager
                .drop_oldest_partition(self.archive.as_ref(), &self.cancel)?
            {
                Some(dropped) => report.dropped.push(dropped),
                None => break,
            }
            steps += 1;
        }

        report.compression_changes = self.manager.reconcile_compression()?;
        report.tier_changes = self.manager.reconcile_tiers()?;

        self.manager.stats().record_cycle(false);
        info!(
            added = report.added.len(),
            dropped = report.dropped.len(),
            compression_changes = report.compression_changes.len(),
            tier_changes = report.tier_changes.len(),
            "retention cycle completed"
        );
        Ok(CycleOutcome::Completed(report))
    }

    /// Computes the boundaries a run at `now` would add and remove.
    pub fn plan_cycle(&self, now: PartitionKey) -> LifecycleResult<CyclePlan> {
        let policy = self.manager.retention();
        let (required_oldest, required_newest) = required_bounds(now, &policy)?;
        let mut boundaries = self.manager.catalog().boundaries();

        let mut adds = Vec::new();
        while adds.len() < self.max_steps as usize {
            let next = match boundaries.last() {
                Some(&newest) if newest >= required_newest => break,
                Some(&newest) => match newest.checked_add_periods(policy.period_length, 1) {
                    Some(next) => next,
                    None => break,
                },
                None => now.align_down(policy.period_length),
            };
            boundaries.push(next);
            adds.push(next);
        }

        let mut pending = self.manager.pending_drop().is_some();
        let mut drops = Vec::new();
        while drops.len() < self.max_steps as usize && boundaries.len() > 1 {
            if !pending && boundaries[0] >= required_oldest {
                break;
            }
            pending = false;
            drops.push(boundaries.remove(0));
        }

        Ok(CyclePlan {
            adds,
            drops,
            required_oldest: Some(required_oldest),
            required_newest: Some(required_newest),
        })
    }

    /// Returns the next boundary to add, or `None` once the window reaches
    /// `required_newest`.
    fn next_add(
        &self,
        now: PartitionKey,
        required_newest: PartitionKey,
        policy: &RetentionPolicy,
    ) -> Option<PartitionKey> {
        match self.manager.catalog().newest_boundary() {
            Some(newest) if newest >= required_newest => None,
            Some(newest) => newest.checked_add_periods(policy.period_length, 1),
            None => Some(now.align_down(policy.period_length)),
        }
    }

    /// A pending drop is always resumed. Otherwise the oldest boundary is
    /// merged while it is expired and not the newest one.
    fn should_drop(&self, required_oldest: PartitionKey) -> bool {
        let catalog = self.manager.catalog();
        if catalog.boundary_count() <= 1 {
            return false;
        }
        if self.manager.pending_drop().is_some() {
            return true;
        }
        catalog
            .oldest_boundary()
            .is_some_and(|oldest| oldest < required_oldest)
    }

    fn add_with_retry(&self, boundary: PartitionKey) -> LifecycleResult<AddedPartition> {
        let mut attempt = 1;
        loop {
            match self.manager.add_partition(boundary, &[], &self.cancel) {
                Ok(added) => return Ok(added),
                Err(LifecycleError::StorageAllocation { tier, message })
                    if attempt < self.retry.max_attempts =>
                {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        %boundary,
                        ?tier,
                        attempt,
                        delay_ms = millis(delay),
                        reason = %message,
                        "allocation failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for RetentionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionScheduler")
            .field("retry", &self.retry)
            .field("max_steps", &self.max_steps)
            .field("in_flight", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Returns `(now - retain, now + lookahead)` in whole periods.
fn required_bounds(
    now: PartitionKey,
    policy: &RetentionPolicy,
) -> LifecycleResult<(PartitionKey, PartitionKey)> {
    policy.validate()?;
    let oldest = now
        .checked_sub_periods(policy.period_length, policy.retain_periods)
        .ok_or_else(|| LifecycleError::invalid_policy("retention window underflows the key space"))?;
    let newest = now
        .checked_add_periods(policy.period_length, policy.lookahead_periods)
        .ok_or_else(|| LifecycleError::invalid_policy("lookahead window overflows the key space"))?;
    Ok((oldest, newest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::InMemoryArchive;
    use crate::config::{TableConfig, DAY};
    use crate::tier::TierConfig;
    use ebbtide_storage::{InMemoryEngine, Row, StrictSchemaRegistry, TierId};

    struct Harness {
        engine: Arc<InMemoryEngine>,
        archive: Arc<InMemoryArchive>,
        manager: Arc<SlidingWindowManager>,
        scheduler: RetentionScheduler,
    }

    fn harness(retry: RetryPolicy) -> Harness {
        let engine = Arc::new(InMemoryEngine::new());
        let archive = Arc::new(InMemoryArchive::new());
        let config = TableConfig::default()
            .tiers(TierConfig::single(TierId(1)))
            .retention(RetentionPolicy::new(3, 2, DAY));
        let manager = Arc::new(
            SlidingWindowManager::new(engine.clone(), Arc::new(StrictSchemaRegistry::new()), &config)
                .unwrap(),
        );
        let scheduler = RetentionScheduler::new(manager.clone(), archive.clone(), retry, 64);
        Harness {
            engine,
            archive,
            manager,
            scheduler,
        }
    }

    fn day(d: u32) -> PartitionKey {
        PartitionKey::from_ymd(2023, 3, d).unwrap()
    }

    fn noon(d: u32) -> PartitionKey {
        PartitionKey::new(day(d).as_i64() + 12 * 3600)
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            CycleOutcome::Skipped => panic!("cycle was skipped"),
        }
    }

    #[test]
    fn first_cycle_creates_lookahead_partitions() {
        let h = harness(RetryPolicy::NONE);

        let report = completed(h.scheduler.run_cycle(noon(15)).unwrap());

        // Midnight of the 17th is still short of noon, so the 18th is added too.
        assert_eq!(
            h.manager.catalog().boundaries(),
            vec![day(15), day(16), day(17), day(18)]
        );
        assert_eq!(report.added.len(), 4);
        assert!(report.dropped.is_empty());
        assert_eq!(report.required_newest, Some(noon(17)));
        assert_eq!(report.required_oldest, Some(noon(12)));
    }

    #[test]
    fn later_cycle_adds_then_trims() {
        let h = harness(RetryPolicy::NONE);
        h.scheduler.run_cycle(noon(15)).unwrap();

        let report = completed(h.scheduler.run_cycle(noon(25)).unwrap());

        // Required window is [22 12:00, 27 12:00].
        assert_eq!(report.added.len(), 10);
        assert_eq!(report.dropped.len(), 8);
        let boundaries = h.manager.catalog().boundaries();
        assert_eq!(boundaries.first(), Some(&day(23)));
        assert_eq!(boundaries.last(), Some(&day(28)));
        assert_eq!(h.manager.stats().cycles_completed(), 2);
    }

    #[test]
    fn repeated_cycle_is_idempotent() {
        let h = harness(RetryPolicy::NONE);
        h.scheduler.run_cycle(noon(15)).unwrap();
        let before = h.manager.partitions();

        let report = completed(h.scheduler.run_cycle(noon(15)).unwrap());

        assert!(report.added.is_empty() && report.dropped.is_empty());
        assert_eq!(h.manager.partitions().len(), before.len());
    }

    #[test]
    fn overlapping_run_is_skipped() {
        let h = harness(RetryPolicy::NONE);
        h.scheduler.in_flight.store(true, Ordering::Release);

        assert_eq!(h.scheduler.run_cycle(noon(15)).unwrap(), CycleOutcome::Skipped);
        assert_eq!(h.manager.catalog().boundary_count(), 0);
        assert_eq!(h.manager.stats().cycles_skipped(), 1);
    }

    #[test]
    fn flag_cleared_after_failed_run() {
        let h = harness(RetryPolicy::NONE);
        h.engine.fail_next_allocations(1);

        assert!(h.scheduler.run_cycle(noon(15)).is_err());
        assert!(!h.scheduler.is_running());
        assert!(h.scheduler.run_cycle(noon(15)).is_ok());
    }

    #[test]
    fn allocation_failures_retried_with_backoff() {
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        let h = harness(retry);
        h.engine.fail_next_allocations(2);

        let report = completed(h.scheduler.run_cycle(noon(15)).unwrap());
        assert_eq!(report.added.len(), 4);
    }

    #[test]
    fn allocation_failure_surfaces_after_last_attempt() {
        let h = harness(RetryPolicy::NONE);
        h.engine.fail_next_allocations(1);

        let err = h.scheduler.run_cycle(noon(15)).unwrap_err();
        assert!(matches!(err, LifecycleError::StorageAllocation { .. }));
        assert_eq!(h.manager.catalog().boundary_count(), 0);
    }

    #[test]
    fn partial_migration_surfaces_and_next_cycle_resumes() {
        let h = harness(RetryPolicy::NONE);
        h.scheduler.run_cycle(noon(15)).unwrap();
        let oldest = h.manager.catalog().oldest().id;
        h.engine.seed_partition(oldest, vec![Row::new(day(1), b"x".to_vec())]);

        h.archive.set_offline(true);
        let err = h.scheduler.run_cycle(noon(20)).unwrap_err();
        assert!(matches!(err, LifecycleError::PartialMigration { .. }));
        assert!(h.manager.pending_drop().is_some());

        h.archive.set_offline(false);
        let report = completed(h.scheduler.run_cycle(noon(20)).unwrap());
        assert!(report.dropped[0].resumed);
        assert_eq!(h.archive.len(), 1);
        assert!(h.manager.pending_drop().is_none());
    }

    #[test]
    fn plan_matches_run() {
        let h = harness(RetryPolicy::NONE);
        h.scheduler.run_cycle(noon(15)).unwrap();

        let plan = h.scheduler.plan_cycle(noon(21)).unwrap();
        let report = completed(h.scheduler.run_cycle(noon(21)).unwrap());

        let added: Vec<_> = report.added.iter().map(|a| a.boundary).collect();
        let dropped: Vec<_> = report.dropped.iter().map(|d| d.boundary).collect();
        assert_eq!(plan.adds, added);
        assert_eq!(plan.drops, dropped);
        assert!(h.scheduler.plan_cycle(noon(21)).unwrap().is_empty());
    }

    #[test]
    fn cycle_reconciles_compression() {
        let h = harness(RetryPolicy::NONE);
        let report = completed(h.scheduler.run_cycle(noon(15)).unwrap());

        assert!(!report.compression_changes.is_empty());
        let modes: Vec<_> = h.manager.partitions().iter().map(|p| p.compression).collect();
        assert_eq!(
            modes,
            vec![
                ebbtide_storage::CompressionMode::Page,
                ebbtide_storage::CompressionMode::Page,
                ebbtide_storage::CompressionMode::Row,
                ebbtide_storage::CompressionMode::Row,
                ebbtide_storage::CompressionMode::None
            ]
        );
    }

    #[test]
    fn step_budget_bounds_a_cycle() {
        let engine = Arc::new(InMemoryEngine::new());
        let config = TableConfig::default()
            .tiers(TierConfig::single(TierId(1)))
            .retention(RetentionPolicy::new(3, 10, DAY));
        let manager = Arc::new(
            SlidingWindowManager::new(engine, Arc::new(StrictSchemaRegistry::new()), &config)
                .unwrap(),
        );
        let scheduler =
            RetentionScheduler::new(manager.clone(), Arc::new(InMemoryArchive::new()), RetryPolicy::NONE, 4);

        let report = completed(scheduler.run_cycle(noon(1)).unwrap());
        assert_eq!(report.added.len(), 4);
        let report = completed(scheduler.run_cycle(noon(1)).unwrap());
        assert_eq!(report.added.len(), 4);
    }

    #[test]
    fn invalid_policy_rejected_before_any_work() {
        let h = harness(RetryPolicy::NONE);
        let far = PartitionKey::new(i64::MAX - 10);
        let err = h.scheduler.run_cycle(far).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidPolicy { .. }));
    }

    #[test]
    fn backoff_millis_saturate() {
        assert_eq!(millis(Duration::from_millis(250)), 250);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
