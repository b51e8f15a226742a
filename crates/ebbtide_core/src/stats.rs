//! Lifecycle statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ebbtide_core::{PartitionedTable, TableConfig};
//!
//! let table = PartitionedTable::in_memory(TableConfig::default())?;
//! table.run_retention_cycle(now)?;
//!
//! let stats = table.stats();
//! println!("Added: {}", stats.partitions_added);
//! println!("Dropped: {}", stats.partitions_dropped);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle counters for one table.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct LifecycleStats {
    // Catalog counters
    splits: AtomicU64,
    merges: AtomicU64,

    // Window counters
    partitions_added: AtomicU64,
    partitions_dropped: AtomicU64,
    rows_switched_in: AtomicU64,
    rows_archived: AtomicU64,
    rollbacks: AtomicU64,
    partial_migrations: AtomicU64,
    orphans_discarded: AtomicU64,

    // Reconciliation counters
    compression_requests: AtomicU64,
    compression_failures: AtomicU64,
    tier_moves: AtomicU64,

    // Scheduler counters
    cycles_completed: AtomicU64,
    cycles_skipped: AtomicU64,

    errors: AtomicU64,
}

impl LifecycleStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_split(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_merge(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a committed AddPartition.
    pub(crate) fn record_added(&self, rows: u64) {
        self.partitions_added.fetch_add(1, Ordering::Relaxed);
        self.rows_switched_in.fetch_add(rows, Ordering::Relaxed);
    }

    /// Records a committed DropOldestPartition.
    pub(crate) fn record_dropped(&self, rows: u64) {
        self.partitions_dropped.fetch_add(1, Ordering::Relaxed);
        self.rows_archived.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_partial_migration(&self) {
        self.partial_migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovered_orphan(&self) {
        self.orphans_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compression_request(&self, failed: bool) {
        self.compression_requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.compression_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_tier_move(&self) {
        self.tier_moves.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle(&self, skipped: bool) {
        if skipped {
            self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of boundary splits.
    pub fn splits(&self) -> u64 {
        self.splits.load(Ordering::Relaxed)
    }

    /// Returns the number of boundary merges.
    pub fn merges(&self) -> u64 {
        self.merges.load(Ordering::Relaxed)
    }

    /// Returns the number of committed AddPartition operations.
    pub fn partitions_added(&self) -> u64 {
        self.partitions_added.load(Ordering::Relaxed)
    }

    /// Returns the number of committed DropOldestPartition operations.
    pub fn partitions_dropped(&self) -> u64 {
        self.partitions_dropped.load(Ordering::Relaxed)
    }

    /// Returns rows moved into new partitions.
    pub fn rows_switched_in(&self) -> u64 {
        self.rows_switched_in.load(Ordering::Relaxed)
    }

    /// Returns rows handed to the archive.
    pub fn rows_archived(&self) -> u64 {
        self.rows_archived.load(Ordering::Relaxed)
    }

    /// Returns the number of operations rolled back.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Returns the number of drops that stopped between switch-out and merge.
    pub fn partial_migrations(&self) -> u64 {
        self.partial_migrations.load(Ordering::Relaxed)
    }

    /// Returns the number of orphaned partitions and staging areas discarded
    /// when the table was opened.
    pub fn orphans_discarded(&self) -> u64 {
        self.orphans_discarded.load(Ordering::Relaxed)
    }

    /// Returns the number of compression requests sent to the engine.
    pub fn compression_requests(&self) -> u64 {
        self.compression_requests.load(Ordering::Relaxed)
    }

    /// Returns the number of compression requests the engine rejected.
    pub fn compression_failures(&self) -> u64 {
        self.compression_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of partitions relocated between tiers.
    pub fn tier_moves(&self) -> u64 {
        self.tier_moves.load(Ordering::Relaxed)
    }

    /// Returns the number of scheduler runs that completed.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    /// Returns the number of scheduler runs skipped because one was in flight.
    pub fn cycles_skipped(&self) -> u64 {
        self.cycles_skipped.load(Ordering::Relaxed)
    }

    /// Returns the number of failed operations.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            splits: self.splits(),
            merges: self.merges(),
            partitions_added: self.partitions_added(),
            partitions_dropped: self.partitions_dropped(),
            rows_switched_in: self.rows_switched_in(),
            rows_archived: self.rows_archived(),
            rollbacks: self.rollbacks(),
            partial_migrations: self.partial_migrations(),
            orphans_discarded: self.orphans_discarded(),
            compression_requests: self.compression_requests(),
            compression_failures: self.compression_failures(),
            tier_moves: self.tier_moves(),
            cycles_completed: self.cycles_completed(),
            cycles_skipped: self.cycles_skipped(),
            errors: self.errors(),
        }
    }
}

/// A point-in-time snapshot of lifecycle statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Boundary splits.
    pub splits: u64,
    /// Boundary merges.
    pub merges: u64,
    /// Committed AddPartition operations.
    pub partitions_added: u64,
    /// Committed DropOldestPartition operations.
    pub partitions_dropped: u64,
    /// Rows moved into new partitions.
    pub rows_switched_in: u64,
    /// Rows handed to the archive.
    pub rows_archived: u64,
    /// Operations rolled back.
    pub rollbacks: u64,
    /// Drops stopped between switch-out and merge.
    pub partial_migrations: u64,
    /// Orphaned storage discarded at open.
    pub orphans_discarded: u64,
    /// Compression requests sent.
    pub compression_requests: u64,
    /// Compression requests rejected.
    pub compression_failures: u64,
    /// Tier relocations.
    pub tier_moves: u64,
    /// Completed scheduler runs.
    pub cycles_completed: u64,
    /// Skipped scheduler runs.
    pub cycles_skipped: u64,
    /// Failed operations.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = LifecycleStats::new();
        stats.record_added(10);
        stats.record_added(5);
        stats.record_dropped(7);
        stats.record_compression_request(false);
        stats.record_compression_request(true);
        stats.record_cycle(true);

        assert_eq!(stats.partitions_added(), 2);
        assert_eq!(stats.rows_switched_in(), 15);
        assert_eq!(stats.rows_archived(), 7);
        assert_eq!(stats.compression_requests(), 2);
        assert_eq!(stats.compression_failures(), 1);
        assert_eq!(stats.cycles_skipped(), 1);
        assert_eq!(stats.cycles_completed(), 0);
    }

    #[test]
    fn snapshot_matches_getters() {
        let stats = LifecycleStats::new();
        stats.record_split();
        stats.record_merge();
        stats.record_rollback();
        stats.record_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.splits, 1);
        assert_eq!(snapshot.merges, 1);
        assert_eq!(snapshot.rollbacks, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.partitions_added, 0);
    }
}
