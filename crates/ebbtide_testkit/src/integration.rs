//! Cross-crate invariant checks.
//!
//! Verifies that the catalog, the tier map and the storage engine agree
//! after any sequence of lifecycle operations.

use crate::fixtures::TestTable;
use crate::generators::WindowOp;
use ebbtide_core::{PartitionState, PartitionedTable, DAY};
use ebbtide_storage::{InMemoryEngine, PartitionKey, StorageEngine};
use std::collections::BTreeMap;

/// Checks the catalog and tier map of a table.
///
/// # Panics
///
/// Panics with a description of the first broken invariant.
pub fn check_catalog(table: &PartitionedTable) {
    let manager = table.manager();
    let catalog = manager.catalog();
    if let Err(e) = catalog.validate() {
        panic!("catalog invalid: {}", e);
    }

    let partitions = catalog.partitions();
    assert_eq!(
        partitions.len(),
        catalog.boundary_count() + 1,
        "partition count must be boundary count + 1"
    );

    let pending = manager.pending_drop();
    for (position, partition) in partitions.iter().enumerate() {
        let expected = if position + 1 == partitions.len() {
            PartitionState::Active
        } else {
            PartitionState::Sealed
        };
        assert_eq!(
            partition.state, expected,
            "{} at position {} has state {}",
            partition.id, position, partition.state
        );
        assert_eq!(
            manager.tier_of(partition.id),
            Some(partition.tier),
            "tier map disagrees with catalog for {}",
            partition.id
        );
    }

    if let Some(pending) = pending {
        assert_eq!(
            partitions[0].id, pending.partition,
            "a pending drop must target the oldest partition"
        );
        assert_eq!(catalog.oldest_boundary(), Some(pending.boundary));
    }
}

/// Checks that the engine holds what the catalog describes.
///
/// Row counts and key domains are compared for every partition except
/// one with a pending drop, whose rows sit in staging.
///
/// # Panics
///
/// Panics with a description of the first broken invariant.
pub fn check_engine(table: &PartitionedTable, engine: &InMemoryEngine) {
    let manager = table.manager();
    let pending = manager.pending_drop().map(|p| p.partition);

    for partition in manager.partitions().iter() {
        if pending == Some(partition.id) {
            continue;
        }
        let rows = engine.rows_of(partition.id);
        assert_eq!(
            rows.len() as u64,
            partition.row_count,
            "row count of {} disagrees with the engine",
            partition.id
        );
        for row in &rows {
            assert!(
                partition.range.contains(row.key),
                "row {} lies outside {} {}",
                row.key,
                partition.id,
                partition.range
            );
        }
        if let Some(tier) = engine.tier_of(partition.id) {
            assert_eq!(tier, partition.tier, "{} is stored in the wrong tier", partition.id);
        }
    }
}

/// Runs every invariant check against a fixture.
///
/// # Panics
///
/// Panics with a description of the first broken invariant.
pub fn check_invariants(fixture: &TestTable) {
    check_catalog(&fixture.table);
    check_engine(&fixture.table, &fixture.engine);
}

/// A reference model of a daily sliding window.
///
/// Tracks boundaries and per-partition row counts the way the table should,
/// so property tests can compare the two after each operation.
#[derive(Debug, Clone, Default)]
pub struct WindowModel {
    /// Row count keyed by lower boundary. The unbounded partition is `None`.
    partitions: BTreeMap<Option<PartitionKey>, u64>,
    /// Newest boundary ever added, dropped or not.
    high_water: Option<PartitionKey>,
    archived_rows: u64,
    archived_batches: usize,
}

impl WindowModel {
    /// Creates a model of a fresh table.
    pub fn new() -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(None, 0);
        Self {
            partitions,
            high_water: None,
            archived_rows: 0,
            archived_batches: 0,
        }
    }

    /// Returns the boundaries, oldest first.
    pub fn boundaries(&self) -> Vec<PartitionKey> {
        self.partitions.keys().filter_map(|k| *k).collect()
    }

    /// Returns row counts, oldest partition first.
    pub fn row_counts(&self) -> Vec<u64> {
        self.partitions.values().copied().collect()
    }

    /// Returns total rows handed to the archive.
    pub fn archived_rows(&self) -> u64 {
        self.archived_rows
    }

    /// Returns how many archive batches were delivered.
    pub fn archived_batches(&self) -> usize {
        self.archived_batches
    }

    /// Records an add at `boundary` carrying `rows` rows.
    pub fn add(&mut self, boundary: PartitionKey, rows: u64) {
        self.partitions.insert(Some(boundary), rows);
        self.high_water = Some(boundary);
    }

    /// Records a drop of the oldest partition. Returns false when the
    /// model has no boundary to remove.
    pub fn drop_oldest(&mut self) -> bool {
        let mut keys = self.partitions.keys().copied();
        let (Some(oldest), Some(Some(boundary))) = (keys.next(), keys.next()) else {
            return false;
        };
        let rows = self.partitions.remove(&oldest).unwrap_or(0);
        if rows > 0 {
            self.archived_rows += rows;
            self.archived_batches += 1;
        }
        // The upper neighbor takes over the unbounded lower end.
        let upper = self.partitions.remove(&Some(boundary)).unwrap_or(0);
        self.partitions.insert(None, upper);
        true
    }

    /// Returns the boundary `gap_days` past the newest one ever added.
    ///
    /// Dropped boundaries still count, so rows already loaded never fall
    /// above a new boundary.
    pub fn next_boundary(&self, start: PartitionKey, gap_days: u32) -> PartitionKey {
        let newest = self.high_water.unwrap_or(start);
        newest
            .checked_add_periods(DAY, gap_days)
            .unwrap_or(newest)
    }
}

/// Applies one operation to both the fixture and the model, then checks
/// that they agree.
///
/// # Panics
///
/// Panics if an operation fails or the table diverges from the model.
pub fn apply_and_compare(
    fixture: &TestTable,
    model: &mut WindowModel,
    start: PartitionKey,
    op: &WindowOp,
) {
    match op {
        WindowOp::Add { gap_days, rows } => {
            let boundary = model.next_boundary(start, *gap_days);
            let data = crate::fixtures::rows_from(boundary, *rows, 60);
            fixture
                .table
                .add_partition_with_rows(boundary, &data)
                .expect("add partition");
            model.add(boundary, *rows as u64);
        }
        WindowOp::Drop => {
            let outcome = fixture.table.drop_oldest_partition().expect("drop oldest");
            assert_eq!(outcome.is_applied(), model.drop_oldest());
        }
        WindowOp::Reconcile => {
            let manager = fixture.table.manager();
            manager.reconcile_compression().expect("reconcile compression");
            manager.reconcile_tiers().expect("reconcile tiers");
        }
    }

    let partitions = fixture.table.partition_stats();
    let boundaries: Vec<_> = partitions.iter().filter_map(|p| p.range.lower).collect();
    assert_eq!(boundaries, model.boundaries());
    let counts: Vec<_> = partitions.iter().map(|p| p.row_count).collect();
    assert_eq!(counts, model.row_counts());
    assert_eq!(fixture.archive.len(), model.archived_batches());
    let archived: u64 = fixture
        .archive
        .batches()
        .iter()
        .map(|b| b.rows.len() as u64)
        .sum();
    assert_eq!(archived, model.archived_rows());
    check_invariants(fixture);
}

/// Returns the engine's total row count across the catalog's partitions.
pub fn total_rows(fixture: &TestTable) -> u64 {
    fixture
        .table
        .partition_stats()
        .iter()
        .map(|p| fixture.engine.partition_rows(p.id).unwrap_or(0))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{day, scenarios, two_tier_config};
    use crate::generators::{window_ops_strategy, PropTestConfig};
    use proptest::prelude::*;

    #[test]
    fn daily_table_holds_invariants() {
        let fixture = scenarios::daily_table(day(2024, 1, 1), 5, 3);
        check_invariants(&fixture);
        assert_eq!(total_rows(&fixture), 15);
    }

    #[test]
    fn model_drop_moves_unbounded_end() {
        let mut model = WindowModel::new();
        model.add(day(2024, 1, 1), 0);
        model.add(day(2024, 1, 2), 4);

        assert!(model.drop_oldest());
        assert_eq!(model.boundaries(), vec![day(2024, 1, 2)]);
        assert_eq!(model.row_counts(), vec![0, 4]);

        assert!(model.drop_oldest());
        assert!(model.boundaries().is_empty());
        assert_eq!(model.row_counts(), vec![4]);
        assert_eq!(model.archived_batches(), 0);

        assert!(!model.drop_oldest());
    }

    #[test]
    #[should_panic(expected = "row count")]
    fn seeded_rows_are_detected() {
        let fixture = scenarios::daily_table(day(2024, 1, 1), 2, 1);
        let oldest = fixture.table.partition_stats()[0].id;
        fixture
            .engine
            .seed_partition(oldest, crate::fixtures::rows_from(day(2023, 12, 1), 2, 60));
        check_invariants(&fixture);
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn window_matches_model(ops in window_ops_strategy(1, 40)) {
            let fixture = TestTable::memory();
            let mut model = WindowModel::new();
            let start = day(2024, 1, 1);
            for op in &ops {
                apply_and_compare(&fixture, &mut model, start, op);
            }
        }

        #[test]
        fn two_tier_window_matches_model(ops in window_ops_strategy(1, 40)) {
            let fixture = TestTable::with_config(two_tier_config(2));
            let mut model = WindowModel::new();
            let start = day(2024, 1, 1);
            for op in &ops {
                apply_and_compare(&fixture, &mut model, start, op);
            }
        }
    }
}
