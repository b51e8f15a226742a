//! Administrative surface of one partitioned table.

use crate::archive::{ArchiveSink, FileArchive, InMemoryArchive};
use crate::catalog::CatalogSnapshot;
use crate::config::{RetentionPolicy, TableConfig};
use crate::dir::TableDir;
use crate::error::LifecycleResult;
use crate::manifest::ManifestStore;
use crate::scheduler::{CycleOutcome, CyclePlan, RetentionScheduler};
use crate::stats::StatsSnapshot;
use crate::window::{
    AddedPartition, CancellationToken, DroppedPartition, PendingDrop, SlidingWindowManager,
};
use ebbtide_storage::{
    DirEngine, InMemoryEngine, PartitionKey, Row, SchemaRegistry, StagingHandle, StorageEngine,
    StrictSchemaRegistry,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Outcome of an administrative call that may have nothing to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AdminOutcome<T> {
    /// The change was made.
    Applied(T),
    /// The table was already in the requested state.
    AlreadySatisfied,
}

impl<T> AdminOutcome<T> {
    /// Returns true if the call changed the table.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Returns the applied value, if any.
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::AlreadySatisfied => None,
        }
    }
}

/// A time-partitioned table under lifecycle management.
///
/// # Example
///
/// ```rust
/// use ebbtide_core::{AdminOutcome, PartitionedTable, TableConfig};
/// use ebbtide_storage::PartitionKey;
///
/// let table = PartitionedTable::in_memory(TableConfig::default()).unwrap();
/// let feb = PartitionKey::from_ymd(2023, 2, 1).unwrap();
///
/// assert!(table.add_partition(feb).unwrap().is_applied());
/// assert_eq!(table.add_partition(feb).unwrap(), AdminOutcome::AlreadySatisfied);
/// assert_eq!(table.partition_stats().len(), 2);
/// ```
pub struct PartitionedTable {
    manager: Arc<SlidingWindowManager>,
    scheduler: RetentionScheduler,
    archive: Arc<dyn ArchiveSink>,
    /// Polled by admin calls. The scheduler has its own.
    admin_cancel: CancellationToken,
    /// Keeps the directory lock for the table's lifetime.
    dir: Option<Arc<TableDir>>,
}

impl PartitionedTable {
    /// Opens or creates a table stored under `path`.
    ///
    /// Partition data lives in a directory engine under `data/`, archived
    /// batches in `archive.log`, and the catalog in `MANIFEST`.
    ///
    /// # Errors
    ///
    /// - `TableLocked` if another process has the table open
    /// - `InvalidFormat` or `ChecksumMismatch` if the manifest is damaged
    pub fn open(path: &Path, config: TableConfig) -> LifecycleResult<Self> {
        config.validate()?;
        let dir = Arc::new(TableDir::open(path, config.create_if_missing)?);
        let is_new = dir.is_new_table();

        let mut engine = DirEngine::open(&dir.data_dir(), &config.tiers.tier_ids())?
            .with_structure(&config.structure);
        for spec in &config.tiers.tiers {
            if let Some(partitions) = spec.capacity {
                engine = engine.with_capacity(
                    spec.id,
                    u64::from(partitions).saturating_mul(config.estimated_partition_size),
                );
            }
        }
        let archive = Arc::new(FileArchive::open(&dir.archive_path())?);
        let store: Arc<dyn ManifestStore> = dir.clone();

        let mut table = Self::with_parts(
            Arc::new(engine),
            Arc::new(StrictSchemaRegistry::new()),
            archive,
            Some(store),
            &config,
        )?;
        table.dir = Some(dir);
        info!(path = %path.display(), new = is_new, partitions = table.partition_stats().len(), "table opened");
        Ok(table)
    }

    /// Creates a table held entirely in memory.
    pub fn in_memory(config: TableConfig) -> LifecycleResult<Self> {
        Self::with_parts(
            Arc::new(InMemoryEngine::new()),
            Arc::new(StrictSchemaRegistry::new()),
            Arc::new(InMemoryArchive::new()),
            None,
            &config,
        )
    }

    /// Assembles a table from injected collaborators.
    ///
    /// Without a manifest store nothing survives the process.
    pub fn with_parts(
        engine: Arc<dyn StorageEngine>,
        schema: Arc<dyn SchemaRegistry>,
        archive: Arc<dyn ArchiveSink>,
        store: Option<Arc<dyn ManifestStore>>,
        config: &TableConfig,
    ) -> LifecycleResult<Self> {
        let manager = Arc::new(match store {
            Some(store) => SlidingWindowManager::open(engine, schema, config, store)?,
            None => SlidingWindowManager::new(engine, schema, config)?,
        });
        let scheduler = RetentionScheduler::new(
            manager.clone(),
            archive.clone(),
            config.retry,
            config.max_steps_per_cycle,
        );
        Ok(Self {
            manager,
            scheduler,
            archive,
            admin_cancel: CancellationToken::new(),
            dir: None,
        })
    }

    /// Returns the table directory, if the table is stored on disk.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref().map(TableDir::path)
    }

    /// Returns the window manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<SlidingWindowManager> {
        &self.manager
    }

    /// Returns the retention scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &RetentionScheduler {
        &self.scheduler
    }

    /// Returns the archive sink.
    #[must_use]
    pub fn archive(&self) -> &Arc<dyn ArchiveSink> {
        &self.archive
    }

    /// Returns the token admin calls poll.
    ///
    /// Cancelling it stops admin adds and drops for the rest of the table's
    /// lifetime. Scheduler runs are cancelled through
    /// [`RetentionScheduler::cancellation_token`] and leave admin calls alone.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.admin_cancel.clone()
    }

    /// Adds an empty partition above `boundary`.
    ///
    /// Adding the current newest boundary again is already satisfied.
    pub fn add_partition(
        &self,
        boundary: PartitionKey,
    ) -> LifecycleResult<AdminOutcome<AddedPartition>> {
        if self.manager.catalog().newest_boundary() == Some(boundary) {
            return Ok(AdminOutcome::AlreadySatisfied);
        }
        self.manager
            .add_partition(boundary, &[], &self.admin_cancel)
            .map(AdminOutcome::Applied)
    }

    /// Adds a partition above `boundary` holding `rows`.
    pub fn add_partition_with_rows(
        &self,
        boundary: PartitionKey,
        rows: &[Row],
    ) -> LifecycleResult<AddedPartition> {
        self.manager
            .add_partition(boundary, rows, &self.admin_cancel)
    }

    /// Retries an add from a staging area a failed switch left behind.
    pub fn add_partition_staged(
        &self,
        boundary: PartitionKey,
        staging: StagingHandle,
    ) -> LifecycleResult<AddedPartition> {
        self.manager
            .add_partition_staged(boundary, staging, &self.admin_cancel)
    }

    /// Discards a staging area a failed add kept for retry.
    pub fn discard_staging(&self, staging: StagingHandle) -> LifecycleResult<()> {
        self.manager.discard_staging(staging)
    }

    /// Archives and removes the oldest partition.
    pub fn drop_oldest_partition(&self) -> LifecycleResult<AdminOutcome<DroppedPartition>> {
        let dropped = self
            .manager
            .drop_oldest_partition(self.archive.as_ref(), &self.admin_cancel)?;
        Ok(dropped.map_or(AdminOutcome::AlreadySatisfied, AdminOutcome::Applied))
    }

    /// Returns every partition, oldest first.
    #[must_use]
    pub fn partition_stats(&self) -> CatalogSnapshot {
        self.manager.partitions()
    }

    /// Replaces the retention policy.
    pub fn set_retention_policy(
        &self,
        policy: RetentionPolicy,
    ) -> LifecycleResult<AdminOutcome<RetentionPolicy>> {
        if self.scheduler.set_policy(policy)? {
            Ok(AdminOutcome::Applied(policy))
        } else {
            Ok(AdminOutcome::AlreadySatisfied)
        }
    }

    /// Returns the retention policy.
    #[must_use]
    pub fn retention_policy(&self) -> RetentionPolicy {
        self.scheduler.policy()
    }

    /// Runs one retention cycle as of `now`.
    pub fn run_retention_cycle(&self, now: PartitionKey) -> LifecycleResult<CycleOutcome> {
        self.scheduler.run_cycle(now)
    }

    /// Describes what a retention cycle at `now` would do.
    pub fn plan_retention_cycle(&self, now: PartitionKey) -> LifecycleResult<CyclePlan> {
        self.scheduler.plan_cycle(now)
    }

    /// Returns a drop that stopped after switch-out and needs a retry.
    #[must_use]
    pub fn pending_attention(&self) -> Option<PendingDrop> {
        self.manager.pending_drop()
    }

    /// Returns the lifecycle counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.manager.stats().snapshot()
    }
}

impl std::fmt::Debug for PartitionedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedTable")
            .field("path", &self.path())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PartitionState;
    use crate::config::DAY;
    use crate::error::LifecycleError;
    use crate::tier::{TierConfig, TierSpec};
    use ebbtide_storage::{KeyRange, TierId};
    use tempfile::tempdir;

    fn key(m: u32, d: u32) -> PartitionKey {
        PartitionKey::from_ymd(2023, m, d).unwrap()
    }

    #[test]
    fn admin_calls_report_already_satisfied() {
        let table = PartitionedTable::in_memory(TableConfig::default()).unwrap();

        assert_eq!(table.drop_oldest_partition().unwrap(), AdminOutcome::AlreadySatisfied);
        assert!(table.add_partition(key(2, 1)).unwrap().is_applied());
        assert_eq!(table.add_partition(key(2, 1)).unwrap(), AdminOutcome::AlreadySatisfied);

        let policy = RetentionPolicy::new(10, 1, DAY);
        assert!(table.set_retention_policy(policy).unwrap().is_applied());
        assert_eq!(table.set_retention_policy(policy).unwrap(), AdminOutcome::AlreadySatisfied);
    }

    #[test]
    fn add_with_rows_rejects_existing_boundary() {
        let table = PartitionedTable::in_memory(TableConfig::default()).unwrap();
        table.add_partition(key(2, 1)).unwrap();

        let err = table
            .add_partition_with_rows(key(2, 1), &[Row::new(key(2, 2), b"r".to_vec())])
            .unwrap_err();
        assert!(matches!(err, LifecycleError::BoundaryConflict { .. }));
    }

    #[test]
    fn partition_stats_reports_states() {
        let table = PartitionedTable::in_memory(TableConfig::default()).unwrap();
        table.add_partition(key(1, 1)).unwrap();
        table
            .add_partition_with_rows(key(2, 1), &[Row::new(key(2, 3), b"r".to_vec())])
            .unwrap();

        let stats = table.partition_stats();
        let states: Vec<_> = stats.iter().map(|p| p.state).collect();
        assert_eq!(
            states,
            vec![PartitionState::Sealed, PartitionState::Sealed, PartitionState::Active]
        );
        assert_eq!(stats[2].row_count, 1);
        assert_eq!(table.stats().partitions_added, 2);
    }

    #[test]
    fn on_disk_table_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");
        {
            let table = PartitionedTable::open(&path, TableConfig::default()).unwrap();
            table
                .add_partition_with_rows(key(1, 1), &[Row::new(key(1, 5), b"jan".to_vec())])
                .unwrap();
            table.add_partition(key(2, 1)).unwrap();
            table
                .set_retention_policy(RetentionPolicy::new(5, 1, DAY))
                .unwrap();
        }

        let table = PartitionedTable::open(&path, TableConfig::default()).unwrap();
        let stats = table.partition_stats();
        assert_eq!(table.manager().catalog().boundaries(), vec![key(1, 1), key(2, 1)]);
        assert_eq!(stats[1].row_count, 1);
        assert_eq!(table.retention_policy(), RetentionPolicy::new(5, 1, DAY));
    }

    #[test]
    fn on_disk_drop_lands_in_archive_log() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");
        let table = PartitionedTable::open(&path, TableConfig::default()).unwrap();
        table
            .add_partition_with_rows(key(1, 1), &[Row::new(key(1, 20), b"x".to_vec())])
            .unwrap();
        table.add_partition(key(2, 1)).unwrap();
        table.add_partition(key(3, 1)).unwrap();

        // The oldest partition is empty, the next one holds one row.
        let first = table.drop_oldest_partition().unwrap().applied().unwrap();
        assert!(first.receipt.is_none());
        let second = table.drop_oldest_partition().unwrap().applied().unwrap();
        assert_eq!(second.rows, 1);
        drop(table);

        let archive = FileArchive::open(&path.join("archive.log")).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.batches().unwrap()[0].rows.len(), 1);
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");
        let _first = PartitionedTable::open(&path, TableConfig::default()).unwrap();

        let err = PartitionedTable::open(&path, TableConfig::default()).unwrap_err();
        assert!(matches!(err, LifecycleError::TableLocked));
    }

    #[test]
    fn tier_capacity_limits_partitions() {
        let tiers = TierConfig {
            tiers: vec![TierSpec::new(TierId(1), "hot").with_capacity(2)],
            ingest_tier: TierId(1),
            cold_tier: None,
            hot_partitions: 1,
        };
        let table = PartitionedTable::in_memory(TableConfig::default().tiers(tiers)).unwrap();

        table.add_partition(key(1, 1)).unwrap();
        let err = table.add_partition(key(2, 1)).unwrap_err();
        assert!(matches!(err, LifecycleError::StorageAllocation { .. }));
        assert_eq!(table.partition_stats().len(), 2);
    }

    #[test]
    fn retention_cycle_through_facade() {
        let config = TableConfig::default().retention(RetentionPolicy::new(2, 1, DAY));
        let table = PartitionedTable::in_memory(config).unwrap();
        let now = PartitionKey::new(key(3, 10).as_i64() + 3600);

        let plan = table.plan_retention_cycle(now).unwrap();
        assert_eq!(plan.adds, vec![key(3, 10), key(3, 11), key(3, 12)]);
        assert!(matches!(table.run_retention_cycle(now).unwrap(), CycleOutcome::Completed(_)));
        assert!(table.pending_attention().is_none());
        assert_eq!(table.stats().cycles_completed, 1);
    }

    #[test]
    fn cancelled_scheduler_leaves_admin_calls_usable() {
        let table = PartitionedTable::in_memory(TableConfig::default()).unwrap();
        table.scheduler().cancellation_token().cancel();

        assert!(table.add_partition(key(1, 1)).unwrap().is_applied());
        assert!(table.drop_oldest_partition().unwrap().is_applied());

        table.cancellation_token().cancel();
        let err = table.add_partition(key(2, 1)).unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled));
    }

    #[test]
    fn kept_staging_can_be_discarded() {
        let table = PartitionedTable::in_memory(TableConfig::default()).unwrap();
        let stray = [Row::new(key(1, 1), b"early".to_vec())];

        let err = table.add_partition_with_rows(key(2, 1), &stray).unwrap_err();
        let staging = err.kept_staging().unwrap();

        table.discard_staging(staging).unwrap();
        assert!(table.discard_staging(staging).is_err());
        assert!(table.add_partition(key(2, 1)).unwrap().is_applied());
    }

    #[test]
    fn reopen_discards_orphaned_storage() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");
        let orphan;
        {
            let table = PartitionedTable::open(&path, TableConfig::default()).unwrap();
            table.add_partition(key(1, 1)).unwrap();
            orphan = table.manager().catalog().next_partition_id();

            // Leftovers of an add whose catalog write never happened.
            let engine = table.manager().engine();
            let structure = table.manager().structure().clone();
            let rows = [Row::new(key(2, 3), b"lost".to_vec())];
            let staged = engine.allocate_staging(TierId(1), 0, &structure).unwrap();
            engine.load_staging(&staged, &rows).unwrap();
            engine
                .switch_in(&staged, orphan, &KeyRange::new(Some(key(2, 1)), None))
                .unwrap();
            let loose = engine.allocate_staging(TierId(1), 0, &structure).unwrap();
            engine.load_staging(&loose, &rows).unwrap();
        }

        let table = PartitionedTable::open(&path, TableConfig::default()).unwrap();
        let engine = table.manager().engine();
        assert_eq!(engine.partition_rows(orphan).unwrap(), 0);
        assert!(engine.staging_areas().unwrap().is_empty());
        assert_eq!(table.stats().orphans_discarded, 2);
        assert!(table.manager().catalog().next_partition_id() > orphan);

        let added = table.add_partition(key(2, 1)).unwrap().applied().unwrap();
        assert_ne!(added.partition, orphan);
    }
}
