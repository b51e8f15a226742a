//! Sliding window manager.
//!
//! The only component that mutates catalog boundaries. Every operation runs
//! under the table's operation lock against a private working copy of the
//! catalog and tier map, which is published only once the operation commits.
//! Readers keep using the previous snapshot until then.

use super::cancel::CancellationToken;
use super::plan::{MigrationKind, MigrationPlan, PendingDrop};
use crate::archive::{ArchiveBatch, ArchiveReceipt, ArchiveSink};
use crate::catalog::{CatalogSnapshot, PartitionCatalog, PartitionState};
use crate::compression::CompressionPolicy;
use crate::config::{RetentionPolicy, TableConfig};
use crate::error::{BoundaryConflictKind, LifecycleError, LifecycleResult};
use crate::manifest::{Manifest, ManifestStore};
use crate::stats::LifecycleStats;
use crate::tier::{StorageTierMap, TierConfig};
use ebbtide_storage::{
    CompressionMode, KeyRange, PartitionId, PartitionKey, Row, SchemaRegistry, StagingHandle,
    StorageEngine, StorageError, TableStructure, TierId,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A committed AddPartition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddedPartition {
    /// The new partition.
    pub partition: PartitionId,
    /// Its lower boundary.
    pub boundary: PartitionKey,
    /// Tier holding its data.
    pub tier: TierId,
    /// Rows switched in.
    pub rows: u64,
}

/// A committed DropOldestPartition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DroppedPartition {
    /// The dropped partition.
    pub partition: PartitionId,
    /// The boundary that was merged away.
    pub boundary: PartitionKey,
    /// Key range the partition covered.
    pub range: KeyRange,
    /// Rows handed to the archive.
    pub rows: u64,
    /// Archive acknowledgment. `None` when the partition was empty.
    pub receipt: Option<ArchiveReceipt>,
    /// True if the drop resumed an earlier partial migration.
    pub resumed: bool,
}

/// A compression target the engine accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompressionChange {
    /// The partition.
    pub partition: PartitionId,
    /// Previous mode.
    pub from: CompressionMode,
    /// New mode.
    pub to: CompressionMode,
}

/// A tier relocation the engine performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierChange {
    /// The partition.
    pub partition: PartitionId,
    /// Previous tier.
    pub from: TierId,
    /// New tier.
    pub to: TierId,
}

#[derive(Debug, Clone)]
struct WindowState {
    catalog: PartitionCatalog,
    tier_map: StorageTierMap,
    pending: Option<PendingDrop>,
    retention: RetentionPolicy,
}

enum AddSource<'r> {
    Rows(&'r [Row]),
    Staged(StagingHandle),
}

/// Progress of one AddPartition, used to reverse completed steps.
struct AddExecution {
    boundary: PartitionKey,
    staging: StagingHandle,
    working: WindowState,
    split: Option<PartitionId>,
    switched: bool,
    committed: bool,
}

/// Orchestrates split plus switch-in and switch-out plus merge as atomic
/// units against the catalog, the tier map and the storage engine.
///
/// # Concurrency
///
/// One operation at a time per table. A second caller gets
/// `ConcurrentModification` immediately instead of waiting.
pub struct SlidingWindowManager {
    engine: Arc<dyn StorageEngine>,
    schema: Arc<dyn SchemaRegistry>,
    structure: TableStructure,
    tiers: TierConfig,
    compression: CompressionPolicy,
    estimated_partition_size: u64,
    manifest: Option<Arc<dyn ManifestStore>>,
    stats: Arc<LifecycleStats>,
    /// Held for the duration of one lifecycle operation.
    write_lock: Mutex<()>,
    state: RwLock<WindowState>,
}

impl SlidingWindowManager {
    /// Creates a manager over a fresh catalog holding one unbounded partition.
    ///
    /// Nothing is persisted.
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        schema: Arc<dyn SchemaRegistry>,
        config: &TableConfig,
    ) -> LifecycleResult<Self> {
        config.validate()?;
        let catalog = PartitionCatalog::new(config.tiers.ingest_tier);
        let tier_map = StorageTierMap::rebuild(&config.tiers, &catalog.partitions())?;

        Ok(Self {
            engine,
            schema,
            structure: config.structure.clone(),
            tiers: config.tiers.clone(),
            compression: config.compression,
            estimated_partition_size: config.estimated_partition_size,
            manifest: None,
            stats: Arc::new(LifecycleStats::new()),
            write_lock: Mutex::new(()),
            state: RwLock::new(WindowState {
                catalog,
                tier_map,
                pending: None,
                retention: config.retention,
            }),
        })
    }

    /// Creates a manager that persists to `store`, resuming from the stored
    /// manifest when there is one.
    ///
    /// The retention policy and any pending drop come from the manifest;
    /// tiers, compression and structure come from `config`.
    pub fn open(
        engine: Arc<dyn StorageEngine>,
        schema: Arc<dyn SchemaRegistry>,
        config: &TableConfig,
        store: Arc<dyn ManifestStore>,
    ) -> LifecycleResult<Self> {
        let mut manager = Self::new(engine, schema, config)?;

        match store.load()? {
            Some(manifest) => {
                let catalog = manifest.catalog()?;
                let tier_map = StorageTierMap::rebuild(&config.tiers, &catalog.partitions())
                    .map_err(|e| {
                        LifecycleError::invalid_policy(format!(
                            "stored partitions do not fit the configured tiers: {e}"
                        ))
                    })?;
                if let Some(pending) = manifest.pending_drop {
                    warn!(
                        partition = %pending.partition,
                        boundary = %pending.boundary,
                        "table has a partially migrated drop; retry drop to complete it"
                    );
                }
                info!(partitions = catalog.len(), "loaded catalog from manifest");
                *manager.state.get_mut() = WindowState {
                    catalog,
                    tier_map,
                    pending: manifest.pending_drop,
                    retention: manifest.retention,
                };
                manager.manifest = Some(store);
                manager.recover()?;
            }
            None => {
                manager.manifest = Some(store);
                let initial = manager.state.read().clone();
                manager.persist(&initial)?;
            }
        }
        Ok(manager)
    }

    /// Brings the engine back in line with a catalog loaded after a restart.
    ///
    /// - Partitions the catalog does not know come from adds that never
    ///   committed. Their rows are switched out and discarded and their ids
    ///   are reserved so no later split reuses them.
    /// - A staging area holding exactly the rows the oldest partition is
    ///   missing comes from a drop that stopped before its pending record
    ///   was written. It is switched back in.
    /// - Every other staging area except the pending drop's is discarded.
    fn recover(&self) -> LifecycleResult<()> {
        let mut working = self.working_state();
        let mut reserved = false;

        for id in self.engine.partition_ids()? {
            if working.catalog.get(id).is_some() {
                continue;
            }
            reserved |= working.catalog.reserve_past(id);
            let rows = self.engine.partition_rows(id)?;
            if rows == 0 {
                continue;
            }
            let staging = self
                .engine
                .switch_out(id, self.tiers.ingest_tier, &self.structure)?;
            self.engine.discard_staging(&staging)?;
            self.stats.record_recovered_orphan();
            warn!(partition = %id, rows, "discarded rows of an add that never committed");
        }

        let kept = working.pending.map(|p| p.staging.id);
        for staging in self.engine.staging_areas()? {
            if Some(staging.id) == kept {
                continue;
            }
            if kept.is_none() && self.restore_unrecorded_drop(&working.catalog, &staging)? {
                continue;
            }
            self.engine.discard_staging(&staging)?;
            self.stats.record_recovered_orphan();
            warn!(%staging, "discarded staging area with no owner");
        }

        if reserved {
            info!(next = %working.catalog.next_partition_id(), "reserved partition ids found in storage");
            self.persist(&working)?;
            self.publish(working);
        }
        Ok(())
    }

    /// Switches `staging` back into the oldest partition if it holds the rows
    /// a drop took out before recording itself.
    fn restore_unrecorded_drop(
        &self,
        catalog: &PartitionCatalog,
        staging: &StagingHandle,
    ) -> LifecycleResult<bool> {
        if catalog.oldest_boundary().is_none() {
            return Ok(false);
        }
        let oldest = catalog.oldest();
        if oldest.row_count == 0 || self.engine.partition_rows(oldest.id)? != 0 {
            return Ok(false);
        }
        let info = self.engine.staging_info(staging)?;
        if info.rows != oldest.row_count
            || !self
                .schema
                .validate_structural_match(&info.structure, &self.structure)
        {
            return Ok(false);
        }
        match self.engine.switch_in(staging, oldest.id, &oldest.range) {
            Ok(rows) => {
                info!(partition = %oldest.id, rows, "restored rows of an unrecorded drop");
                Ok(true)
            }
            Err(StorageError::DomainViolation { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns a snapshot of every partition, oldest first.
    #[must_use]
    pub fn partitions(&self) -> CatalogSnapshot {
        self.state.read().catalog.partitions()
    }

    /// Returns a copy of the catalog.
    #[must_use]
    pub fn catalog(&self) -> PartitionCatalog {
        self.state.read().catalog.clone()
    }

    /// Returns the tier recorded for a partition.
    #[must_use]
    pub fn tier_of(&self, partition: PartitionId) -> Option<TierId> {
        self.state.read().tier_map.tier_of(partition)
    }

    /// Returns the drop awaiting completion, if any.
    #[must_use]
    pub fn pending_drop(&self) -> Option<PendingDrop> {
        self.state.read().pending
    }

    /// Returns the current retention policy.
    #[must_use]
    pub fn retention(&self) -> RetentionPolicy {
        self.state.read().retention
    }

    /// Returns the lifecycle counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<LifecycleStats> {
        &self.stats
    }

    /// Returns the storage engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Returns the tier configuration.
    #[must_use]
    pub fn tiers(&self) -> &TierConfig {
        &self.tiers
    }

    /// Returns the table layout staging areas must match.
    #[must_use]
    pub fn structure(&self) -> &TableStructure {
        &self.structure
    }

    /// Replaces the retention policy. Returns false if it was already set.
    pub fn set_retention(&self, policy: RetentionPolicy) -> LifecycleResult<bool> {
        policy.validate()?;
        let _guard = self.acquire()?;
        let mut working = self.working_state();
        if working.retention == policy {
            return Ok(false);
        }
        working.retention = policy;
        self.persist(&working)?;
        self.publish(working);
        info!(
            retain = policy.retain_periods,
            lookahead = policy.lookahead_periods,
            period_secs = policy.period_length.as_secs(),
            "retention policy updated"
        );
        Ok(true)
    }

    /// Describes the AddPartition that `boundary` would run.
    pub fn plan_add(&self, boundary: PartitionKey, rows: u64) -> LifecycleResult<MigrationPlan> {
        let state = self.state.read();
        check_growth(&state.catalog, boundary)?;
        Ok(MigrationPlan {
            kind: MigrationKind::SwitchIn,
            boundary,
            partition: state.catalog.next_partition_id(),
            range: KeyRange::new(Some(boundary), None),
            tier: self.tiers.ingest_tier,
            rows,
            load_rows: rows > 0,
            staging: None,
        })
    }

    /// Describes the next DropOldestPartition, or `None` if there is no
    /// boundary left to remove.
    #[must_use]
    pub fn plan_drop(&self) -> Option<MigrationPlan> {
        let state = self.state.read();
        if let Some(pending) = state.pending {
            return Some(MigrationPlan {
                kind: MigrationKind::SwitchOut,
                boundary: pending.boundary,
                partition: pending.partition,
                range: pending.range,
                tier: pending.staging.tier,
                rows: pending.rows,
                load_rows: false,
                staging: Some(pending.staging),
            });
        }
        let boundary = state.catalog.oldest_boundary()?;
        let oldest = state.catalog.oldest();
        Some(MigrationPlan {
            kind: MigrationKind::SwitchOut,
            boundary,
            partition: oldest.id,
            range: oldest.range,
            tier: oldest.tier,
            rows: oldest.row_count,
            load_rows: false,
            staging: None,
        })
    }

    /// Adds a partition above `boundary`, switching `rows` into it.
    ///
    /// All steps succeed or none are observable. If the switch fails on
    /// structure or key domain, the staging area is kept and returned inside
    /// the error for [`SlidingWindowManager::add_partition_staged`].
    ///
    /// # Errors
    ///
    /// - `BoundaryConflict` if `boundary` is not above the newest boundary
    /// - `StorageAllocation` if the ingest tier cannot take the partition
    /// - `SchemaMismatch` or `DomainViolation` if the staged data does not fit
    /// - `ConcurrentModification` if another operation is running
    /// - `Cancelled` if `cancel` fired before the split
    pub fn add_partition(
        &self,
        boundary: PartitionKey,
        rows: &[Row],
        cancel: &CancellationToken,
    ) -> LifecycleResult<AddedPartition> {
        let _guard = self.acquire()?;
        self.count_error(self.add_locked(boundary, AddSource::Rows(rows), cancel))
    }

    /// Adds a partition above `boundary` from an existing staging area.
    pub fn add_partition_staged(
        &self,
        boundary: PartitionKey,
        staging: StagingHandle,
        cancel: &CancellationToken,
    ) -> LifecycleResult<AddedPartition> {
        let _guard = self.acquire()?;
        self.count_error(self.add_locked(boundary, AddSource::Staged(staging), cancel))
    }

    /// Discards a staging area a failed add kept for retry.
    ///
    /// The staging area of a pending drop is refused: its rows are not
    /// archived yet.
    pub fn discard_staging(&self, staging: StagingHandle) -> LifecycleResult<()> {
        let _guard = self.acquire()?;
        if let Some(pending) = self.state.read().pending {
            if pending.staging.id == staging.id {
                return Err(LifecycleError::PartialMigration {
                    partition: pending.partition,
                    boundary: pending.boundary,
                    message: "staging area holds a drop awaiting the archive".to_string(),
                });
            }
        }
        self.engine.discard_staging(&staging)?;
        info!(%staging, "discarded kept staging area");
        Ok(())
    }

    /// Switches the oldest partition out, archives it, and merges its
    /// boundary away.
    ///
    /// Returns `None` when the catalog has no boundary. If a previous drop
    /// stopped after its switch-out, this call resumes it from the recorded
    /// staging area.
    ///
    /// # Errors
    ///
    /// - `PartialMigration` if the archive did not acknowledge; the catalog
    ///   is unchanged and the drop must be retried
    /// - `Cancelled` if `cancel` fired before the archive handoff; the data is
    ///   switched back in
    /// - `ConcurrentModification` if another operation is running
    pub fn drop_oldest_partition(
        &self,
        archive: &dyn ArchiveSink,
        cancel: &CancellationToken,
    ) -> LifecycleResult<Option<DroppedPartition>> {
        let _guard = self.acquire()?;
        self.count_error(self.drop_locked(archive, cancel))
    }

    /// Requests the compression each live partition's position calls for.
    ///
    /// Requests are fire-and-forget: a rejected request is logged and
    /// retried on the next call. Returns the changes the engine accepted.
    pub fn reconcile_compression(&self) -> LifecycleResult<Vec<CompressionChange>> {
        let _guard = self.acquire()?;
        let mut working = self.working_state();
        let snapshot = working.catalog.partitions();
        let total = u32::try_from(snapshot.len()).unwrap_or(u32::MAX);
        let pending = working.pending.map(|p| p.partition);

        let mut changes = Vec::new();
        for partition in snapshot.iter() {
            if partition.state == PartitionState::Archived || Some(partition.id) == pending {
                continue;
            }
            let position = total - 1 - partition.ordinal;
            let target = self.compression.policy_for(position, total);
            if target == partition.compression {
                continue;
            }

            let result = self.engine.apply_compression(partition.id, target);
            self.stats.record_compression_request(result.is_err());
            match result {
                Ok(()) => {
                    working.catalog.set_compression(partition.id, target)?;
                    debug!(partition = %partition.id, from = %partition.compression, to = %target, "compression requested");
                    changes.push(CompressionChange {
                        partition: partition.id,
                        from: partition.compression,
                        to: target,
                    });
                }
                Err(e) => {
                    warn!(partition = %partition.id, mode = %target, error = %e, "compression request rejected");
                }
            }
        }

        if !changes.is_empty() {
            self.persist(&working)?;
            self.publish(working);
        }
        Ok(changes)
    }

    /// Moves partitions that aged out of the hot set to the cold tier.
    ///
    /// Best-effort per partition: a full tier or a failed relocation is
    /// logged and retried on the next call.
    pub fn reconcile_tiers(&self) -> LifecycleResult<Vec<TierChange>> {
        let _guard = self.acquire()?;
        let mut working = self.working_state();
        let snapshot = working.catalog.partitions();
        let total = u32::try_from(snapshot.len()).unwrap_or(u32::MAX);
        let pending = working.pending.map(|p| p.partition);

        let mut changes = Vec::new();
        for partition in snapshot.iter() {
            if partition.state == PartitionState::Archived || Some(partition.id) == pending {
                continue;
            }
            let position = total - 1 - partition.ordinal;
            let target = self.tiers.tier_for(position);
            if target == partition.tier {
                continue;
            }
            if !working.tier_map.has_room(target) {
                warn!(partition = %partition.id, tier = %target, "tier full, relocation deferred");
                continue;
            }
            if let Err(e) = self.engine.relocate(partition.id, target) {
                warn!(partition = %partition.id, tier = %target, error = %e, "relocation failed");
                continue;
            }

            working.tier_map.assign(partition.id, target)?;
            working.catalog.set_tier(partition.id, target)?;
            self.stats.record_tier_move();
            debug!(partition = %partition.id, from = %partition.tier, to = %target, "partition relocated");
            changes.push(TierChange {
                partition: partition.id,
                from: partition.tier,
                to: target,
            });
        }

        if !changes.is_empty() {
            self.persist(&working)?;
            self.publish(working);
        }
        Ok(changes)
    }

    fn add_locked(
        &self,
        boundary: PartitionKey,
        source: AddSource<'_>,
        cancel: &CancellationToken,
    ) -> LifecycleResult<AddedPartition> {
        let working = self.working_state();
        check_growth(&working.catalog, boundary)?;

        let tier = match &source {
            AddSource::Rows(_) => self.tiers.ingest_tier,
            AddSource::Staged(staging) => staging.tier,
        };
        if !working.tier_map.has_room(tier) {
            return Err(LifecycleError::StorageAllocation {
                tier: Some(tier),
                message: "tier is at capacity".to_string(),
            });
        }

        let staging = match source {
            AddSource::Rows(rows) => {
                let estimate = if rows.is_empty() {
                    self.estimated_partition_size
                } else {
                    rows.iter().map(Row::encoded_size).sum()
                };
                let staging = self.engine.allocate_staging(tier, estimate, &self.structure)?;
                debug!(%staging, estimate, "allocated staging");
                if !rows.is_empty() {
                    if let Err(e) = self.engine.load_staging(&staging, rows) {
                        self.discard_quietly(&staging);
                        return Err(e.into());
                    }
                }
                staging
            }
            AddSource::Staged(staging) => staging,
        };

        let mut exec = AddExecution {
            boundary,
            staging,
            working,
            split: None,
            switched: false,
            committed: false,
        };
        match self.run_add(&mut exec, cancel) {
            Ok(added) => Ok(added),
            Err(err) => Err(self.rollback_add(&mut exec, err)),
        }
    }

    fn run_add(
        &self,
        exec: &mut AddExecution,
        cancel: &CancellationToken,
    ) -> LifecycleResult<AddedPartition> {
        let info = self.engine.staging_info(&exec.staging)?;
        if !self
            .schema
            .validate_structural_match(&info.structure, &self.structure)
        {
            return Err(LifecycleError::SchemaMismatch {
                message: format!("{} does not match the table structure", exec.staging),
                staging: None,
            });
        }

        if cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        let partition = exec.working.catalog.split(exec.boundary)?;
        exec.split = Some(partition);
        self.stats.record_split();
        let range = KeyRange::new(Some(exec.boundary), None);

        let moved = self.engine.switch_in(&exec.staging, partition, &range)?;
        exec.switched = true;
        if moved != info.rows {
            return Err(LifecycleError::Storage(StorageError::corrupted(format!(
                "switch-in moved {moved} rows but {} were staged",
                info.rows
            ))));
        }
        debug!(%partition, boundary = %exec.boundary, rows = moved, "switched in");

        let tier = exec.staging.tier;
        exec.working.tier_map.assign(partition, tier)?;
        let catalog = &mut exec.working.catalog;
        catalog.set_row_count(partition, moved)?;
        catalog.set_tier(partition, tier)?;

        let total = u32::try_from(catalog.len()).unwrap_or(u32::MAX);
        catalog.set_compression(partition, self.compression.policy_for(0, total))?;

        self.persist(&exec.working)?;
        exec.committed = true;
        self.publish(exec.working.clone());
        self.stats.record_added(moved);
        info!(%partition, boundary = %exec.boundary, %tier, rows = moved, "partition added");

        Ok(AddedPartition {
            partition,
            boundary: exec.boundary,
            tier,
            rows: moved,
        })
    }

    /// Reverses the completed steps of a failed add, newest first.
    fn rollback_add(&self, exec: &mut AddExecution, err: LifecycleError) -> LifecycleError {
        debug_assert!(!exec.committed);
        warn!(boundary = %exec.boundary, error = %err, "rolling back add partition");
        self.stats.record_rollback();

        if let Some(partition) = exec.split {
            // The working catalog holding the split is dropped unpublished,
            // but its id stays taken.
            self.state.write().catalog.reserve_past(partition);
            if exec.switched {
                match self
                    .engine
                    .switch_out(partition, exec.staging.tier, &self.structure)
                {
                    Ok(handle) => exec.staging = handle,
                    Err(e) => {
                        error!(%partition, error = %e, "could not switch data back out during rollback");
                        return err;
                    }
                }
            }
        }

        if matches!(
            err,
            LifecycleError::SchemaMismatch { .. } | LifecycleError::DomainViolation { .. }
        ) {
            info!(staging = %exec.staging, "keeping staging area for retry");
            return err.with_staging(exec.staging);
        }
        self.discard_quietly(&exec.staging);
        err
    }

    fn drop_locked(
        &self,
        archive: &dyn ArchiveSink,
        cancel: &CancellationToken,
    ) -> LifecycleResult<Option<DroppedPartition>> {
        let mut working = self.working_state();

        let (pending, resumed) = match working.pending {
            Some(pending) => {
                info!(partition = %pending.partition, staging = %pending.staging, "resuming pending drop");
                (pending, true)
            }
            None => {
                let Some(boundary) = working.catalog.oldest_boundary() else {
                    return Ok(None);
                };
                if cancel.is_cancelled() {
                    return Err(LifecycleError::Cancelled);
                }
                let oldest = working.catalog.oldest().clone();
                // The engine stamps the new staging area with the table layout
                // the partition was validated against at switch-in.
                let staging = self
                    .engine
                    .switch_out(oldest.id, oldest.tier, &self.structure)?;
                let mut pending = PendingDrop {
                    partition: oldest.id,
                    boundary,
                    range: oldest.range,
                    staging,
                    rows: 0,
                };
                let recorded = self.engine.staging_info(&staging).map_err(LifecycleError::from).and_then(|info| {
                    pending.rows = info.rows;
                    working.pending = Some(pending);
                    self.persist(&working)
                });
                if let Err(e) = recorded {
                    self.restore_switched_out(&pending)?;
                    return Err(e);
                }
                self.publish(working.clone());
                debug!(partition = %oldest.id, %staging, rows = pending.rows, "switched out");
                (pending, false)
            }
        };

        if cancel.is_cancelled() {
            self.restore_switched_out(&pending)?;
            working.pending = None;
            self.persist(&working)?;
            self.publish(working);
            info!(partition = %pending.partition, "drop cancelled before archive handoff");
            return Err(LifecycleError::Cancelled);
        }

        let receipt = if pending.rows > 0 {
            match self.hand_off(archive, &pending) {
                Ok(receipt) => Some(receipt),
                Err(e) => return Err(self.partial_migration(&pending, &e)),
            }
        } else {
            debug!(partition = %pending.partition, "empty partition, skipping archive");
            None
        };

        // The archive holds the data. From here the drop runs to completion.
        let committed = working
            .catalog
            .mark_archived(pending.partition)
            .and_then(|()| working.catalog.merge(pending.boundary))
            .and_then(|_| {
                working.tier_map.release(pending.partition);
                working.pending = None;
                self.persist(&working)
            });
        if let Err(e) = committed {
            return Err(self.partial_migration(&pending, &e));
        }
        self.publish(working);
        self.stats.record_merge();
        self.stats.record_dropped(pending.rows);
        self.discard_quietly(&pending.staging);
        info!(
            partition = %pending.partition,
            boundary = %pending.boundary,
            rows = pending.rows,
            resumed,
            "oldest partition dropped"
        );

        Ok(Some(DroppedPartition {
            partition: pending.partition,
            boundary: pending.boundary,
            range: pending.range,
            rows: pending.rows,
            receipt,
            resumed,
        }))
    }

    fn hand_off(
        &self,
        archive: &dyn ArchiveSink,
        pending: &PendingDrop,
    ) -> LifecycleResult<ArchiveReceipt> {
        let rows = self.engine.read_staging(&pending.staging)?;
        let batch = ArchiveBatch {
            batch_id: pending.staging.id,
            partition: pending.partition,
            range: pending.range,
            rows,
        };
        let receipt = archive.receive(&batch)?;
        if receipt.rows != pending.rows {
            return Err(LifecycleError::archive(format!(
                "archive acknowledged {} rows, {} were handed off",
                receipt.rows, pending.rows
            )));
        }
        debug!(partition = %pending.partition, batch = %receipt.batch_id, "archive acknowledged");
        Ok(receipt)
    }

    fn partial_migration(&self, pending: &PendingDrop, cause: &LifecycleError) -> LifecycleError {
        self.stats.record_partial_migration();
        error!(
            partition = %pending.partition,
            boundary = %pending.boundary,
            error = %cause,
            "drop stopped after switch-out; needs retry"
        );
        LifecycleError::PartialMigration {
            partition: pending.partition,
            boundary: pending.boundary,
            message: cause.to_string(),
        }
    }

    /// Switches a pending drop's data back into its partition.
    fn restore_switched_out(&self, pending: &PendingDrop) -> LifecycleResult<()> {
        let info = self
            .engine
            .staging_info(&pending.staging)
            .map_err(|e| self.partial_migration(pending, &e.into()))?;
        if !self
            .schema
            .validate_structural_match(&info.structure, &self.structure)
        {
            let mismatch = LifecycleError::SchemaMismatch {
                message: format!("{} does not match the table structure", pending.staging),
                staging: None,
            };
            return Err(self.partial_migration(pending, &mismatch));
        }
        match self
            .engine
            .switch_in(&pending.staging, pending.partition, &pending.range)
        {
            Ok(_) => {
                debug!(partition = %pending.partition, "switched data back in");
                Ok(())
            }
            Err(e) => Err(self.partial_migration(pending, &e.into())),
        }
    }

    fn acquire(&self) -> LifecycleResult<MutexGuard<'_, ()>> {
        self.write_lock
            .try_lock()
            .ok_or(LifecycleError::ConcurrentModification)
    }

    fn working_state(&self) -> WindowState {
        self.state.read().clone()
    }

    fn publish(&self, next: WindowState) {
        *self.state.write() = next;
    }

    fn persist(&self, state: &WindowState) -> LifecycleResult<()> {
        let Some(store) = &self.manifest else {
            return Ok(());
        };
        let mut manifest = Manifest::new(
            &state.catalog,
            self.tiers.clone(),
            self.compression,
            state.retention,
            self.structure.clone(),
        );
        manifest.pending_drop = state.pending;
        store.save(&manifest)
    }

    fn discard_quietly(&self, staging: &StagingHandle) {
        if let Err(e) = self.engine.discard_staging(staging) {
            warn!(%staging, error = %e, "failed to discard staging area");
        }
    }

    fn count_error<T>(&self, result: LifecycleResult<T>) -> LifecycleResult<T> {
        if result.is_err() {
            self.stats.record_error();
        }
        result
    }
}

impl std::fmt::Debug for SlidingWindowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SlidingWindowManager")
            .field("partitions", &state.catalog.len())
            .field("pending_drop", &state.pending)
            .field("retention", &state.retention)
            .finish_non_exhaustive()
    }
}

/// Rejects boundaries that do not extend the tail of the sequence.
fn check_growth(catalog: &PartitionCatalog, boundary: PartitionKey) -> LifecycleResult<()> {
    match catalog.newest_boundary() {
        Some(newest) if boundary == newest => Err(LifecycleError::boundary_conflict(
            boundary,
            BoundaryConflictKind::AlreadyExists,
        )),
        Some(newest) if boundary < newest => Err(LifecycleError::boundary_conflict(
            boundary,
            BoundaryConflictKind::NotAscending,
        )),
        _ => Ok(()),
    }
}
