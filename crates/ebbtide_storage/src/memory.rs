//! In-memory storage engine for testing.

use crate::engine::{check_domain, StagingHandle, StagingInfo, StorageEngine};
use crate::error::{StorageError, StorageResult};
use crate::schema::TableStructure;
use crate::types::{CompressionMode, KeyRange, PartitionId, Row, TierId};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug)]
struct Staged {
    tier: TierId,
    structure: TableStructure,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct Stored {
    tier: Option<TierId>,
    compression: CompressionMode,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_allocations: u32,
    fail_compression: bool,
    staging_limits: HashMap<TierId, usize>,
}

#[derive(Debug, Default)]
struct EngineState {
    staging: HashMap<Uuid, Staged>,
    partitions: HashMap<PartitionId, Stored>,
    compression_requests: Vec<(PartitionId, CompressionMode)>,
    switches: u64,
}

/// An in-memory storage engine.
///
/// Switches move the row vector between the staging map and the partition
/// map, so no row is ever copied. Failures can be injected to exercise
/// rollback paths:
///
/// ```rust
/// use ebbtide_storage::{InMemoryEngine, StorageEngine, TableStructure, TierId};
///
/// let engine = InMemoryEngine::new();
/// engine.fail_next_allocations(1);
/// let structure = TableStructure::default();
/// assert!(engine.allocate_staging(TierId(1), 0, &structure).is_err());
/// assert!(engine.allocate_staging(TierId(1), 0, &structure).is_ok());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    state: RwLock<EngineState>,
    faults: RwLock<Faults>,
}

impl InMemoryEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.write().unavailable = unavailable;
    }

    /// Fails the next `count` staging allocations.
    pub fn fail_next_allocations(&self, count: u32) {
        self.faults.write().fail_allocations = count;
    }

    /// Makes compression requests fail.
    pub fn set_fail_compression(&self, fail: bool) {
        self.faults.write().fail_compression = fail;
    }

    /// Limits the number of live staging areas in a tier.
    pub fn set_staging_limit(&self, tier: TierId, limit: usize) {
        self.faults.write().staging_limits.insert(tier, limit);
    }

    /// Seeds a partition with rows, bypassing staging.
    pub fn seed_partition(&self, partition: PartitionId, rows: Vec<Row>) {
        let mut state = self.state.write();
        state.partitions.entry(partition).or_default().rows = rows;
    }

    /// Returns a copy of a partition's rows.
    #[must_use]
    pub fn rows_of(&self, partition: PartitionId) -> Vec<Row> {
        self.state
            .read()
            .partitions
            .get(&partition)
            .map(|stored| stored.rows.clone())
            .unwrap_or_default()
    }

    /// Returns the number of live staging areas.
    #[must_use]
    pub fn staging_count(&self) -> usize {
        self.state.read().staging.len()
    }

    /// Returns true if the staging area still exists.
    #[must_use]
    pub fn has_staging(&self, staging: &StagingHandle) -> bool {
        self.state.read().staging.contains_key(&staging.id)
    }

    /// Returns every compression request received, in order.
    #[must_use]
    pub fn compression_requests(&self) -> Vec<(PartitionId, CompressionMode)> {
        self.state.read().compression_requests.clone()
    }

    /// Returns the compression mode last applied to a partition.
    #[must_use]
    pub fn compression_of(&self, partition: PartitionId) -> CompressionMode {
        self.state
            .read()
            .partitions
            .get(&partition)
            .map(|stored| stored.compression)
            .unwrap_or_default()
    }

    /// Returns the tier a partition was last relocated to.
    #[must_use]
    pub fn tier_of(&self, partition: PartitionId) -> Option<TierId> {
        self.state
            .read()
            .partitions
            .get(&partition)
            .and_then(|stored| stored.tier)
    }

    /// Returns how many switches (in or out) completed.
    #[must_use]
    pub fn switch_count(&self) -> u64 {
        self.state.read().switches
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.faults.read().unavailable {
            return Err(StorageError::Unavailable("engine marked unavailable".to_string()));
        }
        Ok(())
    }
}

impl StorageEngine for InMemoryEngine {
    fn allocate_staging(
        &self,
        tier: TierId,
        _estimated_size: u64,
        structure: &TableStructure,
    ) -> StorageResult<StagingHandle> {
        self.check_available()?;
        {
            let mut faults = self.faults.write();
            if faults.fail_allocations > 0 {
                faults.fail_allocations -= 1;
                return Err(StorageError::allocation_failed(tier, "injected allocation failure"));
            }
            if let Some(&limit) = faults.staging_limits.get(&tier) {
                let live = self
                    .state
                    .read()
                    .staging
                    .values()
                    .filter(|staged| staged.tier == tier)
                    .count();
                if live >= limit {
                    return Err(StorageError::allocation_failed(
                        tier,
                        format!("staging limit of {limit} reached"),
                    ));
                }
            }
        }

        let handle = StagingHandle::new(tier);
        self.state.write().staging.insert(
            handle.id,
            Staged {
                tier,
                structure: structure.clone(),
                rows: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn load_staging(&self, staging: &StagingHandle, rows: &[Row]) -> StorageResult<u64> {
        self.check_available()?;
        let mut state = self.state.write();
        let staged = state
            .staging
            .get_mut(&staging.id)
            .ok_or(StorageError::UnknownStaging(staging.id))?;
        staged.rows.extend_from_slice(rows);
        Ok(staged.rows.len() as u64)
    }

    fn staging_info(&self, staging: &StagingHandle) -> StorageResult<StagingInfo> {
        let state = self.state.read();
        let staged = state
            .staging
            .get(&staging.id)
            .ok_or(StorageError::UnknownStaging(staging.id))?;
        Ok(StagingInfo {
            rows: staged.rows.len() as u64,
            bytes: staged.rows.iter().map(Row::encoded_size).sum(),
            min_key: staged.rows.iter().map(|row| row.key).min(),
            max_key: staged.rows.iter().map(|row| row.key).max(),
            structure: staged.structure.clone(),
        })
    }

    fn read_staging(&self, staging: &StagingHandle) -> StorageResult<Vec<Row>> {
        self.check_available()?;
        let state = self.state.read();
        state
            .staging
            .get(&staging.id)
            .map(|staged| staged.rows.clone())
            .ok_or(StorageError::UnknownStaging(staging.id))
    }

    fn discard_staging(&self, staging: &StagingHandle) -> StorageResult<()> {
        self.state
            .write()
            .staging
            .remove(&staging.id)
            .map(|_| ())
            .ok_or(StorageError::UnknownStaging(staging.id))
    }

    fn switch_in(
        &self,
        staging: &StagingHandle,
        target: PartitionId,
        range: &KeyRange,
    ) -> StorageResult<u64> {
        self.check_available()?;
        let mut state = self.state.write();

        let staged = state
            .staging
            .get(&staging.id)
            .ok_or(StorageError::UnknownStaging(staging.id))?;
        check_domain(staged.rows.iter().map(|row| &row.key), range)?;

        if let Some(existing) = state.partitions.get(&target) {
            if !existing.rows.is_empty() {
                return Err(StorageError::TargetNotEmpty {
                    partition: target,
                    rows: existing.rows.len() as u64,
                });
            }
        }

        let staged = state
            .staging
            .remove(&staging.id)
            .ok_or(StorageError::UnknownStaging(staging.id))?;
        let moved = staged.rows.len() as u64;
        let slot = state.partitions.entry(target).or_default();
        slot.rows = staged.rows;
        slot.tier = Some(staged.tier);
        state.switches += 1;
        Ok(moved)
    }

    fn switch_out(
        &self,
        source: PartitionId,
        tier: TierId,
        structure: &TableStructure,
    ) -> StorageResult<StagingHandle> {
        self.check_available()?;
        let mut state = self.state.write();
        let rows = state
            .partitions
            .get_mut(&source)
            .map(|stored| std::mem::take(&mut stored.rows))
            .unwrap_or_default();
        let handle = StagingHandle::new(tier);
        state.staging.insert(
            handle.id,
            Staged {
                tier,
                structure: structure.clone(),
                rows,
            },
        );
        state.switches += 1;
        Ok(handle)
    }

    fn relocate(&self, partition: PartitionId, tier: TierId) -> StorageResult<()> {
        self.check_available()?;
        self.state.write().partitions.entry(partition).or_default().tier = Some(tier);
        Ok(())
    }

    fn apply_compression(
        &self,
        partition: PartitionId,
        mode: CompressionMode,
    ) -> StorageResult<()> {
        self.check_available()?;
        let mut state = self.state.write();
        state.compression_requests.push((partition, mode));
        if self.faults.read().fail_compression {
            return Err(StorageError::Compression {
                partition,
                message: "injected compression failure".to_string(),
            });
        }
        state.partitions.entry(partition).or_default().compression = mode;
        Ok(())
    }

    fn partition_rows(&self, partition: PartitionId) -> StorageResult<u64> {
        Ok(self
            .state
            .read()
            .partitions
            .get(&partition)
            .map_or(0, |stored| stored.rows.len() as u64))
    }

    fn partition_ids(&self) -> StorageResult<Vec<PartitionId>> {
        let mut ids: Vec<_> = self.state.read().partitions.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn staging_areas(&self) -> StorageResult<Vec<StagingHandle>> {
        Ok(self
            .state
            .read()
            .staging
            .iter()
            .map(|(&id, staged)| StagingHandle { id, tier: staged.tier })
            .collect())
    }
}
