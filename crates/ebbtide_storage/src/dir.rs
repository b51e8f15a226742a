//! Directory-backed storage engine.
//!
//! Each tier is a subdirectory of the engine root. A partition is a single
//! record-log file in the directory of the tier holding it, and a staging
//! area is a file of the same format. Switching renames a file between its
//! staging name and its partition name, so no row is rewritten.
//!
//! ```text
//! <root>/
//! ├── tier-1/
//! │   ├── p-3.rows
//! │   └── staging-<uuid>.rows
//! └── tier-2/
//!     └── p-1.rows
//! ```

use crate::engine::{check_domain, StagingHandle, StagingInfo, StorageEngine};
use crate::error::{StorageError, StorageResult};
use crate::log::RecordLog;
use crate::schema::TableStructure;
use crate::types::{CompressionMode, KeyRange, PartitionId, PartitionKey, Row, TierId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const ROWS_EXT: &str = "rows";
const STAGING_PREFIX: &str = "staging-";
const PARTITION_PREFIX: &str = "p-";

#[derive(Debug, Clone)]
struct Placement {
    tier: TierId,
    rows: u64,
    compression: CompressionMode,
}

#[derive(Debug)]
struct StagingMeta {
    tier: TierId,
    structure: TableStructure,
}

#[derive(Debug, Default)]
struct DirState {
    partitions: HashMap<PartitionId, Placement>,
    staging: HashMap<Uuid, StagingMeta>,
}

/// Storage engine keeping one directory per tier.
///
/// All mutations are serialized through an internal lock. Renames stay
/// within the engine root, so they are atomic on a single filesystem.
#[derive(Debug)]
pub struct DirEngine {
    root: PathBuf,
    capacities: HashMap<TierId, Option<u64>>,
    state: Mutex<DirState>,
}

impl DirEngine {
    /// Opens an engine at `root` with the given tiers, creating directories as
    /// needed and indexing existing partition and staging files.
    ///
    /// Staging areas found on disk are adopted with an empty structure until
    /// [`DirEngine::with_structure`] stamps them.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or a file is corrupted.
    pub fn open(root: &Path, tiers: &[TierId]) -> StorageResult<Self> {
        let mut state = DirState::default();
        for &tier in tiers {
            let dir = tier_dir(root, tier);
            fs::create_dir_all(&dir)?;
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let Some(stem) = rows_file_stem(&path) else {
                    continue;
                };
                if let Some(id) = stem.strip_prefix(PARTITION_PREFIX) {
                    let Ok(id) = id.parse::<u64>() else {
                        continue;
                    };
                    let rows = RecordLog::read_file(&path)?.len() as u64;
                    state.partitions.insert(
                        PartitionId(id),
                        Placement {
                            tier,
                            rows,
                            compression: CompressionMode::None,
                        },
                    );
                } else if let Some(id) = stem.strip_prefix(STAGING_PREFIX) {
                    let Ok(id) = Uuid::parse_str(id) else {
                        continue;
                    };
                    state.staging.insert(
                        id,
                        StagingMeta {
                            tier,
                            structure: TableStructure::default(),
                        },
                    );
                }
            }
        }

        tracing::debug!(
            root = %root.display(),
            partitions = state.partitions.len(),
            staging = state.staging.len(),
            "opened directory engine"
        );

        Ok(Self {
            root: root.to_path_buf(),
            capacities: tiers.iter().map(|&tier| (tier, None)).collect(),
            state: Mutex::new(state),
        })
    }

    /// Caps the bytes a tier may hold. Allocations that would exceed it fail.
    #[must_use]
    pub fn with_capacity(mut self, tier: TierId, bytes: u64) -> Self {
        self.capacities.insert(tier, Some(bytes));
        self
    }

    /// Stamps the staging areas adopted at open with the table layout.
    #[must_use]
    pub fn with_structure(self, structure: &TableStructure) -> Self {
        for meta in self.state.lock().staging.values_mut() {
            meta.structure = structure.clone();
        }
        self
    }

    /// Returns the engine root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the tier currently holding a partition's file.
    #[must_use]
    pub fn tier_of(&self, partition: PartitionId) -> Option<TierId> {
        self.state.lock().partitions.get(&partition).map(|p| p.tier)
    }

    /// Reads every row of a partition.
    pub fn read_partition(&self, partition: PartitionId) -> StorageResult<Vec<Row>> {
        let state = self.state.lock();
        match state.partitions.get(&partition) {
            Some(placement) => read_rows(&self.partition_path(placement.tier, partition)),
            None => Ok(Vec::new()),
        }
    }

    fn partition_path(&self, tier: TierId, partition: PartitionId) -> PathBuf {
        tier_dir(&self.root, tier).join(format!("{PARTITION_PREFIX}{}.{ROWS_EXT}", partition.0))
    }

    fn staging_path(&self, staging: &StagingHandle) -> PathBuf {
        tier_dir(&self.root, staging.tier).join(format!("{STAGING_PREFIX}{}.{ROWS_EXT}", staging.id))
    }

    fn tier_usage(&self, tier: TierId) -> StorageResult<u64> {
        let mut used = 0;
        for entry in fs::read_dir(tier_dir(&self.root, tier))? {
            used += entry?.metadata()?.len();
        }
        Ok(used)
    }

    fn known_staging<'a>(
        state: &'a DirState,
        staging: &StagingHandle,
    ) -> StorageResult<&'a StagingMeta> {
        state
            .staging
            .get(&staging.id)
            .ok_or(StorageError::UnknownStaging(staging.id))
    }
}

impl StorageEngine for DirEngine {
    fn allocate_staging(
        &self,
        tier: TierId,
        estimated_size: u64,
        structure: &TableStructure,
    ) -> StorageResult<StagingHandle> {
        let Some(capacity) = self.capacities.get(&tier) else {
            return Err(StorageError::allocation_failed(tier, "tier not configured"));
        };
        if let Some(capacity) = capacity {
            let used = self.tier_usage(tier)?;
            if used.saturating_add(estimated_size) > *capacity {
                return Err(StorageError::allocation_failed(
                    tier,
                    format!("{used} of {capacity} bytes used, {estimated_size} requested"),
                ));
            }
        }

        let mut state = self.state.lock();
        let handle = StagingHandle::new(tier);
        let mut log = RecordLog::open(&self.staging_path(&handle))?;
        log.sync()?;
        state.staging.insert(
            handle.id,
            StagingMeta {
                tier,
                structure: structure.clone(),
            },
        );
        Ok(handle)
    }

    fn load_staging(&self, staging: &StagingHandle, rows: &[Row]) -> StorageResult<u64> {
        let state = self.state.lock();
        Self::known_staging(&state, staging)?;

        let mut log = RecordLog::open(&self.staging_path(staging))?;
        let encoded: Vec<Vec<u8>> = rows.iter().map(encode_row).collect();
        log.append_all(encoded.iter().map(Vec::as_slice))?;
        log.sync()?;
        Ok(log.records()?.len() as u64)
    }

    fn staging_info(&self, staging: &StagingHandle) -> StorageResult<StagingInfo> {
        let state = self.state.lock();
        let meta = Self::known_staging(&state, staging)?;
        let rows = read_rows(&self.staging_path(staging))?;
        Ok(StagingInfo {
            rows: rows.len() as u64,
            bytes: rows.iter().map(Row::encoded_size).sum(),
            min_key: rows.iter().map(|row| row.key).min(),
            max_key: rows.iter().map(|row| row.key).max(),
            structure: meta.structure.clone(),
        })
    }

    fn read_staging(&self, staging: &StagingHandle) -> StorageResult<Vec<Row>> {
        let state = self.state.lock();
        Self::known_staging(&state, staging)?;
        read_rows(&self.staging_path(staging))
    }

    fn discard_staging(&self, staging: &StagingHandle) -> StorageResult<()> {
        let mut state = self.state.lock();
        Self::known_staging(&state, staging)?;
        remove_if_exists(&self.staging_path(staging))?;
        state.staging.remove(&staging.id);
        Ok(())
    }

    fn switch_in(
        &self,
        staging: &StagingHandle,
        target: PartitionId,
        range: &KeyRange,
    ) -> StorageResult<u64> {
        let mut state = self.state.lock();
        Self::known_staging(&state, staging)?;

        let source = self.staging_path(staging);
        let rows = read_rows(&source)?;
        check_domain(rows.iter().map(|row| &row.key), range)?;

        if let Some(existing) = state.partitions.get(&target) {
            if existing.rows > 0 {
                return Err(StorageError::TargetNotEmpty {
                    partition: target,
                    rows: existing.rows,
                });
            }
            remove_if_exists(&self.partition_path(existing.tier, target))?;
        }

        let destination = self.partition_path(staging.tier, target);
        fs::rename(&source, &destination)?;
        sync_dir(&tier_dir(&self.root, staging.tier))?;

        state.staging.remove(&staging.id);
        let moved = rows.len() as u64;
        let compression = state
            .partitions
            .get(&target)
            .map_or(CompressionMode::None, |p| p.compression);
        state.partitions.insert(
            target,
            Placement {
                tier: staging.tier,
                rows: moved,
                compression,
            },
        );
        Ok(moved)
    }

    fn switch_out(
        &self,
        source: PartitionId,
        tier: TierId,
        structure: &TableStructure,
    ) -> StorageResult<StagingHandle> {
        if !self.capacities.contains_key(&tier) {
            return Err(StorageError::allocation_failed(tier, "tier not configured"));
        }
        let mut state = self.state.lock();
        let handle = StagingHandle::new(tier);
        let destination = self.staging_path(&handle);

        match state.partitions.get_mut(&source) {
            Some(placement) => {
                let from = self.partition_path(placement.tier, source);
                if from.exists() {
                    fs::rename(&from, &destination)?;
                    sync_dir(&tier_dir(&self.root, placement.tier))?;
                } else {
                    RecordLog::open(&destination)?.sync()?;
                }
                placement.rows = 0;
            }
            None => {
                RecordLog::open(&destination)?.sync()?;
            }
        }
        sync_dir(&tier_dir(&self.root, tier))?;

        state.staging.insert(
            handle.id,
            StagingMeta {
                tier,
                structure: structure.clone(),
            },
        );
        Ok(handle)
    }

    fn relocate(&self, partition: PartitionId, tier: TierId) -> StorageResult<()> {
        if !self.capacities.contains_key(&tier) {
            return Err(StorageError::allocation_failed(tier, "tier not configured"));
        }
        let mut state = self.state.lock();
        let Some(placement) = state.partitions.get(&partition).cloned() else {
            state.partitions.insert(
                partition,
                Placement {
                    tier,
                    rows: 0,
                    compression: CompressionMode::None,
                },
            );
            return Ok(());
        };
        if placement.tier == tier {
            return Ok(());
        }

        let from = self.partition_path(placement.tier, partition);
        if from.exists() {
            fs::rename(&from, self.partition_path(tier, partition))?;
            sync_dir(&tier_dir(&self.root, tier))?;
        }
        state.partitions.insert(partition, Placement { tier, ..placement });
        Ok(())
    }

    fn apply_compression(
        &self,
        partition: PartitionId,
        mode: CompressionMode,
    ) -> StorageResult<()> {
        let mut state = self.state.lock();
        match state.partitions.get_mut(&partition) {
            Some(placement) => {
                placement.compression = mode;
                Ok(())
            }
            None => Err(StorageError::Compression {
                partition,
                message: "partition has no storage".to_string(),
            }),
        }
    }

    fn partition_rows(&self, partition: PartitionId) -> StorageResult<u64> {
        Ok(self
            .state
            .lock()
            .partitions
            .get(&partition)
            .map_or(0, |p| p.rows))
    }

    fn partition_ids(&self) -> StorageResult<Vec<PartitionId>> {
        let mut ids: Vec<_> = self.state.lock().partitions.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn staging_areas(&self) -> StorageResult<Vec<StagingHandle>> {
        Ok(self
            .state
            .lock()
            .staging
            .iter()
            .map(|(&id, meta)| StagingHandle { id, tier: meta.tier })
            .collect())
    }
}

fn tier_dir(root: &Path, tier: TierId) -> PathBuf {
    root.join(format!("tier-{}", tier.0))
}

fn rows_file_stem(path: &Path) -> Option<&str> {
    if path.extension()?.to_str()? != ROWS_EXT {
        return None;
    }
    path.file_stem()?.to_str()
}

fn encode_row(row: &Row) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + row.payload.len());
    buf.extend_from_slice(&row.key.0.to_le_bytes());
    buf.extend_from_slice(&row.payload);
    buf
}

fn decode_row(record: &[u8]) -> StorageResult<Row> {
    let Some((key, payload)) = record.split_first_chunk::<8>() else {
        return Err(StorageError::corrupted(format!(
            "row record of {} bytes is shorter than its key",
            record.len()
        )));
    };
    Ok(Row::new(PartitionKey(i64::from_le_bytes(*key)), payload.to_vec()))
}

fn read_rows(path: &Path) -> StorageResult<Vec<Row>> {
    RecordLog::read_file(path)?
        .iter()
        .map(|record| decode_row(record))
        .collect()
}

fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> StorageResult<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HOT: TierId = TierId(1);
    const COLD: TierId = TierId(2);

    fn rows(keys: &[i64]) -> Vec<Row> {
        keys.iter()
            .map(|&k| Row::new(PartitionKey(k), format!("row-{k}").into_bytes()))
            .collect()
    }

    fn staged(engine: &DirEngine, keys: &[i64]) -> StagingHandle {
        let handle = engine
            .allocate_staging(HOT, 0, &TableStructure::default())
            .unwrap();
        engine.load_staging(&handle, &rows(keys)).unwrap();
        handle
    }

    #[test]
    fn switch_in_renames_staging_file() {
        let dir = tempdir().unwrap();
        let engine = DirEngine::open(dir.path(), &[HOT, COLD]).unwrap();
        let handle = staged(&engine, &[100, 150]);
        let staging_file = engine.staging_path(&handle);
        assert!(staging_file.exists());

        let range = KeyRange::new(Some(PartitionKey(100)), Some(PartitionKey(200)));
        assert_eq!(engine.switch_in(&handle, PartitionId(4), &range).unwrap(), 2);

        assert!(!staging_file.exists());
        assert!(engine.partition_path(HOT, PartitionId(4)).exists());
        assert_eq!(engine.read_partition(PartitionId(4)).unwrap(), rows(&[100, 150]));
    }

    #[test]
    fn domain_violation_leaves_staging_in_place() {
        let dir = tempdir().unwrap();
        let engine = DirEngine::open(dir.path(), &[HOT]).unwrap();
        let handle = staged(&engine, &[100, 300]);

        let range = KeyRange::new(Some(PartitionKey(100)), Some(PartitionKey(200)));
        let err = engine.switch_in(&handle, PartitionId(1), &range).unwrap_err();

        assert!(matches!(err, StorageError::DomainViolation { key: PartitionKey(300), .. }));
        assert_eq!(engine.staging_info(&handle).unwrap().rows, 2);
        assert_eq!(engine.partition_rows(PartitionId(1)).unwrap(), 0);
    }

    #[test]
    fn switch_out_then_reopen_recovers_staging() {
        let dir = tempdir().unwrap();
        let handle;
        {
            let engine = DirEngine::open(dir.path(), &[HOT, COLD]).unwrap();
            let loaded = staged(&engine, &[5, 6, 7]);
            engine.switch_in(&loaded, PartitionId(1), &KeyRange::UNBOUNDED).unwrap();
            handle = engine
                .switch_out(PartitionId(1), COLD, &TableStructure::default())
                .unwrap();
            assert_eq!(engine.partition_rows(PartitionId(1)).unwrap(), 0);
        }

        let engine = DirEngine::open(dir.path(), &[HOT, COLD]).unwrap();
        assert_eq!(engine.staging_areas().unwrap(), vec![handle]);
        assert_eq!(engine.read_staging(&handle).unwrap(), rows(&[5, 6, 7]));
    }

    #[test]
    fn reopen_indexes_partition_files_and_stamps_staging() {
        let dir = tempdir().unwrap();
        {
            let engine = DirEngine::open(dir.path(), &[HOT]).unwrap();
            let loaded = staged(&engine, &[1, 2]);
            engine.switch_in(&loaded, PartitionId(3), &KeyRange::UNBOUNDED).unwrap();
            staged(&engine, &[4]);
        }

        let layout = TableStructure::with_columns(["ts:timestamp"]);
        let engine = DirEngine::open(dir.path(), &[HOT]).unwrap().with_structure(&layout);

        assert_eq!(engine.partition_ids().unwrap(), vec![PartitionId(3)]);
        assert_eq!(engine.partition_rows(PartitionId(3)).unwrap(), 2);
        let adopted = engine.staging_areas().unwrap();
        assert_eq!(adopted.len(), 1);
        assert_eq!(engine.staging_info(&adopted[0]).unwrap().structure, layout);
    }

    #[test]
    fn relocate_moves_partition_between_tiers() {
        let dir = tempdir().unwrap();
        let engine = DirEngine::open(dir.path(), &[HOT, COLD]).unwrap();
        let handle = staged(&engine, &[1]);
        engine.switch_in(&handle, PartitionId(9), &KeyRange::UNBOUNDED).unwrap();

        engine.relocate(PartitionId(9), COLD).unwrap();

        assert_eq!(engine.tier_of(PartitionId(9)), Some(COLD));
        assert!(engine.partition_path(COLD, PartitionId(9)).exists());
        assert!(!engine.partition_path(HOT, PartitionId(9)).exists());
    }

    #[test]
    fn capacity_limits_allocation() {
        let dir = tempdir().unwrap();
        let engine = DirEngine::open(dir.path(), &[HOT]).unwrap().with_capacity(HOT, 64);

        let err = engine
            .allocate_staging(HOT, 1024, &TableStructure::default())
            .unwrap_err();
        assert!(matches!(err, StorageError::AllocationFailed { tier: HOT, .. }));

        let unknown = engine
            .allocate_staging(TierId(7), 0, &TableStructure::default())
            .unwrap_err();
        assert!(unknown.is_transient());
    }

    #[test]
    fn discard_removes_file() {
        let dir = tempdir().unwrap();
        let engine = DirEngine::open(dir.path(), &[HOT]).unwrap();
        let handle = staged(&engine, &[1]);
        let path = engine.staging_path(&handle);

        engine.discard_staging(&handle).unwrap();

        assert!(!path.exists());
        assert!(matches!(
            engine.read_staging(&handle),
            Err(StorageError::UnknownStaging(_))
        ));
    }
}
