//! Fault-injecting collaborators.
//!
//! Wrappers that fail a chosen number of calls before delegating, so tests
//! can stop a lifecycle operation at any step.

use ebbtide_core::{
    ArchiveBatch, ArchiveReceipt, ArchiveSink, LifecycleError, LifecycleResult, Manifest,
    ManifestStore,
};
use ebbtide_storage::{
    CompressionMode, KeyRange, PartitionId, Row, StagingHandle, StagingInfo, StorageEngine,
    StorageError, StorageResult, TableStructure, TierId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// An archive that rejects its first deliveries.
pub struct FlakyArchive {
    inner: Arc<dyn ArchiveSink>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyArchive {
    /// Wraps `inner`, failing the first `fail_first` deliveries.
    pub fn new(inner: Arc<dyn ArchiveSink>, fail_first: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(fail_first),
            attempts: AtomicU32::new(0),
        }
    }

    /// Fails the next `count` deliveries.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Returns how many deliveries were attempted.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ArchiveSink for FlakyArchive {
    fn receive(&self, batch: &ArchiveBatch) -> LifecycleResult<ArchiveReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LifecycleError::archive("injected delivery failure"));
        }
        self.inner.receive(batch)
    }

    fn contains(&self, batch_id: Uuid) -> bool {
        self.inner.contains(batch_id)
    }
}

/// Storage engine calls that can be failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    /// `allocate_staging`
    Allocate,
    /// `load_staging`
    Load,
    /// `read_staging`
    Read,
    /// `discard_staging`
    Discard,
    /// `switch_in`
    SwitchIn,
    /// `switch_out`
    SwitchOut,
    /// `relocate`
    Relocate,
    /// `apply_compression`
    Compress,
}

/// An engine wrapper that fails selected calls with `Unavailable`.
///
/// Failures are injected before the call reaches the inner engine, so a
/// failed call has no side effects.
pub struct FaultyEngine {
    inner: Arc<dyn StorageEngine>,
    pending: Mutex<HashMap<EngineOp, u32>>,
    calls: Mutex<HashMap<EngineOp, u64>>,
}

impl FaultyEngine {
    /// Wraps `inner` with no faults armed.
    pub fn new(inner: Arc<dyn StorageEngine>) -> Self {
        Self {
            inner,
            pending: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fails the next `count` calls of `op`.
    pub fn fail_next(&self, op: EngineOp, count: u32) {
        self.pending.lock().insert(op, count);
    }

    /// Returns how many times `op` was called, failed calls included.
    pub fn calls(&self, op: EngineOp) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn check(&self, op: EngineOp) -> StorageResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let mut pending = self.pending.lock();
        match pending.get_mut(&op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StorageError::Unavailable(format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }
}

impl StorageEngine for FaultyEngine {
    fn allocate_staging(
        &self,
        tier: TierId,
        estimated_size: u64,
        structure: &TableStructure,
    ) -> StorageResult<StagingHandle> {
        self.check(EngineOp::Allocate)?;
        self.inner.allocate_staging(tier, estimated_size, structure)
    }

    fn load_staging(&self, staging: &StagingHandle, rows: &[Row]) -> StorageResult<u64> {
        self.check(EngineOp::Load)?;
        self.inner.load_staging(staging, rows)
    }

    fn staging_info(&self, staging: &StagingHandle) -> StorageResult<StagingInfo> {
        self.inner.staging_info(staging)
    }

    fn read_staging(&self, staging: &StagingHandle) -> StorageResult<Vec<Row>> {
        self.check(EngineOp::Read)?;
        self.inner.read_staging(staging)
    }

    fn discard_staging(&self, staging: &StagingHandle) -> StorageResult<()> {
        self.check(EngineOp::Discard)?;
        self.inner.discard_staging(staging)
    }

    fn switch_in(
        &self,
        staging: &StagingHandle,
        target: PartitionId,
        range: &KeyRange,
    ) -> StorageResult<u64> {
        self.check(EngineOp::SwitchIn)?;
        self.inner.switch_in(staging, target, range)
    }

    fn switch_out(
        &self,
        source: PartitionId,
        tier: TierId,
        structure: &TableStructure,
    ) -> StorageResult<StagingHandle> {
        self.check(EngineOp::SwitchOut)?;
        self.inner.switch_out(source, tier, structure)
    }

    fn relocate(&self, partition: PartitionId, tier: TierId) -> StorageResult<()> {
        self.check(EngineOp::Relocate)?;
        self.inner.relocate(partition, tier)
    }

    fn apply_compression(
        &self,
        partition: PartitionId,
        mode: CompressionMode,
    ) -> StorageResult<()> {
        self.check(EngineOp::Compress)?;
        self.inner.apply_compression(partition, mode)
    }

    fn partition_rows(&self, partition: PartitionId) -> StorageResult<u64> {
        self.inner.partition_rows(partition)
    }

    fn partition_ids(&self) -> StorageResult<Vec<PartitionId>> {
        self.inner.partition_ids()
    }

    fn staging_areas(&self) -> StorageResult<Vec<StagingHandle>> {
        self.inner.staging_areas()
    }
}

/// A manifest store that stops saving after a number of successful saves.
///
/// Models a crash between an engine step and the catalog write that
/// should follow it.
pub struct FailingManifestStore {
    inner: Arc<dyn ManifestStore>,
    saves_left: Mutex<Option<u32>>,
}

impl FailingManifestStore {
    /// Wraps `inner` without limits.
    pub fn new(inner: Arc<dyn ManifestStore>) -> Self {
        Self {
            inner,
            saves_left: Mutex::new(None),
        }
    }

    /// Allows `count` more saves, then fails every save.
    pub fn fail_after(&self, count: u32) {
        *self.saves_left.lock() = Some(count);
    }

    /// Removes the limit.
    pub fn heal(&self) {
        *self.saves_left.lock() = None;
    }
}

impl ManifestStore for FailingManifestStore {
    fn load(&self) -> LifecycleResult<Option<Manifest>> {
        self.inner.load()
    }

    fn save(&self, manifest: &Manifest) -> LifecycleResult<()> {
        let mut left = self.saves_left.lock();
        match left.as_mut() {
            Some(0) => Err(LifecycleError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected manifest write failure",
            ))),
            Some(n) => {
                *n -= 1;
                self.inner.save(manifest)
            }
            None => self.inner.save(manifest),
        }
    }
}
