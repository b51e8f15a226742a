//! Storage engine trait definition.

use crate::error::StorageResult;
use crate::schema::TableStructure;
use crate::types::{CompressionMode, KeyRange, PartitionId, PartitionKey, Row, TierId};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Handle to a staging area: a detached block of rows living in one tier.
///
/// Switching exchanges the identity of a staging area with a partition slot
/// without copying rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagingHandle {
    /// Unique staging identity.
    pub id: Uuid,
    /// Tier the staging area lives in.
    pub tier: TierId,
}

impl StagingHandle {
    /// Creates a handle with a fresh identity.
    #[must_use]
    pub fn new(tier: TierId) -> Self {
        Self {
            id: Uuid::new_v4(),
            tier,
        }
    }
}

impl fmt::Display for StagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "staging:{}@{}", self.id, self.tier)
    }
}

/// Describes the contents of a staging area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingInfo {
    /// Number of rows staged.
    pub rows: u64,
    /// Approximate staged bytes.
    pub bytes: u64,
    /// Smallest staged key, if any.
    pub min_key: Option<PartitionKey>,
    /// Largest staged key, if any.
    pub max_key: Option<PartitionKey>,
    /// Layout the staging area was created with.
    pub structure: TableStructure,
}

/// The physical storage collaborator.
///
/// The lifecycle core never moves bytes itself; it drives an engine through
/// this trait. Every call may block.
///
/// # Invariants
///
/// - `switch_in` and `switch_out` are metadata exchanges: no rows are copied
/// - `switch_in` fails without side effects if any staged key lies outside the
///   destination range, leaving the staging area intact
/// - a partition that was never switched into holds zero rows
///
/// # Implementors
///
/// - [`InMemoryEngine`](crate::InMemoryEngine) - For testing, with fault injection
/// - [`DirEngine`](crate::DirEngine) - Directory-per-tier storage where a switch is a rename
pub trait StorageEngine: Send + Sync {
    /// Allocates an empty staging area in `tier` sized for `estimated_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailed` if the tier cannot hold it, or `Unavailable`.
    fn allocate_staging(
        &self,
        tier: TierId,
        estimated_size: u64,
        structure: &TableStructure,
    ) -> StorageResult<StagingHandle>;

    /// Appends rows to a staging area. Returns the staged row count afterwards.
    fn load_staging(&self, staging: &StagingHandle, rows: &[Row]) -> StorageResult<u64>;

    /// Describes a staging area.
    fn staging_info(&self, staging: &StagingHandle) -> StorageResult<StagingInfo>;

    /// Reads every row of a staging area.
    fn read_staging(&self, staging: &StagingHandle) -> StorageResult<Vec<Row>>;

    /// Drops a staging area and its rows.
    fn discard_staging(&self, staging: &StagingHandle) -> StorageResult<()>;

    /// Exchanges a staging area into an empty partition slot.
    ///
    /// Returns the number of rows now owned by `target`. The staging handle
    /// is consumed on success.
    ///
    /// # Errors
    ///
    /// - `DomainViolation` if a staged key lies outside `range`
    /// - `TargetNotEmpty` if `target` already holds rows
    fn switch_in(
        &self,
        staging: &StagingHandle,
        target: PartitionId,
        range: &KeyRange,
    ) -> StorageResult<u64>;

    /// Detaches a partition's rows into a new staging area in `tier`.
    ///
    /// The partition is left empty. The staging area is stamped with
    /// `structure`, the layout the rows were switched in under.
    fn switch_out(
        &self,
        source: PartitionId,
        tier: TierId,
        structure: &TableStructure,
    ) -> StorageResult<StagingHandle>;

    /// Moves a partition's extents to another tier.
    fn relocate(&self, partition: PartitionId, tier: TierId) -> StorageResult<()>;

    /// Requests re-encoding of a partition. Best-effort.
    fn apply_compression(&self, partition: PartitionId, mode: CompressionMode)
        -> StorageResult<()>;

    /// Returns the number of rows a partition holds.
    fn partition_rows(&self, partition: PartitionId) -> StorageResult<u64>;

    /// Lists every partition the engine holds storage for, in id order.
    fn partition_ids(&self) -> StorageResult<Vec<PartitionId>>;

    /// Lists every live staging area.
    fn staging_areas(&self) -> StorageResult<Vec<StagingHandle>>;
}

/// Checks staged keys against a destination range.
///
/// Shared by the engine implementations so domain validation behaves the
/// same everywhere.
pub(crate) fn check_domain<'a>(
    keys: impl IntoIterator<Item = &'a PartitionKey>,
    range: &KeyRange,
) -> StorageResult<()> {
    for key in keys {
        if !range.contains(*key) {
            return Err(crate::error::StorageError::DomainViolation { key: *key, range: *range });
        }
    }
    Ok(())
}
