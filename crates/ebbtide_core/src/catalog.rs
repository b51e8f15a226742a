//! Ordered partition boundaries and per-partition metadata.
//!
//! The catalog is the sole owner of partition identity. It holds the strictly
//! increasing boundary sequence implicitly, as the lower bounds of every
//! partition but the first:
//!
//! ```text
//!   [-inf, b0) [b0, b1) [b1, b2) ... [bn, +inf)
//!    ord 0      ord 1    ord 2        ord n+1
//! ```
//!
//! Partition count is therefore always `boundary_count + 1`. Split and merge
//! are pure metadata operations and never block.

use crate::error::{BoundaryConflictKind, LifecycleError, LifecycleResult};
use ebbtide_storage::{CompressionMode, KeyRange, PartitionId, PartitionKey, TierId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// The newest partition, receiving current writes.
    Active,
    /// No longer the newest partition.
    Sealed,
    /// Switched out and acknowledged by the archive, awaiting merge.
    Archived,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Sealed => "sealed",
            Self::Archived => "archived",
        };
        f.write_str(name)
    }
}

/// A contiguous key range plus its storage metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Stable identity.
    pub id: PartitionId,
    /// Position in the boundary sequence, oldest first.
    pub ordinal: u32,
    /// Keys owned by the partition.
    pub range: KeyRange,
    /// Tier holding the partition's data.
    pub tier: TierId,
    /// Compression currently requested for the partition.
    pub compression: CompressionMode,
    /// Row estimate.
    pub row_count: u64,
    /// Lifecycle state.
    pub state: PartitionState,
}

impl Partition {
    /// Returns true if the partition holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Returns true if the partition may be fused into its upper neighbor.
    #[must_use]
    pub fn is_mergeable(&self) -> bool {
        self.is_empty() || self.state == PartitionState::Archived
    }
}

/// Read-only, restartable view of the catalog at one instant.
///
/// Later mutations of the catalog never show through a snapshot.
pub type CatalogSnapshot = Arc<Vec<Partition>>;

/// Persistable form of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Partitions in boundary order.
    pub partitions: Vec<Partition>,
    /// Identity the next split will assign.
    pub next_partition_id: PartitionId,
}

/// The ordered set of partitions of one table.
///
/// Cloning is cheap: partitions are shared copy-on-write with every snapshot
/// handed out by [`PartitionCatalog::partitions`].
#[derive(Debug, Clone)]
pub struct PartitionCatalog {
    partitions: Arc<Vec<Partition>>,
    next_partition_id: PartitionId,
}

impl PartitionCatalog {
    /// Creates a catalog holding the single partition `[-inf, +inf)`.
    #[must_use]
    pub fn new(initial_tier: TierId) -> Self {
        let first = Partition {
            id: PartitionId(1),
            ordinal: 0,
            range: KeyRange::UNBOUNDED,
            tier: initial_tier,
            compression: CompressionMode::None,
            row_count: 0,
            state: PartitionState::Active,
        };
        Self {
            partitions: Arc::new(vec![first]),
            next_partition_id: PartitionId(2),
        }
    }

    /// Rebuilds a catalog from its persisted form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the record violates a catalog invariant.
    pub fn from_record(record: CatalogRecord) -> LifecycleResult<Self> {
        let catalog = Self {
            partitions: Arc::new(record.partitions),
            next_partition_id: record.next_partition_id,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Returns the persistable form of the catalog.
    #[must_use]
    pub fn to_record(&self) -> CatalogRecord {
        CatalogRecord {
            partitions: self.partitions.as_ref().clone(),
            next_partition_id: self.next_partition_id,
        }
    }

    /// Returns a snapshot of every partition, oldest first.
    #[must_use]
    pub fn partitions(&self) -> CatalogSnapshot {
        Arc::clone(&self.partitions)
    }

    /// Returns the number of partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Always false: a catalog holds at least one partition.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Returns the number of boundaries.
    #[must_use]
    pub fn boundary_count(&self) -> usize {
        self.partitions.len() - 1
    }

    /// Returns the boundaries in increasing order.
    #[must_use]
    pub fn boundaries(&self) -> Vec<PartitionKey> {
        self.partitions.iter().filter_map(|p| p.range.lower).collect()
    }

    /// Returns the smallest boundary, if any.
    #[must_use]
    pub fn oldest_boundary(&self) -> Option<PartitionKey> {
        self.partitions.get(1).and_then(|p| p.range.lower)
    }

    /// Returns the largest boundary, if any.
    #[must_use]
    pub fn newest_boundary(&self) -> Option<PartitionKey> {
        self.partitions.last().and_then(|p| p.range.lower)
    }

    /// Returns the partition at ordinal 0.
    #[must_use]
    pub fn oldest(&self) -> &Partition {
        &self.partitions[0]
    }

    /// Returns the partition above the newest boundary.
    #[must_use]
    pub fn newest(&self) -> &Partition {
        &self.partitions[self.partitions.len() - 1]
    }

    /// Looks up a partition by identity.
    #[must_use]
    pub fn get(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.id == id)
    }

    /// Returns the ordinal of a partition.
    #[must_use]
    pub fn position_of(&self, id: PartitionId) -> Option<usize> {
        self.partitions.iter().position(|p| p.id == id)
    }

    /// Returns the partition whose range contains `key`.
    #[must_use]
    pub fn partition_for(&self, key: PartitionKey) -> &Partition {
        let idx = self.index_containing(key);
        &self.partitions[idx]
    }

    /// Returns the identity the next split will assign.
    #[must_use]
    pub fn next_partition_id(&self) -> PartitionId {
        self.next_partition_id
    }

    /// Makes sure no later split hands out `id` or anything below it.
    ///
    /// Returns true if the next identity moved.
    pub fn reserve_past(&mut self, id: PartitionId) -> bool {
        if self.next_partition_id > id {
            return false;
        }
        self.next_partition_id = id.next();
        true
    }

    /// Inserts a boundary, dividing the partition that spans it.
    ///
    /// The spanned partition keeps its identity and metadata for the lower
    /// half. The new upper partition inherits the tier, starts uncompressed
    /// and empty. Returns the new partition's identity.
    ///
    /// # Errors
    ///
    /// Returns `BoundaryConflict { kind: AlreadyExists }` if `at` is already a
    /// boundary.
    pub fn split(&mut self, at: PartitionKey) -> LifecycleResult<PartitionId> {
        let idx = self.index_containing(at);
        if self.partitions[idx].range.lower == Some(at) {
            return Err(LifecycleError::boundary_conflict(
                at,
                BoundaryConflictKind::AlreadyExists,
            ));
        }

        let id = self.next_partition_id;
        self.next_partition_id = id.next();

        let partitions = Arc::make_mut(&mut self.partitions);
        let spanned = &mut partitions[idx];
        let upper = Partition {
            id,
            ordinal: 0,
            range: KeyRange::new(Some(at), spanned.range.upper),
            tier: spanned.tier,
            compression: CompressionMode::None,
            row_count: 0,
            state: PartitionState::Sealed,
        };
        spanned.range.upper = Some(at);
        partitions.insert(idx + 1, upper);
        self.renumber();

        tracing::debug!(boundary = %at, partition = %id, "split partition");
        Ok(id)
    }

    /// Removes a boundary, fusing its two neighbors.
    ///
    /// If the lower partition is empty or archived it is absorbed by the
    /// upper one, which keeps its identity and metadata. Otherwise, if the
    /// upper partition is empty and not archived, the lower partition absorbs
    /// it. Returns the identity that disappeared.
    ///
    /// # Errors
    ///
    /// - `BoundaryConflict { kind: NotFound }` if `boundary` does not exist
    /// - `BoundaryConflict { kind: LowerNotEmpty }` if both sides hold data
    pub fn merge(&mut self, boundary: PartitionKey) -> LifecycleResult<PartitionId> {
        let Some(upper_idx) = self
            .partitions
            .iter()
            .position(|p| p.range.lower == Some(boundary))
        else {
            return Err(LifecycleError::boundary_conflict(
                boundary,
                BoundaryConflictKind::NotFound,
            ));
        };
        let lower_idx = upper_idx - 1;

        let lower = &self.partitions[lower_idx];
        let upper = &self.partitions[upper_idx];
        let absorb_lower = lower.is_mergeable();
        let absorb_upper =
            !absorb_lower && upper.is_empty() && upper.state != PartitionState::Archived;
        if !absorb_lower && !absorb_upper {
            return Err(LifecycleError::boundary_conflict(
                boundary,
                BoundaryConflictKind::LowerNotEmpty,
            ));
        }

        let partitions = Arc::make_mut(&mut self.partitions);
        let removed = if absorb_lower {
            let lower = partitions.remove(lower_idx);
            partitions[lower_idx].range.lower = lower.range.lower;
            lower.id
        } else {
            let upper = partitions.remove(upper_idx);
            partitions[lower_idx].range.upper = upper.range.upper;
            upper.id
        };
        self.renumber();

        tracing::debug!(boundary = %boundary, removed = %removed, "merged partitions");
        Ok(removed)
    }

    /// Sets a partition's row estimate.
    pub fn set_row_count(&mut self, id: PartitionId, rows: u64) -> LifecycleResult<()> {
        self.update(id, |p| p.row_count = rows)
    }

    /// Records the tier holding a partition.
    pub fn set_tier(&mut self, id: PartitionId, tier: TierId) -> LifecycleResult<()> {
        self.update(id, |p| p.tier = tier)
    }

    /// Records the compression requested for a partition.
    pub fn set_compression(
        &mut self,
        id: PartitionId,
        compression: CompressionMode,
    ) -> LifecycleResult<()> {
        self.update(id, |p| p.compression = compression)
    }

    /// Marks a partition as archived. Archived partitions hold no rows.
    pub fn mark_archived(&mut self, id: PartitionId) -> LifecycleResult<()> {
        self.update(id, |p| {
            p.state = PartitionState::Archived;
            p.row_count = 0;
        })?;
        self.renumber();
        Ok(())
    }

    /// Checks every catalog invariant.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` describing the first violation found.
    pub fn validate(&self) -> LifecycleResult<()> {
        let partitions = self.partitions.as_slice();
        let (Some(first), Some(last)) = (partitions.first(), partitions.last()) else {
            return Err(LifecycleError::invalid_format("catalog has no partitions"));
        };
        if first.range.lower.is_some() {
            return Err(LifecycleError::invalid_format(
                "oldest partition must start at -inf",
            ));
        }
        if last.range.upper.is_some() {
            return Err(LifecycleError::invalid_format(
                "newest partition must end at +inf",
            ));
        }

        let mut ids = HashSet::with_capacity(partitions.len());
        for (ordinal, partition) in partitions.iter().enumerate() {
            if partition.ordinal as usize != ordinal {
                return Err(LifecycleError::invalid_format(format!(
                    "{} has ordinal {} at position {ordinal}",
                    partition.id, partition.ordinal
                )));
            }
            if partition.id >= self.next_partition_id {
                return Err(LifecycleError::invalid_format(format!(
                    "{} is not below next partition id {}",
                    partition.id, self.next_partition_id
                )));
            }
            if !ids.insert(partition.id) {
                return Err(LifecycleError::invalid_format(format!(
                    "duplicate partition id {}",
                    partition.id
                )));
            }
        }

        for pair in partitions.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            let Some(boundary) = upper.range.lower else {
                return Err(LifecycleError::invalid_format(format!(
                    "{} is missing its lower boundary",
                    upper.id
                )));
            };
            if lower.range.upper != Some(boundary) {
                return Err(LifecycleError::invalid_format(format!(
                    "gap between {} and {}",
                    lower.id, upper.id
                )));
            }
            if lower.range.lower.is_some_and(|l| l >= boundary) {
                return Err(LifecycleError::invalid_format(format!(
                    "boundaries not strictly increasing at {boundary}"
                )));
            }
        }
        Ok(())
    }

    fn index_containing(&self, key: PartitionKey) -> usize {
        // Count of boundaries <= key.
        self.partitions[1..].partition_point(|p| p.range.lower.is_some_and(|b| b <= key))
    }

    fn update(
        &mut self,
        id: PartitionId,
        apply: impl FnOnce(&mut Partition),
    ) -> LifecycleResult<()> {
        let idx = self
            .position_of(id)
            .ok_or(LifecycleError::PartitionNotFound { partition: id })?;
        apply(&mut Arc::make_mut(&mut self.partitions)[idx]);
        Ok(())
    }

    /// Re-derives ordinals and Active/Sealed states. Archived is sticky.
    fn renumber(&mut self) {
        let partitions = Arc::make_mut(&mut self.partitions);
        let active = partitions
            .iter()
            .rposition(|p| p.state != PartitionState::Archived);
        for (ordinal, partition) in partitions.iter_mut().enumerate() {
            partition.ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
            if partition.state != PartitionState::Archived {
                partition.state = if Some(ordinal) == active {
                    PartitionState::Active
                } else {
                    PartitionState::Sealed
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOT: TierId = TierId(1);

    fn key(y: i32, m: u32, d: u32) -> PartitionKey {
        PartitionKey::from_ymd(y, m, d).unwrap()
    }

    fn catalog_with(boundaries: &[PartitionKey]) -> PartitionCatalog {
        let mut catalog = PartitionCatalog::new(HOT);
        for &b in boundaries {
            catalog.split(b).unwrap();
        }
        catalog
    }

    #[test]
    fn new_catalog_has_single_unbounded_partition() {
        let catalog = PartitionCatalog::new(HOT);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.boundary_count(), 0);
        assert_eq!(catalog.oldest().range, KeyRange::UNBOUNDED);
        assert_eq!(catalog.oldest().state, PartitionState::Active);
        assert!(catalog.newest_boundary().is_none());
    }

    #[test]
    fn split_at_tail_creates_empty_upper_partition() {
        let mut catalog = PartitionCatalog::new(HOT);
        catalog.set_row_count(PartitionId(1), 40).unwrap();
        catalog.set_compression(PartitionId(1), CompressionMode::Row).unwrap();

        let feb = key(2023, 2, 1);
        let id = catalog.split(feb).unwrap();

        assert_eq!(catalog.boundaries(), vec![feb]);
        assert_eq!(catalog.len(), 2);
        let newest = catalog.newest();
        assert_eq!(newest.id, id);
        assert_eq!(newest.row_count, 0);
        assert_eq!(newest.compression, CompressionMode::None);
        assert_eq!(newest.tier, HOT);
        assert_eq!(newest.state, PartitionState::Active);

        let oldest = catalog.oldest();
        assert_eq!(oldest.row_count, 40);
        assert_eq!(oldest.range, KeyRange::new(None, Some(feb)));
        assert_eq!(oldest.state, PartitionState::Sealed);
    }

    #[test]
    fn interior_split_supported() {
        let jan = key(2022, 1, 1);
        let mar = key(2022, 3, 1);
        let mut catalog = catalog_with(&[jan, mar]);

        let feb = key(2022, 2, 1);
        catalog.split(feb).unwrap();

        assert_eq!(catalog.boundaries(), vec![jan, feb, mar]);
        assert_eq!(catalog.partition_for(key(2022, 2, 15)).range, KeyRange::new(Some(feb), Some(mar)));
        catalog.validate().unwrap();
    }

    #[test]
    fn split_existing_boundary_conflicts() {
        let jan = key(2022, 1, 1);
        let mut catalog = catalog_with(&[jan]);
        let err = catalog.split(jan).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::BoundaryConflict { kind: BoundaryConflictKind::AlreadyExists, .. }
        ));
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn merge_unknown_boundary_conflicts() {
        let mut catalog = catalog_with(&[key(2022, 1, 1)]);
        let err = catalog.merge(key(2022, 6, 1)).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::BoundaryConflict { kind: BoundaryConflictKind::NotFound, .. }
        ));
    }

    #[test]
    fn merge_refuses_when_both_sides_hold_rows() {
        let jan = key(2022, 1, 1);
        let mut catalog = catalog_with(&[jan]);
        let ids: Vec<_> = catalog.partitions().iter().map(|p| p.id).collect();
        catalog.set_row_count(ids[0], 5).unwrap();
        catalog.set_row_count(ids[1], 5).unwrap();

        let err = catalog.merge(jan).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::BoundaryConflict { kind: BoundaryConflictKind::LowerNotEmpty, .. }
        ));
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn merge_of_archived_lower_keeps_upper_identity() {
        let (jan, feb, mar) = (key(2022, 1, 1), key(2022, 2, 1), key(2022, 3, 1));
        let mut catalog = catalog_with(&[jan, feb, mar]);
        let before: Vec<_> = catalog.partitions().iter().map(|p| p.id).collect();
        catalog.set_row_count(before[0], 10).unwrap();
        catalog.set_row_count(before[1], 20).unwrap();
        catalog.mark_archived(before[0]).unwrap();

        let removed = catalog.merge(jan).unwrap();

        assert_eq!(removed, before[0]);
        assert_eq!(catalog.boundaries(), vec![feb, mar]);
        assert_eq!(catalog.oldest().id, before[1]);
        assert_eq!(catalog.oldest().row_count, 20);
        assert_eq!(catalog.oldest().range, KeyRange::new(None, Some(feb)));
        assert_eq!(catalog.oldest().ordinal, 0);
    }

    #[test]
    fn split_then_merge_round_trips() {
        let jan = key(2022, 1, 1);
        let mut catalog = catalog_with(&[jan]);
        let newest = catalog.newest().id;
        catalog.set_row_count(newest, 99).unwrap();
        let before = catalog.partitions();

        let feb = key(2022, 2, 1);
        catalog.split(feb).unwrap();
        catalog.merge(feb).unwrap();

        assert_eq!(catalog.partitions().as_slice(), before.as_slice());
    }

    #[test]
    fn snapshots_are_isolated_from_later_mutation() {
        let mut catalog = catalog_with(&[key(2022, 1, 1)]);
        let snapshot = catalog.partitions();
        catalog.split(key(2022, 2, 1)).unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn ids_are_never_reused() {
        let jan = key(2022, 1, 1);
        let mut catalog = PartitionCatalog::new(HOT);
        let first = catalog.split(jan).unwrap();
        catalog.merge(jan).unwrap();
        let second = catalog.split(jan).unwrap();
        assert!(second > first);
    }

    #[test]
    fn archived_state_is_sticky_and_active_is_newest_live() {
        let (jan, feb) = (key(2022, 1, 1), key(2022, 2, 1));
        let mut catalog = catalog_with(&[jan, feb]);
        let oldest = catalog.oldest().id;
        catalog.mark_archived(oldest).unwrap();
        catalog.split(key(2022, 3, 1)).unwrap();

        let states: Vec<_> = catalog.partitions().iter().map(|p| p.state).collect();
        assert_eq!(
            states,
            vec![
                PartitionState::Archived,
                PartitionState::Sealed,
                PartitionState::Sealed,
                PartitionState::Active
            ]
        );
    }

    #[test]
    fn record_round_trip_and_validation() {
        let catalog = catalog_with(&[key(2022, 1, 1), key(2022, 2, 1)]);
        let record = catalog.to_record();
        let restored = PartitionCatalog::from_record(record.clone()).unwrap();
        assert_eq!(restored.to_record(), record);

        let mut broken = record.clone();
        broken.partitions.swap(1, 2);
        assert!(PartitionCatalog::from_record(broken).is_err());

        let mut duplicate = record;
        duplicate.partitions[1].id = duplicate.partitions[0].id;
        assert!(PartitionCatalog::from_record(duplicate).is_err());
    }

    #[test]
    fn setters_reject_unknown_partition() {
        let mut catalog = PartitionCatalog::new(HOT);
        let err = catalog.set_tier(PartitionId(42), TierId(2)).unwrap_err();
        assert!(matches!(err, LifecycleError::PartitionNotFound { .. }));
    }

    #[test]
    fn reserved_ids_are_skipped_by_split() {
        let mut catalog = PartitionCatalog::new(HOT);
        assert_eq!(catalog.next_partition_id(), PartitionId(2));

        assert!(catalog.reserve_past(PartitionId(5)));
        assert!(!catalog.reserve_past(PartitionId(3)));
        assert_eq!(catalog.split(key(2023, 1, 1)).unwrap(), PartitionId(6));
        assert_eq!(catalog.next_partition_id(), PartitionId(7));
    }
}
