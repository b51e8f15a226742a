//! Partition to storage tier assignment.
//!
//! The tier map is metadata only. Moving extents is the storage engine's
//! job, invoked by the window manager with the tier recorded here as the
//! target.

use crate::catalog::{Partition, PartitionState};
use crate::error::{LifecycleError, LifecycleResult};
use ebbtide_storage::{PartitionId, TierId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A storage class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    /// Tier identity.
    pub id: TierId,
    /// Human-readable name.
    pub name: String,
    /// Maximum number of partitions the tier may hold. `None` is unlimited.
    pub capacity: Option<u32>,
}

impl TierSpec {
    /// Creates an unlimited tier.
    #[must_use]
    pub fn new(id: TierId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            capacity: None,
        }
    }

    /// Limits the tier to `partitions` partitions.
    #[must_use]
    pub fn with_capacity(mut self, partitions: u32) -> Self {
        self.capacity = Some(partitions);
        self
    }
}

/// Tiers available to a table and the aging rule between them.
///
/// The newest `hot_partitions` partitions live in `ingest_tier`. Older
/// partitions move to `cold_tier` when one is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Every tier the table may use.
    pub tiers: Vec<TierSpec>,
    /// Tier receiving new partitions.
    pub ingest_tier: TierId,
    /// Tier for partitions that aged out of the hot set.
    pub cold_tier: Option<TierId>,
    /// How many of the newest partitions stay in the ingest tier.
    pub hot_partitions: u32,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            tiers: vec![TierSpec::new(TierId(1), "hot"), TierSpec::new(TierId(2), "cold")],
            ingest_tier: TierId(1),
            cold_tier: Some(TierId(2)),
            hot_partitions: 3,
        }
    }
}

impl TierConfig {
    /// Creates a configuration with a single unlimited tier.
    #[must_use]
    pub fn single(tier: TierId) -> Self {
        Self {
            tiers: vec![TierSpec::new(tier, "default")],
            ingest_tier: tier,
            cold_tier: None,
            hot_partitions: 1,
        }
    }

    /// Returns the spec of a tier.
    #[must_use]
    pub fn spec(&self, tier: TierId) -> Option<&TierSpec> {
        self.tiers.iter().find(|spec| spec.id == tier)
    }

    /// Returns every tier identity.
    #[must_use]
    pub fn tier_ids(&self) -> Vec<TierId> {
        self.tiers.iter().map(|spec| spec.id).collect()
    }

    /// Returns the tier a partition belongs in given its distance from the
    /// newest partition.
    #[must_use]
    pub fn tier_for(&self, position_from_newest: u32) -> TierId {
        match self.cold_tier {
            Some(cold) if position_from_newest >= self.hot_partitions => cold,
            _ => self.ingest_tier,
        }
    }

    /// Checks that the referenced tiers exist and identities are unique.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` on the first problem found.
    pub fn validate(&self) -> LifecycleResult<()> {
        let mut seen = HashSet::new();
        for spec in &self.tiers {
            if !seen.insert(spec.id) {
                return Err(LifecycleError::invalid_policy(format!(
                    "{} declared twice",
                    spec.id
                )));
            }
        }
        if self.spec(self.ingest_tier).is_none() {
            return Err(LifecycleError::invalid_policy(format!(
                "ingest {} is not declared",
                self.ingest_tier
            )));
        }
        if let Some(cold) = self.cold_tier {
            if self.spec(cold).is_none() {
                return Err(LifecycleError::invalid_policy(format!(
                    "cold {cold} is not declared"
                )));
            }
        }
        if self.hot_partitions == 0 {
            return Err(LifecycleError::invalid_policy(
                "hot_partitions must keep at least the newest partition in the ingest tier",
            ));
        }
        Ok(())
    }
}

/// Records which tier holds each partition and enforces tier capacity.
#[derive(Debug, Clone)]
pub struct StorageTierMap {
    capacities: HashMap<TierId, Option<u32>>,
    assignments: HashMap<PartitionId, TierId>,
    occupancy: HashMap<TierId, u32>,
}

impl StorageTierMap {
    /// Creates an empty map over the configured tiers.
    #[must_use]
    pub fn new(config: &TierConfig) -> Self {
        Self {
            capacities: config
                .tiers
                .iter()
                .map(|spec| (spec.id, spec.capacity))
                .collect(),
            assignments: HashMap::new(),
            occupancy: HashMap::new(),
        }
    }

    /// Rebuilds the map from catalog metadata, typically after a restart.
    ///
    /// Archived partitions hold no data and are left unassigned.
    pub fn rebuild(config: &TierConfig, partitions: &[Partition]) -> LifecycleResult<Self> {
        let mut map = Self::new(config);
        for partition in partitions {
            if partition.state != PartitionState::Archived {
                map.assign(partition.id, partition.tier)?;
            }
        }
        Ok(map)
    }

    /// Records that `partition` lives in `tier`.
    ///
    /// Reassigning to the same tier is a no-op. Moving between tiers
    /// releases the old slot.
    ///
    /// # Errors
    ///
    /// Returns `StorageAllocation` if the tier is unknown or full.
    pub fn assign(&mut self, partition: PartitionId, tier: TierId) -> LifecycleResult<()> {
        let Some(capacity) = self.capacities.get(&tier).copied() else {
            return Err(LifecycleError::StorageAllocation {
                tier: Some(tier),
                message: "tier is not configured".to_string(),
            });
        };
        if self.assignments.get(&partition) == Some(&tier) {
            return Ok(());
        }
        let used = self.occupancy(tier);
        if capacity.is_some_and(|limit| used >= limit) {
            return Err(LifecycleError::StorageAllocation {
                tier: Some(tier),
                message: format!("tier holds {used} partitions, at capacity"),
            });
        }

        self.release(partition);
        self.assignments.insert(partition, tier);
        *self.occupancy.entry(tier).or_insert(0) += 1;
        Ok(())
    }

    /// Returns the tier holding a partition.
    #[must_use]
    pub fn tier_of(&self, partition: PartitionId) -> Option<TierId> {
        self.assignments.get(&partition).copied()
    }

    /// Forgets a partition, freeing its slot. Returns the tier it occupied.
    pub fn release(&mut self, partition: PartitionId) -> Option<TierId> {
        let tier = self.assignments.remove(&partition)?;
        if let Some(count) = self.occupancy.get_mut(&tier) {
            *count = count.saturating_sub(1);
        }
        Some(tier)
    }

    /// Returns true if `tier` can accept one more partition.
    #[must_use]
    pub fn has_room(&self, tier: TierId) -> bool {
        match self.capacities.get(&tier) {
            Some(Some(limit)) => self.occupancy(tier) < *limit,
            Some(None) => true,
            None => false,
        }
    }

    /// Returns how many partitions a tier holds.
    #[must_use]
    pub fn occupancy(&self, tier: TierId) -> u32 {
        self.occupancy.get(&tier).copied().unwrap_or(0)
    }

    /// Returns the number of assigned partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Returns true if no partition is assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOT: TierId = TierId(1);
    const COLD: TierId = TierId(2);

    fn limited() -> TierConfig {
        TierConfig {
            tiers: vec![TierSpec::new(HOT, "hot").with_capacity(2), TierSpec::new(COLD, "cold")],
            ingest_tier: HOT,
            cold_tier: Some(COLD),
            hot_partitions: 2,
        }
    }

    #[test]
    fn assign_respects_capacity() {
        let mut map = StorageTierMap::new(&limited());
        map.assign(PartitionId(1), HOT).unwrap();
        map.assign(PartitionId(2), HOT).unwrap();
        assert!(!map.has_room(HOT));

        let err = map.assign(PartitionId(3), HOT).unwrap_err();
        assert!(matches!(err, LifecycleError::StorageAllocation { tier: Some(HOT), .. }));
        assert_eq!(map.tier_of(PartitionId(3)), None);
    }

    #[test]
    fn assign_is_idempotent_and_moves_release_slots() {
        let mut map = StorageTierMap::new(&limited());
        map.assign(PartitionId(1), HOT).unwrap();
        map.assign(PartitionId(1), HOT).unwrap();
        assert_eq!(map.occupancy(HOT), 1);

        map.assign(PartitionId(1), COLD).unwrap();
        assert_eq!(map.occupancy(HOT), 0);
        assert_eq!(map.occupancy(COLD), 1);
        assert_eq!(map.tier_of(PartitionId(1)), Some(COLD));
    }

    #[test]
    fn unknown_tier_rejected() {
        let mut map = StorageTierMap::new(&limited());
        assert!(!map.has_room(TierId(9)));
        assert!(map.assign(PartitionId(1), TierId(9)).is_err());
    }

    #[test]
    fn release_frees_slot() {
        let mut map = StorageTierMap::new(&limited());
        map.assign(PartitionId(1), HOT).unwrap();
        map.assign(PartitionId(2), HOT).unwrap();
        assert_eq!(map.release(PartitionId(1)), Some(HOT));
        assert!(map.has_room(HOT));
        assert_eq!(map.release(PartitionId(1)), None);
    }

    #[test]
    fn tier_for_ages_partitions_into_cold_tier() {
        let config = limited();
        assert_eq!(config.tier_for(0), HOT);
        assert_eq!(config.tier_for(1), HOT);
        assert_eq!(config.tier_for(2), COLD);
        assert_eq!(TierConfig::single(HOT).tier_for(50), HOT);
    }

    #[test]
    fn validate_catches_undeclared_tiers() {
        assert!(TierConfig::default().validate().is_ok());

        let mut config = limited();
        config.cold_tier = Some(TierId(7));
        assert!(config.validate().is_err());

        let mut config = limited();
        config.tiers.push(TierSpec::new(HOT, "again"));
        assert!(config.validate().is_err());
    }
}
