//! Declarative descriptions of lifecycle steps.

use ebbtide_storage::{KeyRange, PartitionId, PartitionKey, StagingHandle, TierId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which lifecycle operation a plan describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationKind {
    /// Split at a new boundary and switch staged data in.
    SwitchIn,
    /// Switch the oldest partition out, archive it, and merge its boundary.
    SwitchOut,
}

/// One step of a migration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationStep {
    /// Allocate an empty staging area in the target tier.
    AllocateStaging,
    /// Load supplied rows into the staging area.
    LoadStaging,
    /// Compare staging and table structure.
    ValidateStructure,
    /// Insert the new boundary into the catalog.
    Split,
    /// Exchange the staging area into the new partition slot.
    SwitchIn,
    /// Record the partition's tier.
    AssignTier,
    /// Record the partition's compression target.
    AssignCompression,
    /// Exchange the oldest partition's data out into a staging area.
    SwitchOut,
    /// Hand the staged rows to the archive and wait for acknowledgment.
    ArchiveHandoff,
    /// Remove the boundary above the archived partition.
    Merge,
    /// Drop the now archived staging area.
    DiscardStaging,
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AllocateStaging => "allocate-staging",
            Self::LoadStaging => "load-staging",
            Self::ValidateStructure => "validate-structure",
            Self::Split => "split",
            Self::SwitchIn => "switch-in",
            Self::AssignTier => "assign-tier",
            Self::AssignCompression => "assign-compression",
            Self::SwitchOut => "switch-out",
            Self::ArchiveHandoff => "archive-handoff",
            Self::Merge => "merge",
            Self::DiscardStaging => "discard-staging",
        };
        f.write_str(name)
    }
}

/// An ephemeral description of one atomic lifecycle operation.
///
/// Plans are produced from a catalog snapshot and are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    /// Operation kind.
    pub kind: MigrationKind,
    /// Boundary being added or removed.
    pub boundary: PartitionKey,
    /// Partition created (add) or dropped (drop).
    pub partition: PartitionId,
    /// Key range of that partition.
    pub range: KeyRange,
    /// Tier the data lives in.
    pub tier: TierId,
    /// Rows expected to move.
    pub rows: u64,
    /// True if supplied rows must be loaded into a fresh staging area.
    pub load_rows: bool,
    /// Staging area already holding the data, if any.
    pub staging: Option<StagingHandle>,
}

impl MigrationPlan {
    /// Lists the steps the plan executes, in order.
    #[must_use]
    pub fn steps(&self) -> Vec<MigrationStep> {
        use MigrationStep::*;
        match self.kind {
            MigrationKind::SwitchIn => {
                let mut steps = Vec::with_capacity(7);
                if self.staging.is_none() {
                    steps.push(AllocateStaging);
                    if self.load_rows {
                        steps.push(LoadStaging);
                    }
                }
                steps.extend([ValidateStructure, Split, SwitchIn, AssignTier, AssignCompression]);
                steps
            }
            MigrationKind::SwitchOut => {
                let mut steps = Vec::with_capacity(4);
                if self.staging.is_none() {
                    steps.push(SwitchOut);
                }
                if self.rows > 0 {
                    steps.push(ArchiveHandoff);
                }
                steps.extend([Merge, DiscardStaging]);
                steps
            }
        }
    }
}

impl fmt::Display for MigrationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            MigrationKind::SwitchIn => "add",
            MigrationKind::SwitchOut => "drop",
        };
        write!(
            f,
            "{verb} {} {} at {} in {} ({} rows):",
            self.partition, self.range, self.boundary, self.tier, self.rows
        )?;
        for step in self.steps() {
            write!(f, " {step}")?;
        }
        Ok(())
    }
}

/// A drop that switched its partition out but has not merged yet.
///
/// Persisted so a retry after a failed archive handoff resumes from the
/// recorded staging area instead of switching out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDrop {
    /// The switched-out partition.
    pub partition: PartitionId,
    /// The boundary to merge once archived.
    pub boundary: PartitionKey,
    /// The partition's key range.
    pub range: KeyRange,
    /// Staging area holding the partition's rows.
    pub staging: StagingHandle,
    /// Rows in the staging area.
    pub rows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(kind: MigrationKind, rows: u64, staging: Option<StagingHandle>) -> MigrationPlan {
        MigrationPlan {
            kind,
            boundary: PartitionKey::new(100),
            partition: PartitionId(4),
            range: KeyRange::new(Some(PartitionKey::new(100)), None),
            tier: TierId(1),
            rows,
            load_rows: rows > 0,
            staging,
        }
    }

    #[test]
    fn add_plan_steps() {
        use MigrationStep::*;
        assert_eq!(
            plan(MigrationKind::SwitchIn, 10, None).steps(),
            vec![AllocateStaging, LoadStaging, ValidateStructure, Split, SwitchIn, AssignTier, AssignCompression]
        );
        assert_eq!(
            plan(MigrationKind::SwitchIn, 0, Some(StagingHandle::new(TierId(1)))).steps(),
            vec![ValidateStructure, Split, SwitchIn, AssignTier, AssignCompression]
        );
    }

    #[test]
    fn drop_plan_skips_handoff_for_empty_partition() {
        use MigrationStep::*;
        assert_eq!(
            plan(MigrationKind::SwitchOut, 0, None).steps(),
            vec![SwitchOut, Merge, DiscardStaging]
        );
        assert_eq!(
            plan(MigrationKind::SwitchOut, 3, Some(StagingHandle::new(TierId(1)))).steps(),
            vec![ArchiveHandoff, Merge, DiscardStaging]
        );
    }

    #[test]
    fn display_lists_steps() {
        let text = plan(MigrationKind::SwitchOut, 3, None).to_string();
        assert!(text.starts_with("drop p:4"));
        assert!(text.ends_with("switch-out archive-handoff merge discard-staging"));
    }
}
