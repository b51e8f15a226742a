//! Position-based compression policy.

use ebbtide_storage::CompressionMode;
use serde::{Deserialize, Serialize};

/// Default number of partitions behind the newest that use row compression.
pub const DEFAULT_ROW_PARTITIONS: u32 = 2;

/// Maps a partition's distance from the newest partition to a compression
/// mode.
///
/// The newest partition stays uncompressed, the next `row_partitions` use
/// row compression, and everything older uses page compression. The rule
/// depends only on relative position, never on the clock.
///
/// ```rust
/// use ebbtide_core::CompressionPolicy;
/// use ebbtide_storage::CompressionMode;
///
/// let policy = CompressionPolicy::new(1);
/// assert_eq!(policy.policy_for(0, 4), CompressionMode::None);
/// assert_eq!(policy.policy_for(1, 4), CompressionMode::Row);
/// assert_eq!(policy.policy_for(2, 4), CompressionMode::Page);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionPolicy {
    /// Partitions after the newest that use row compression.
    pub row_partitions: u32,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            row_partitions: DEFAULT_ROW_PARTITIONS,
        }
    }
}

impl CompressionPolicy {
    /// Creates a policy with `row_partitions` row-compressed partitions.
    #[must_use]
    pub const fn new(row_partitions: u32) -> Self {
        Self { row_partitions }
    }

    /// Returns the target mode for a partition.
    ///
    /// Total over all inputs. `total_partitions` is accepted so callers can
    /// pass the whole context, but positions beyond it still map by position.
    #[must_use]
    pub fn policy_for(&self, position_from_newest: u32, _total_partitions: u32) -> CompressionMode {
        if position_from_newest == 0 {
            CompressionMode::None
        } else if position_from_newest <= self.row_partitions {
            CompressionMode::Row
        } else {
            CompressionMode::Page
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_tiers_by_position() {
        let policy = CompressionPolicy::default();
        let modes: Vec<_> = (0..5).map(|pos| policy.policy_for(pos, 5)).collect();
        assert_eq!(
            modes,
            vec![
                CompressionMode::None,
                CompressionMode::Row,
                CompressionMode::Row,
                CompressionMode::Page,
                CompressionMode::Page
            ]
        );
    }

    #[test]
    fn zero_row_partitions_goes_straight_to_page() {
        let policy = CompressionPolicy::new(0);
        assert_eq!(policy.policy_for(0, 2), CompressionMode::None);
        assert_eq!(policy.policy_for(1, 2), CompressionMode::Page);
    }

    #[test]
    fn total_for_extreme_inputs() {
        let policy = CompressionPolicy::new(u32::MAX);
        assert_eq!(policy.policy_for(u32::MAX, 0), CompressionMode::Row);
        assert_eq!(CompressionPolicy::default().policy_for(u32::MAX, u32::MAX), CompressionMode::Page);
    }

    proptest::proptest! {
        #[test]
        fn output_depends_only_on_inputs(pos in proptest::num::u32::ANY, total in proptest::num::u32::ANY, k in 0u32..64) {
            let policy = CompressionPolicy::new(k);
            proptest::prop_assert_eq!(policy.policy_for(pos, total), policy.policy_for(pos, total));
            proptest::prop_assert_eq!(
                policy.policy_for(pos, total),
                CompressionPolicy::new(k).policy_for(pos, total.wrapping_add(1))
            );
        }
    }
}
