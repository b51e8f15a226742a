//! Property-based test generators using proptest.
//!
//! Strategies for boundaries, rows and lifecycle operation sequences.

use ebbtide_core::{CompressionPolicy, RetentionPolicy};
use ebbtide_storage::{PartitionKey, Row};
use proptest::prelude::*;
use std::time::Duration;

/// Earliest key generated: 2000-01-01T00:00:00Z.
pub const KEY_MIN: i64 = 946_684_800;

/// Latest key generated: 2100-01-01T00:00:00Z.
pub const KEY_MAX: i64 = 4_102_444_800;

/// Strategy for partition keys within a sane calendar span.
pub fn partition_key_strategy() -> impl Strategy<Value = PartitionKey> {
    (KEY_MIN..KEY_MAX).prop_map(PartitionKey::new)
}

/// Strategy for strictly ascending boundary sequences.
pub fn boundary_sequence_strategy(
    max_len: usize,
) -> impl Strategy<Value = Vec<PartitionKey>> {
    (
        KEY_MIN..KEY_MIN + 86_400 * 365,
        prop::collection::vec(1i64..86_400 * 30, 0..max_len),
    )
        .prop_map(|(start, gaps)| {
            let mut key = start;
            gaps.into_iter()
                .map(|gap| {
                    key += gap;
                    PartitionKey::new(key)
                })
                .collect()
        })
}

/// Strategy for rows with keys in `[lower, lower + span)`.
pub fn rows_strategy(
    lower: PartitionKey,
    span: i64,
    max_rows: usize,
) -> impl Strategy<Value = Vec<Row>> {
    let base = lower.as_i64();
    prop::collection::vec(
        (0..span.max(1), prop::collection::vec(any::<u8>(), 0..32)),
        0..max_rows,
    )
    .prop_map(move |pairs| {
        pairs
            .into_iter()
            .map(|(offset, payload)| Row::new(PartitionKey::new(base + offset), payload))
            .collect()
    })
}

/// Strategy for valid retention policies with periods of an hour or a day.
pub fn retention_policy_strategy() -> impl Strategy<Value = RetentionPolicy> {
    (
        1u32..30,
        0u32..5,
        prop_oneof![Just(3_600u64), Just(86_400u64)],
    )
        .prop_map(|(retain, lookahead, secs)| {
            RetentionPolicy::new(retain, lookahead, Duration::from_secs(secs))
        })
}

/// Strategy for compression policies.
pub fn compression_policy_strategy() -> impl Strategy<Value = CompressionPolicy> {
    (0u32..6).prop_map(CompressionPolicy::new)
}

/// A lifecycle operation against a daily table.
#[derive(Debug, Clone)]
pub enum WindowOp {
    /// Add a partition this many days after the newest boundary.
    Add {
        /// Days past the newest boundary.
        gap_days: u32,
        /// Rows to load, spread over the first hours of the partition.
        rows: usize,
    },
    /// Drop the oldest partition.
    Drop,
    /// Reconcile compression and tiers.
    Reconcile,
}

/// Strategy for a single window operation.
pub fn window_op_strategy() -> impl Strategy<Value = WindowOp> {
    prop_oneof![
        4 => (1u32..4, 0usize..20).prop_map(|(gap_days, rows)| WindowOp::Add { gap_days, rows }),
        2 => Just(WindowOp::Drop),
        1 => Just(WindowOp::Reconcile),
    ]
}

/// Strategy for a sequence of window operations.
pub fn window_ops_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<WindowOp>> {
    prop::collection::vec(window_op_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn boundaries_strictly_ascend(boundaries in boundary_sequence_strategy(20)) {
            for pair in boundaries.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }

        #[test]
        fn rows_stay_in_span(rows in rows_strategy(PartitionKey::new(KEY_MIN), 3_600, 50)) {
            for row in &rows {
                prop_assert!(row.key.as_i64() >= KEY_MIN);
                prop_assert!(row.key.as_i64() < KEY_MIN + 3_600);
            }
        }

        #[test]
        fn generated_policies_validate(policy in retention_policy_strategy()) {
            prop_assert!(policy.validate().is_ok());
        }
    }
}
