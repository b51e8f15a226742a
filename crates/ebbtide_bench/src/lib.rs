//! Benchmark utilities.

use ebbtide_core::DAY;
use ebbtide_storage::{PartitionKey, Row};

/// 2024-01-01T00:00:00Z.
pub const EPOCH: PartitionKey = PartitionKey::new(1_704_067_200);

/// Generate a deterministic payload of the specified size.
pub fn payload(size: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..size)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// Generate `count` daily boundaries starting at [`EPOCH`].
pub fn daily_boundaries(count: u32) -> Vec<PartitionKey> {
    (0..count)
        .filter_map(|offset| EPOCH.checked_add_periods(DAY, offset))
        .collect()
}

/// Generate rows for the partition starting at `boundary`, one per second.
pub fn rows_for(boundary: PartitionKey, count: usize, payload_size: usize) -> Vec<Row> {
    (0..count)
        .map(|i| {
            let key = PartitionKey::new(boundary.as_i64() + i as i64);
            Row::new(key, payload(payload_size, key.as_i64() as u64))
        })
        .collect()
}
