//! Sliding window: adding and dropping partitions as atomic units.
//!
//! This module provides:
//! - Atomic split plus switch-in for new partitions
//! - Archive-first switch-out plus merge for the oldest partition
//! - Resumable drops after a failed archive handoff
//! - Cooperative cancellation

mod cancel;
mod manager;
mod plan;

pub use cancel::CancellationToken;
pub use manager::{
    AddedPartition, CompressionChange, DroppedPartition, SlidingWindowManager, TierChange,
};
pub use plan::{MigrationKind, MigrationPlan, MigrationStep, PendingDrop};
