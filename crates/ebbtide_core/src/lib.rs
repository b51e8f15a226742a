//! # Ebbtide Core
//!
//! Lifecycle management for time-partitioned tables.
//!
//! This crate provides:
//! - The partition catalog: ordered boundaries and per-partition metadata
//! - Tier assignment and position-based compression targets
//! - The sliding window manager: atomic add and archive-first drop
//! - The retention scheduler: a single-flight control loop per table
//! - Archive sinks, manifest persistence and table directory locking
//!
//! ## Example
//!
//! ```rust
//! use ebbtide_core::{CycleOutcome, PartitionedTable, RetentionPolicy, TableConfig, DAY};
//! use ebbtide_storage::PartitionKey;
//!
//! let config = TableConfig::default().retention(RetentionPolicy::new(7, 2, DAY));
//! let table = PartitionedTable::in_memory(config).unwrap();
//!
//! let now = PartitionKey::parse("2024-05-01T06:00:00Z").unwrap();
//! let outcome = table.run_retention_cycle(now).unwrap();
//! assert!(matches!(outcome, CycleOutcome::Completed(_)));
//! assert!(table.partition_stats().len() > 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod archive;
mod catalog;
mod compression;
mod config;
mod dir;
mod error;
mod manifest;
mod scheduler;
mod stats;
mod table;
mod tier;
mod window;

pub use archive::{ArchiveBatch, ArchiveReceipt, ArchiveSink, FileArchive, InMemoryArchive};
pub use catalog::{CatalogRecord, CatalogSnapshot, Partition, PartitionCatalog, PartitionState};
pub use compression::{CompressionPolicy, DEFAULT_ROW_PARTITIONS};
pub use config::{RetentionPolicy, RetryPolicy, TableConfig, DAY};
pub use dir::TableDir;
pub use error::{BoundaryConflictKind, ErrorKind, LifecycleError, LifecycleResult};
pub use manifest::{InMemoryManifestStore, Manifest, ManifestStore, MANIFEST_MAGIC, MANIFEST_VERSION};
pub use scheduler::{CycleOutcome, CyclePlan, CycleReport, RetentionScheduler};
pub use stats::{LifecycleStats, StatsSnapshot};
pub use table::{AdminOutcome, PartitionedTable};
pub use tier::{StorageTierMap, TierConfig, TierSpec};
pub use window::{
    AddedPartition, CancellationToken, CompressionChange, DroppedPartition, MigrationKind,
    MigrationPlan, MigrationStep, PendingDrop, SlidingWindowManager, TierChange,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
