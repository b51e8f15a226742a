//! # ebbtide Storage
//!
//! Storage engine collaborators for the ebbtide partition lifecycle manager.
//!
//! The lifecycle core decides *which* partitions exist and where they live;
//! the engines in this crate own the rows. Every data movement the core
//! performs is expressed as a metadata switch between a staging area and a
//! partition slot.
//!
//! ## Design Principles
//!
//! - Switches never copy rows
//! - A failed switch has no side effects
//! - Engines know nothing about boundaries, policies or retention
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Engines
//!
//! - [`InMemoryEngine`] - For testing, with fault injection
//! - [`DirEngine`] - One directory per tier, one record-log file per partition
//!
//! ## Example
//!
//! ```rust
//! use ebbtide_storage::{
//!     InMemoryEngine, KeyRange, PartitionId, PartitionKey, Row, StorageEngine, TableStructure,
//!     TierId,
//! };
//!
//! let engine = InMemoryEngine::new();
//! let staging = engine
//!     .allocate_staging(TierId(1), 0, &TableStructure::default())
//!     .unwrap();
//! engine
//!     .load_staging(&staging, &[Row::new(PartitionKey::new(5), b"row".to_vec())])
//!     .unwrap();
//! let moved = engine
//!     .switch_in(&staging, PartitionId(1), &KeyRange::UNBOUNDED)
//!     .unwrap();
//! assert_eq!(moved, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dir;
mod engine;
mod error;
mod log;
mod memory;
mod schema;
mod types;

pub use dir::DirEngine;
pub use engine::{StagingHandle, StagingInfo, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use log::{RecordLog, FRAME_HEADER_SIZE, MAX_RECORD_SIZE};
pub use memory::InMemoryEngine;
pub use schema::{SchemaRegistry, StrictSchemaRegistry, TableStructure};
pub use types::{CompressionMode, KeyRange, ParseKeyError, PartitionId, PartitionKey, Row, TierId};
