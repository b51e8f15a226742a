//! # Ebbtide Testkit
//!
//! Test utilities for ebbtide.
//!
//! This crate provides:
//! - Table fixtures with handles on the underlying engine and archive
//! - Property-based test generators using proptest
//! - Fault-injecting engine and archive wrappers
//! - Crash and resume scenarios for on-disk tables
//! - Invariant checks shared by scenario and property tests
//! - Stress testing utilities for the single-writer lock
//!
//! ## Usage
//!
//! ```rust
//! use ebbtide_testkit::prelude::*;
//!
//! let fixture = TestTable::memory();
//! fixture.table.add_partition(day(2024, 1, 1)).unwrap();
//! check_invariants(&fixture);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
