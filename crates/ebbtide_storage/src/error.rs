//! Error types for storage engine operations.

use crate::types::{KeyRange, PartitionId, PartitionKey, TierId};
use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors reported by a storage engine or the record log.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The tier cannot hold another staging area or partition.
    #[error("allocation failed in {tier}: {message}")]
    AllocationFailed {
        /// The tier that refused the allocation.
        tier: TierId,
        /// Why the allocation was refused.
        message: String,
    },

    /// The engine is not reachable or has been shut down.
    #[error("storage engine unavailable: {0}")]
    Unavailable(String),

    /// Staged rows fall outside the destination partition's key range.
    #[error("row key {key} outside destination range {range}")]
    DomainViolation {
        /// First offending key.
        key: PartitionKey,
        /// The destination partition's range.
        range: KeyRange,
    },

    /// The destination partition already holds data.
    #[error("switch target {partition} is not empty ({rows} rows)")]
    TargetNotEmpty {
        /// The destination partition.
        partition: PartitionId,
        /// Rows currently stored there.
        rows: u64,
    },

    /// The staging handle does not refer to a live staging area.
    #[error("unknown staging area {0}")]
    UnknownStaging(Uuid),

    /// The record log or a data file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Compression re-encoding was rejected.
    #[error("compression of {partition} failed: {message}")]
    Compression {
        /// The partition being re-encoded.
        partition: PartitionId,
        /// Engine-provided reason.
        message: String,
    },
}

impl StorageError {
    /// Creates an allocation failure.
    pub fn allocation_failed(tier: TierId, message: impl Into<String>) -> Self {
        Self::AllocationFailed {
            tier,
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Returns true for errors that a later retry may clear.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. } | Self::Unavailable(_))
    }
}
