//! Error types for the partition lifecycle core.

use ebbtide_storage::{
    KeyRange, PartitionId, PartitionKey, StagingHandle, StorageError, TierId,
};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Why a split or merge was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryConflictKind {
    /// The boundary is already present.
    AlreadyExists,
    /// The boundary is not present.
    NotFound,
    /// The boundary does not extend the tail of the sequence.
    NotAscending,
    /// Both partitions adjacent to the boundary hold data.
    LowerNotEmpty,
}

impl fmt::Display for BoundaryConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AlreadyExists => "boundary already exists",
            Self::NotFound => "boundary not found",
            Self::NotAscending => "boundary is not above the newest boundary",
            Self::LowerNotEmpty => "lower partition is neither empty nor archived",
        };
        f.write_str(text)
    }
}

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation aborted cleanly. Recompute the request and try again.
    Recoverable,
    /// Transient resource exhaustion. Retry with backoff.
    RetryWithBackoff,
    /// Another operation holds the table. Retry later, never queue.
    RetryLater,
    /// Data is in flight between the table and the archive. Retry the drop
    /// to completion or intervene manually.
    NeedsAttention,
    /// Corruption, I/O failure or misconfiguration.
    Fatal,
}

/// Errors that can occur in lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A split or merge violates the boundary ordering invariants.
    #[error("boundary conflict at {boundary}: {kind}")]
    BoundaryConflict {
        /// The boundary involved.
        boundary: PartitionKey,
        /// What was violated.
        kind: BoundaryConflictKind,
    },

    /// No partition with the given identity is in the catalog.
    #[error("partition not found: {partition}")]
    PartitionNotFound {
        /// The missing partition.
        partition: PartitionId,
    },

    /// Switch source and destination structures differ.
    #[error("schema mismatch: {message}")]
    SchemaMismatch {
        /// Description of the mismatch.
        message: String,
        /// Staging area kept for a retry, if any.
        staging: Option<StagingHandle>,
    },

    /// Staged rows fall outside the destination partition's range.
    #[error("row key {key} outside partition range {range}")]
    DomainViolation {
        /// First offending key.
        key: PartitionKey,
        /// Destination range.
        range: KeyRange,
        /// Staging area kept for a retry, if any.
        staging: Option<StagingHandle>,
    },

    /// A tier is at capacity or the storage engine is unavailable.
    #[error("storage allocation failed{}: {message}", tier.map(|t| format!(" in {t}")).unwrap_or_default())]
    StorageAllocation {
        /// The tier that refused, when known.
        tier: Option<TierId>,
        /// Why the allocation failed.
        message: String,
    },

    /// Another lifecycle operation holds the table lock.
    #[error("concurrent modification: another lifecycle operation is in progress")]
    ConcurrentModification,

    /// A partition was switched out but is not yet merged away.
    #[error("partial migration of {partition} at boundary {boundary}: {message}")]
    PartialMigration {
        /// The switched-out partition.
        partition: PartitionId,
        /// The boundary awaiting merge.
        boundary: PartitionKey,
        /// Why the migration stopped.
        message: String,
    },

    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Manifest or archive data has an invalid format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// A retention, tier or compression policy is not usable.
    #[error("invalid policy: {message}")]
    InvalidPolicy {
        /// What is wrong with the policy.
        message: String,
    },

    /// The operation was cancelled before it changed anything.
    #[error("operation cancelled")]
    Cancelled,

    /// Another process holds the table directory.
    #[error("table locked: another process has exclusive access")]
    TableLocked,

    /// Stored data failed checksum verification.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The archive sink refused or failed to store a batch.
    #[error("archive error: {message}")]
    Archive {
        /// Sink-provided reason.
        message: String,
    },
}

impl LifecycleError {
    /// Creates a boundary conflict.
    pub fn boundary_conflict(boundary: PartitionKey, kind: BoundaryConflictKind) -> Self {
        Self::BoundaryConflict { boundary, kind }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid policy error.
    pub fn invalid_policy(message: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            message: message.into(),
        }
    }

    /// Creates an archive error.
    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive {
            message: message.into(),
        }
    }

    /// Classifies the error for retry decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BoundaryConflict { .. }
            | Self::PartitionNotFound { .. }
            | Self::SchemaMismatch { .. }
            | Self::DomainViolation { .. }
            | Self::InvalidPolicy { .. }
            | Self::Cancelled => ErrorKind::Recoverable,
            Self::StorageAllocation { .. } => ErrorKind::RetryWithBackoff,
            Self::ConcurrentModification | Self::TableLocked => ErrorKind::RetryLater,
            Self::PartialMigration { .. } => ErrorKind::NeedsAttention,
            Self::Storage(_)
            | Self::Io(_)
            | Self::InvalidFormat { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Archive { .. } => ErrorKind::Fatal,
        }
    }

    /// Returns the staging area a failed switch left behind, if any.
    #[must_use]
    pub fn kept_staging(&self) -> Option<StagingHandle> {
        match self {
            Self::SchemaMismatch { staging, .. } | Self::DomainViolation { staging, .. } => {
                *staging
            }
            _ => None,
        }
    }

    pub(crate) fn with_staging(self, handle: StagingHandle) -> Self {
        match self {
            Self::SchemaMismatch { message, .. } => Self::SchemaMismatch {
                message,
                staging: Some(handle),
            },
            Self::DomainViolation { key, range, .. } => Self::DomainViolation {
                key,
                range,
                staging: Some(handle),
            },
            other => other,
        }
    }
}

impl From<StorageError> for LifecycleError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AllocationFailed { tier, message } => Self::StorageAllocation {
                tier: Some(tier),
                message,
            },
            StorageError::Unavailable(message) => Self::StorageAllocation {
                tier: None,
                message,
            },
            StorageError::DomainViolation { key, range } => Self::DomainViolation {
                key,
                range,
                staging: None,
            },
            other => Self::Storage(other),
        }
    }
}

impl From<ciborium::de::Error<io::Error>> for LifecycleError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::invalid_format(format!("CBOR decode: {err}"))
    }
}

impl From<ciborium::ser::Error<io::Error>> for LifecycleError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::invalid_format(format!("CBOR encode: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failures_map_to_retry_with_backoff() {
        let err: LifecycleError = StorageError::allocation_failed(TierId(2), "full").into();
        assert!(matches!(err, LifecycleError::StorageAllocation { tier: Some(TierId(2)), .. }));
        assert_eq!(err.kind(), ErrorKind::RetryWithBackoff);
        assert_eq!(err.to_string(), "storage allocation failed in tier:2: full");
    }

    #[test]
    fn domain_violation_carries_kept_staging() {
        let handle = StagingHandle::new(TierId(1));
        let err: LifecycleError = StorageError::DomainViolation {
            key: PartitionKey::new(5),
            range: KeyRange::UNBOUNDED,
        }
        .into();
        assert_eq!(err.kept_staging(), None);

        let err = err.with_staging(handle);
        assert_eq!(err.kept_staging(), Some(handle));
        assert_eq!(err.kind(), ErrorKind::Recoverable);
    }

    #[test]
    fn partial_migration_needs_attention() {
        let err = LifecycleError::PartialMigration {
            partition: PartitionId(1),
            boundary: PartitionKey::new(0),
            message: "archive offline".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NeedsAttention);
        assert_eq!(LifecycleError::ConcurrentModification.kind(), ErrorKind::RetryLater);
    }

    #[test]
    fn boundary_conflict_display() {
        let err = LifecycleError::boundary_conflict(
            PartitionKey::from_ymd(2022, 1, 1).unwrap(),
            BoundaryConflictKind::AlreadyExists,
        );
        assert_eq!(err.to_string(), "boundary conflict at 2022-01-01: boundary already exists");
    }
}
