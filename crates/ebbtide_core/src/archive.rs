//! Append-only destinations for switched-out partitions.
//!
//! A drop never merges a partition away before its sink has acknowledged
//! the data. Sinks must be idempotent on `batch_id`: a drop retried after a
//! lost acknowledgment hands over the same batch again.

use crate::error::{LifecycleError, LifecycleResult};
use ebbtide_storage::{KeyRange, PartitionId, RecordLog, Row};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// The rows of one switched-out partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveBatch {
    /// Identity of the handoff. Equal to the staging area's identity, so a
    /// retried handoff reuses it.
    pub batch_id: Uuid,
    /// The partition the rows came from.
    pub partition: PartitionId,
    /// Key range the partition covered.
    pub range: KeyRange,
    /// The rows.
    pub rows: Vec<Row>,
}

impl ArchiveBatch {
    /// Computes the SHA-256 digest of the batch rows.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for row in &self.rows {
            hasher.update(row.key.as_i64().to_le_bytes());
            hasher.update((row.payload.len() as u64).to_le_bytes());
            hasher.update(&row.payload);
        }
        hasher.finalize().into()
    }

    fn receipt(&self) -> ArchiveReceipt {
        ArchiveReceipt {
            batch_id: self.batch_id,
            rows: self.rows.len() as u64,
            digest: self.digest(),
        }
    }
}

/// Acknowledgment that a batch is durably stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReceipt {
    /// The acknowledged batch.
    pub batch_id: Uuid,
    /// Rows stored.
    pub rows: u64,
    /// SHA-256 over the stored rows.
    pub digest: [u8; 32],
}

/// Destination receiving switched-out partitions.
///
/// # Implementors
///
/// - [`InMemoryArchive`] - For testing and ephemeral tables
/// - [`FileArchive`] - Framed records in an append-only file
pub trait ArchiveSink: Send + Sync {
    /// Stores a batch durably and acknowledges it.
    ///
    /// Receiving a batch that is already stored returns the stored receipt
    /// without appending it again.
    ///
    /// # Errors
    ///
    /// Any error means the batch is not acknowledged and the drop must not
    /// commit.
    fn receive(&self, batch: &ArchiveBatch) -> LifecycleResult<ArchiveReceipt>;

    /// Returns true if a batch with this identity is stored.
    fn contains(&self, batch_id: Uuid) -> bool;
}

/// Archive sink keeping batches in memory.
#[derive(Debug, Default)]
pub struct InMemoryArchive {
    batches: RwLock<Vec<ArchiveBatch>>,
    offline: RwLock<bool>,
}

impl InMemoryArchive {
    /// Creates an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `receive` fail until cleared.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.write() = offline;
    }

    /// Returns a copy of every stored batch in arrival order.
    #[must_use]
    pub fn batches(&self) -> Vec<ArchiveBatch> {
        self.batches.read().clone()
    }

    /// Returns the number of stored batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.read().len()
    }

    /// Returns true if nothing has been archived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.read().is_empty()
    }
}

impl ArchiveSink for InMemoryArchive {
    fn receive(&self, batch: &ArchiveBatch) -> LifecycleResult<ArchiveReceipt> {
        if *self.offline.read() {
            return Err(LifecycleError::archive("archive offline"));
        }
        let mut batches = self.batches.write();
        if let Some(stored) = batches.iter().find(|b| b.batch_id == batch.batch_id) {
            return Ok(stored.receipt());
        }
        batches.push(batch.clone());
        Ok(batch.receipt())
    }

    fn contains(&self, batch_id: Uuid) -> bool {
        self.batches.read().iter().any(|b| b.batch_id == batch_id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBatch {
    batch: ArchiveBatch,
    digest: [u8; 32],
}

/// Archive sink appending CBOR-encoded batches to a record log.
///
/// The batch index is rebuilt from the log on open. A batch is synced to
/// disk before it is acknowledged.
#[derive(Debug)]
pub struct FileArchive {
    path: PathBuf,
    log: Mutex<RecordLog>,
    index: RwLock<HashMap<Uuid, ArchiveReceipt>>,
}

impl FileArchive {
    /// Opens or creates the archive file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is corrupted or a stored batch's digest
    /// does not match its rows.
    pub fn open(path: &Path) -> LifecycleResult<Self> {
        let mut log = RecordLog::open_with_create_dirs(path)?;
        let mut index = HashMap::new();
        for record in log.records()? {
            let stored: StoredBatch = ciborium::from_reader(record.as_slice())?;
            let receipt = stored.batch.receipt();
            if receipt.digest != stored.digest {
                return Err(LifecycleError::invalid_format(format!(
                    "archived batch {} does not match its digest",
                    stored.batch.batch_id
                )));
            }
            index.insert(receipt.batch_id, receipt);
        }

        tracing::debug!(path = %path.display(), batches = index.len(), "opened archive");
        Ok(Self {
            path: path.to_path_buf(),
            log: Mutex::new(log),
            index: RwLock::new(index),
        })
    }

    /// Returns the archive file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of stored batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if nothing has been archived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Reads back every stored batch in arrival order.
    pub fn batches(&self) -> LifecycleResult<Vec<ArchiveBatch>> {
        let records = self.log.lock().records()?;
        records
            .iter()
            .map(|record| {
                let stored: StoredBatch = ciborium::from_reader(record.as_slice())?;
                Ok(stored.batch)
            })
            .collect()
    }
}

impl ArchiveSink for FileArchive {
    fn receive(&self, batch: &ArchiveBatch) -> LifecycleResult<ArchiveReceipt> {
        let mut log = self.log.lock();
        if let Some(receipt) = self.index.read().get(&batch.batch_id) {
            return Ok(*receipt);
        }

        let receipt = batch.receipt();
        let mut buf = Vec::new();
        ciborium::into_writer(
            &StoredBatch {
                batch: batch.clone(),
                digest: receipt.digest,
            },
            &mut buf,
        )?;
        log.append(&buf)?;
        log.sync()?;

        self.index.write().insert(receipt.batch_id, receipt);
        tracing::info!(
            batch = %receipt.batch_id,
            partition = %batch.partition,
            rows = receipt.rows,
            "archived batch"
        );
        Ok(receipt)
    }

    fn contains(&self, batch_id: Uuid) -> bool {
        self.index.read().contains_key(&batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebbtide_storage::PartitionKey;
    use tempfile::tempdir;

    fn batch(rows: &[i64]) -> ArchiveBatch {
        ArchiveBatch {
            batch_id: Uuid::new_v4(),
            partition: PartitionId(3),
            range: KeyRange::new(None, Some(PartitionKey::new(100))),
            rows: rows
                .iter()
                .map(|&k| Row::new(PartitionKey::new(k), vec![k as u8; 4]))
                .collect(),
        }
    }

    #[test]
    fn in_memory_receive_is_idempotent() {
        let archive = InMemoryArchive::new();
        let batch = batch(&[1, 2, 3]);

        let first = archive.receive(&batch).unwrap();
        let second = archive.receive(&batch).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.rows, 3);
        assert_eq!(archive.len(), 1);
        assert!(archive.contains(batch.batch_id));
    }

    #[test]
    fn offline_archive_refuses() {
        let archive = InMemoryArchive::new();
        archive.set_offline(true);
        let batch = batch(&[1]);
        assert!(archive.receive(&batch).is_err());
        assert!(!archive.contains(batch.batch_id));
    }

    #[test]
    fn digest_covers_row_content() {
        let a = batch(&[1, 2]);
        let mut b = a.clone();
        b.rows[1].payload.push(0);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), a.clone().digest());
    }

    #[test]
    fn file_archive_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.log");
        let stored = batch(&[10, 20]);
        let receipt;
        {
            let archive = FileArchive::open(&path).unwrap();
            receipt = archive.receive(&stored).unwrap();
        }

        let archive = FileArchive::open(&path).unwrap();
        assert!(archive.contains(stored.batch_id));
        assert_eq!(archive.receive(&stored).unwrap(), receipt);
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.batches().unwrap(), vec![stored]);
    }
}
