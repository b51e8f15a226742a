//! Table directory management.
//!
//! This module handles the file system layout of one partitioned table:
//!
//! ```text
//! <table>/
//! ├─ LOCK            # Advisory lock for single-writer
//! ├─ MANIFEST        # Catalog, tiers, policies, pending drop
//! ├─ MANIFEST.tmp    # Atomic-write staging
//! ├─ archive.log     # File archive
//! └─ data/           # Directory engine, one tier-<id>/ per tier
//! ```
//!
//! The LOCK file ensures only one process manages the table at a time.

use crate::error::{LifecycleError, LifecycleResult};
use crate::manifest::{Manifest, ManifestStore};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";
const LOCK_FILE: &str = "LOCK";
const ARCHIVE_FILE: &str = "archive.log";
const DATA_DIR: &str = "data";

/// Holds the exclusive lock on a table directory.
///
/// Only one `TableDir` instance can exist per directory at a time. The lock
/// is released when the value is dropped.
#[derive(Debug)]
pub struct TableDir {
    path: PathBuf,
    _lock_file: File,
}

impl TableDir {
    /// Opens or creates a table directory.
    ///
    /// # Errors
    ///
    /// - `InvalidFormat` if the directory is missing and `create_if_missing`
    ///   is false, or the path is not a directory
    /// - `TableLocked` if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> LifecycleResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(LifecycleError::invalid_format(format!(
                    "table directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(LifecycleError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(LifecycleError::TableLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the table directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Returns the path to the archive log.
    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.path.join(ARCHIVE_FILE)
    }

    /// Returns the root of the directory engine.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    /// Returns true if no manifest was ever saved.
    #[must_use]
    pub fn is_new_table(&self) -> bool {
        !self.manifest_path().exists()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> LifecycleResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> LifecycleResult<()> {
        Ok(())
    }
}

impl ManifestStore for TableDir {
    fn load(&self) -> LifecycleResult<Option<Manifest>> {
        let manifest_path = self.manifest_path();
        if !manifest_path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(&manifest_path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(None);
        }
        Manifest::decode(&data).map(Some)
    }

    /// Writes the temp file, syncs it, renames it over MANIFEST and syncs the
    /// directory.
    fn save(&self, manifest: &Manifest) -> LifecycleResult<()> {
        let temp_path = self.path.join(MANIFEST_TEMP);
        let data = manifest.encode()?;

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.manifest_path())?;
        self.sync_directory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PartitionCatalog;
    use crate::compression::CompressionPolicy;
    use crate::config::RetentionPolicy;
    use crate::tier::TierConfig;
    use ebbtide_storage::{PartitionKey, TableStructure, TierId};
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let table_path = temp.path().join("orders");

        let dir = TableDir::open(&table_path, true).unwrap();
        assert!(table_path.is_dir());
        assert!(dir.is_new_table());
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        let result = TableDir::open(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(LifecycleError::InvalidFormat { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let table_path = temp.path().join("locked");

        let _first = TableDir::open(&table_path, true).unwrap();
        let result = TableDir::open(&table_path, true);
        assert!(matches!(result, Err(LifecycleError::TableLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let table_path = temp.path().join("reopen");
        {
            let _dir = TableDir::open(&table_path, true).unwrap();
        }
        let _again = TableDir::open(&table_path, true).unwrap();
    }

    #[test]
    fn manifest_round_trip() {
        let temp = tempdir().unwrap();
        let dir = TableDir::open(&temp.path().join("orders"), true).unwrap();
        assert!(dir.load().unwrap().is_none());

        let mut catalog = PartitionCatalog::new(TierId(1));
        catalog.split(PartitionKey::from_ymd(2023, 2, 1).unwrap()).unwrap();
        let manifest = Manifest::new(
            &catalog,
            TierConfig::default(),
            CompressionPolicy::default(),
            RetentionPolicy::default(),
            TableStructure::default(),
        );
        dir.save(&manifest).unwrap();

        assert!(!dir.is_new_table());
        assert!(!dir.path().join(MANIFEST_TEMP).exists());
        assert_eq!(dir.load().unwrap(), Some(manifest));
    }
}
