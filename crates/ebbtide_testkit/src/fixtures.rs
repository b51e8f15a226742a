//! Test fixtures and table helpers.
//!
//! Provides tables whose engine, archive and manifest store stay reachable
//! from the test, so both sides of a switch can be inspected.

use ebbtide_core::{
    InMemoryArchive, InMemoryManifestStore, PartitionedTable, RetentionPolicy, TableConfig,
    TierConfig, DAY,
};
use ebbtide_storage::{InMemoryEngine, PartitionKey, Row, StrictSchemaRegistry, TierId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// The tier every fixture ingests into.
pub const HOT: TierId = TierId(1);

/// The cold tier of [`two_tier_config`].
pub const COLD: TierId = TierId(2);

/// Returns midnight UTC of the given date.
///
/// # Panics
///
/// Panics on an invalid date.
pub fn day(year: i32, month: u32, day: u32) -> PartitionKey {
    PartitionKey::from_ymd(year, month, day).expect("valid date")
}

/// Returns `count` rows starting at `from`, `spacing` seconds apart.
pub fn rows_from(from: PartitionKey, count: usize, spacing: i64) -> Vec<Row> {
    (0..count)
        .map(|i| {
            let key = PartitionKey::new(from.as_i64() + i as i64 * spacing);
            Row::new(key, format!("row-{}", key.as_i64()).into_bytes())
        })
        .collect()
}

/// Single unlimited tier, daily partitions, a week of history.
pub fn default_config() -> TableConfig {
    TableConfig::default()
        .tiers(TierConfig::single(HOT))
        .retention(RetentionPolicy::new(7, 2, DAY))
}

/// Hot and cold tiers with the given hot partition count.
pub fn two_tier_config(hot_partitions: u32) -> TableConfig {
    let mut tiers = TierConfig::default();
    tiers.hot_partitions = hot_partitions;
    default_config().tiers(tiers)
}

/// An in-memory table with handles on its collaborators.
pub struct TestTable {
    /// The table under test.
    pub table: PartitionedTable,
    /// Its storage engine.
    pub engine: Arc<InMemoryEngine>,
    /// Its archive.
    pub archive: Arc<InMemoryArchive>,
    /// Its manifest store.
    pub store: Arc<InMemoryManifestStore>,
    config: TableConfig,
}

impl TestTable {
    /// Creates a table with [`default_config`].
    pub fn memory() -> Self {
        Self::with_config(default_config())
    }

    /// Creates a table with the given configuration.
    pub fn with_config(config: TableConfig) -> Self {
        let engine = Arc::new(InMemoryEngine::new());
        let archive = Arc::new(InMemoryArchive::new());
        let store = Arc::new(InMemoryManifestStore::new());
        let table = PartitionedTable::with_parts(
            engine.clone(),
            Arc::new(StrictSchemaRegistry::new()),
            archive.clone(),
            Some(store.clone()),
            &config,
        )
        .expect("Failed to open in-memory table");

        Self {
            table,
            engine,
            archive,
            store,
            config,
        }
    }

    /// Simulates a restart: a fresh table over the same engine, archive
    /// and manifest store.
    pub fn restart(self) -> Self {
        let Self {
            table,
            engine,
            archive,
            store,
            config,
        } = self;
        drop(table);

        let table = PartitionedTable::with_parts(
            engine.clone(),
            Arc::new(StrictSchemaRegistry::new()),
            archive.clone(),
            Some(store.clone()),
            &config,
        )
        .expect("Failed to reopen in-memory table");

        Self {
            table,
            engine,
            archive,
            store,
            config,
        }
    }

    /// Returns the configuration the table was opened with.
    pub fn config(&self) -> &TableConfig {
        &self.config
    }
}

impl std::ops::Deref for TestTable {
    type Target = PartitionedTable;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

/// An on-disk table in a temporary directory.
pub struct FileTable {
    /// The table under test. `None` while closed.
    table: Option<PartitionedTable>,
    path: PathBuf,
    _temp_dir: TempDir,
}

impl FileTable {
    /// Creates a table with [`default_config`] in a new temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("table");
        let table =
            PartitionedTable::open(&path, default_config()).expect("Failed to open file table");
        Self {
            table: Some(table),
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the table directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the table, releasing its lock.
    pub fn close(&mut self) {
        self.table = None;
    }

    /// Closes and reopens the table.
    pub fn reopen(&mut self) -> &PartitionedTable {
        self.close();
        self.table = Some(
            PartitionedTable::open(&self.path, default_config())
                .expect("Failed to reopen file table"),
        );
        self.table()
    }

    /// Returns the open table.
    ///
    /// # Panics
    ///
    /// Panics if the table is closed.
    pub fn table(&self) -> &PartitionedTable {
        self.table.as_ref().expect("table is closed")
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test with a temporary in-memory table.
pub fn with_temp_table<F, R>(f: F) -> R
where
    F: FnOnce(&TestTable) -> R,
{
    let fixture = TestTable::memory();
    f(&fixture)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a table with one partition per day starting at `start`, each
    /// holding `rows_per_day` rows.
    ///
    /// The table holds `days + 1` partitions: the leading unbounded one is
    /// empty.
    pub fn daily_table(start: PartitionKey, days: u32, rows_per_day: usize) -> TestTable {
        let fixture = TestTable::memory();
        for offset in 0..days {
            let boundary = start
                .checked_add_periods(DAY, offset)
                .expect("boundary in range");
            let rows = rows_from(boundary, rows_per_day, 60);
            fixture
                .table
                .add_partition_with_rows(boundary, &rows)
                .expect("Failed to add partition");
        }
        fixture
    }
}
