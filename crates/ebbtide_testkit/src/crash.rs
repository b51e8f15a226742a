//! Crash and resume testing for on-disk tables.
//!
//! Each scenario stops a lifecycle operation at a chosen point, drops the
//! table without cleanup (the process "crashes"), reopens the directory
//! and checks that the catalog, the engine and the archive agree.
//!
//! ## Crash points
//!
//! 1. **During add** - the catalog write after switch-in fails
//! 2. **After switch-in** - the process dies before the catalog write or
//!    any rollback, leaving a partition file and a staging file no catalog
//!    mentions
//! 3. **After switch-out** - a drop dies before recording itself as pending
//! 4. **Before archive ack** - the archive rejects the switched-out rows
//! 5. **After ack, before merge** - the archive holds the rows, the catalog
//!    write that removes the boundary fails
//!
//! ## Usage
//!
//! ```rust
//! use ebbtide_testkit::crash::CrashHarness;
//!
//! let mut harness = CrashHarness::new().unwrap();
//! harness.run_all_tests();
//! assert!(harness.all_passed(), "{}", harness.summary());
//! ```

use crate::faults::{FailingManifestStore, FlakyArchive};
use crate::fixtures::{day, default_config, rows_from};
use ebbtide_core::{FileArchive, LifecycleError, LifecycleResult, PartitionedTable, TableDir};
use ebbtide_storage::{
    DirEngine, KeyRange, PartitionKey, StorageEngine, StrictSchemaRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const ROWS_PER_PARTITION: usize = 5;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// After switch-in, before the catalog records the new partition.
    DuringAdd,
    /// After switch-in, with no catalog write and no rollback.
    AfterSwitchIn,
    /// After a drop's switch-out, before its pending record is written.
    AfterSwitchOut,
    /// After switch-out, before the archive acknowledges the rows.
    BeforeArchiveAck,
    /// After the archive acknowledged, before the boundary is merged.
    AfterArchiveAckBeforeMerge,
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Rows expected in table and archive after recovery.
    pub expected_rows: u64,
    /// Rows found in table and archive after recovery.
    pub actual_rows: u64,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, rows: u64) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_rows: rows,
            actual_rows: rows,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: u64, actual: u64, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_rows: expected,
            actual_rows: actual,
            error: Some(error.to_string()),
        }
    }
}

/// A table opened with fault-injecting archive and manifest store.
struct Instrumented {
    table: PartitionedTable,
    archive: Arc<FlakyArchive>,
    store: Arc<FailingManifestStore>,
}

/// Test harness for crash recovery scenarios.
pub struct CrashHarness {
    root: TempDir,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashHarness {
    /// Creates a harness rooted in a new temporary directory.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            root: TempDir::new()?,
            results: Vec::new(),
        })
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn open_instrumented(path: &Path) -> LifecycleResult<Instrumented> {
        let config = default_config();
        let dir = Arc::new(TableDir::open(path, true)?);
        let engine = DirEngine::open(&dir.data_dir(), &config.tiers.tier_ids())?;
        let archive = Arc::new(FlakyArchive::new(
            Arc::new(FileArchive::open(&dir.archive_path())?),
            0,
        ));
        let store = Arc::new(FailingManifestStore::new(dir));
        let table = PartitionedTable::with_parts(
            Arc::new(engine),
            Arc::new(StrictSchemaRegistry::new()),
            archive.clone(),
            Some(store.clone()),
            &config,
        )?;
        Ok(Instrumented {
            table,
            archive,
            store,
        })
    }

    fn reopen(path: &Path) -> LifecycleResult<PartitionedTable> {
        PartitionedTable::open(path, default_config())
    }

    /// Opens the data directory of a closed table directly.
    fn raw_engine(path: &Path) -> LifecycleResult<DirEngine> {
        let dir = TableDir::open(path, false)?;
        Ok(DirEngine::open(
            &dir.data_dir(),
            &default_config().tiers.tier_ids(),
        )?)
    }

    /// Adds a partition per boundary with [`ROWS_PER_PARTITION`] rows each.
    fn populate(table: &PartitionedTable, boundaries: &[PartitionKey]) -> LifecycleResult<()> {
        for &boundary in boundaries {
            let rows = rows_from(boundary, ROWS_PER_PARTITION, 60);
            table.add_partition_with_rows(boundary, &rows)?;
        }
        Ok(())
    }

    fn table_rows(table: &PartitionedTable) -> u64 {
        table.partition_stats().iter().map(|p| p.row_count).sum()
    }

    /// Returns archived batch and row counts. The table must be closed.
    fn archived(path: &Path) -> LifecycleResult<(usize, u64)> {
        let dir = TableDir::open(path, false)?;
        let batches = FileArchive::open(&dir.archive_path())?.batches()?;
        let rows = batches.iter().map(|b| b.rows.len() as u64).sum();
        Ok((batches.len(), rows))
    }

    fn record(
        &mut self,
        description: &str,
        expected: u64,
        result: LifecycleResult<CrashRecoveryResult>,
    ) -> CrashRecoveryResult {
        let result = result.unwrap_or_else(|e| {
            CrashRecoveryResult::fail(description, expected, 0, &e.to_string())
        });
        self.results.push(result.clone());
        result
    }

    /// Tests that committed adds and drops survive a restart.
    pub fn test_committed_window_survives(&mut self) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Committed window survives restart";
        let path = self.table_path("committed");
        let result = (|| -> LifecycleResult<CrashRecoveryResult> {
            let boundaries = [day(2024, 1, 1), day(2024, 1, 2), day(2024, 1, 3)];
            let before = {
                let table = Self::reopen(&path)?;
                Self::populate(&table, &boundaries)?;
                // Drops the empty leading partition.
                table.drop_oldest_partition()?;
                table.partition_stats()
            };

            let table = Self::reopen(&path)?;
            let after = table.partition_stats();
            let rows = Self::table_rows(&table);
            let expected = (boundaries.len() * ROWS_PER_PARTITION) as u64;
            if after.as_slice() == before.as_slice() && rows == expected {
                Ok(CrashRecoveryResult::pass(DESCRIPTION, rows))
            } else {
                Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    expected,
                    rows,
                    "catalog changed across restart",
                ))
            }
        })();
        self.record(DESCRIPTION, (3 * ROWS_PER_PARTITION) as u64, result)
    }

    /// Tests that an add interrupted before its catalog write leaves no trace.
    pub fn test_crash_during_add(&mut self) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Interrupted add leaves no partition behind";
        let path = self.table_path("during-add");
        let expected = ROWS_PER_PARTITION as u64;
        let result = (|| -> LifecycleResult<CrashRecoveryResult> {
            {
                let fx = Self::open_instrumented(&path)?;
                Self::populate(&fx.table, &[day(2024, 1, 1)])?;
                fx.store.fail_after(0);
                if Self::populate(&fx.table, &[day(2024, 1, 2)]).is_ok() {
                    return Ok(CrashRecoveryResult::fail(
                        DESCRIPTION,
                        expected,
                        expected * 2,
                        "add succeeded despite the failing catalog write",
                    ));
                }
            }

            let table = Self::reopen(&path)?;
            let boundaries = table.manager().catalog().boundaries();
            let rows = Self::table_rows(&table);
            drop(table);

            let leftover = Self::raw_engine(&path)?.staging_areas()?.len();

            if boundaries == vec![day(2024, 1, 1)] && rows == expected && leftover == 0 {
                Ok(CrashRecoveryResult::pass(DESCRIPTION, rows))
            } else {
                Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    expected,
                    rows,
                    &format!("boundaries {:?}, {} staging areas left", boundaries, leftover),
                ))
            }
        })();
        self.record(DESCRIPTION, expected, result)
    }

    /// Runs a drop that stops at `point`, crashes, reopens and resumes it.
    fn crash_during_drop(
        &mut self,
        point: CrashPoint,
        name: &str,
        description: &str,
    ) -> CrashRecoveryResult {
        let path = self.table_path(name);
        let expected = (2 * ROWS_PER_PARTITION) as u64;
        let result = (|| -> LifecycleResult<CrashRecoveryResult> {
            {
                let fx = Self::open_instrumented(&path)?;
                Self::populate(&fx.table, &[day(2024, 1, 1), day(2024, 1, 2)])?;
                fx.table.drop_oldest_partition()?;

                match point {
                    CrashPoint::BeforeArchiveAck => fx.archive.fail_next(1),
                    // The pending record is written, the merge is not.
                    CrashPoint::AfterArchiveAckBeforeMerge => fx.store.fail_after(1),
                    _ => {}
                }
                match fx.table.drop_oldest_partition() {
                    Err(LifecycleError::PartialMigration { .. }) => {}
                    other => {
                        return Ok(CrashRecoveryResult::fail(
                            description,
                            expected,
                            0,
                            &format!(
                                "expected a partial migration, got {:?}",
                                other.map(|o| o.is_applied())
                            ),
                        ));
                    }
                }
            }

            let table = Self::reopen(&path)?;
            if table.pending_attention().is_none() {
                return Ok(CrashRecoveryResult::fail(
                    description,
                    expected,
                    0,
                    "pending drop lost across restart",
                ));
            }
            let resumed = table
                .drop_oldest_partition()?
                .applied()
                .is_some_and(|dropped| dropped.resumed);
            let remaining = Self::table_rows(&table);
            let boundaries = table.manager().catalog().boundary_count();
            drop(table);

            let (batches, archived) = Self::archived(&path)?;
            let total = remaining + archived;
            if resumed && batches == 1 && boundaries == 0 && total == expected {
                Ok(CrashRecoveryResult::pass(description, total))
            } else {
                Ok(CrashRecoveryResult::fail(
                    description,
                    expected,
                    total,
                    &format!("resumed {}, {} batches, {} boundaries", resumed, batches, boundaries),
                ))
            }
        })();
        self.record(description, expected, result)
    }

    /// Tests that rows and files left by an add that died between switch-in
    /// and its catalog write are discarded, and the partition id is not
    /// handed out again.
    pub fn test_crash_after_switch_in(&mut self) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Add that died after switch-in leaves no orphan behind";
        let path = self.table_path("after-switch-in");
        let expected = (2 * ROWS_PER_PARTITION) as u64;
        let result = (|| -> LifecycleResult<CrashRecoveryResult> {
            let config = default_config();
            let orphan = {
                let table = Self::reopen(&path)?;
                Self::populate(&table, &[day(2024, 1, 1)])?;
                table.manager().catalog().next_partition_id()
            };
            {
                let engine = Self::raw_engine(&path)?;
                let rows = rows_from(day(2024, 1, 2), ROWS_PER_PARTITION, 60);
                let tier = config.tiers.ingest_tier;
                let staging = engine.allocate_staging(tier, 0, &config.structure)?;
                engine.load_staging(&staging, &rows)?;
                engine.switch_in(&staging, orphan, &KeyRange::new(Some(day(2024, 1, 2)), None))?;
                let loose = engine.allocate_staging(tier, 0, &config.structure)?;
                engine.load_staging(&loose, &rows)?;
            }

            let table = Self::reopen(&path)?;
            let discarded = table.stats().orphans_discarded;
            let recovered = table.manager().catalog().boundaries() == vec![day(2024, 1, 1)]
                && Self::table_rows(&table) == ROWS_PER_PARTITION as u64;
            // The same add, retried, must not run into the orphan.
            Self::populate(&table, &[day(2024, 1, 2)])?;
            let added = table.manager().catalog().newest().id;
            let rows = Self::table_rows(&table);
            drop(table);

            let engine = Self::raw_engine(&path)?;
            let leftover = engine.staging_areas()?.len();
            let orphan_rows = if added == orphan {
                0
            } else {
                engine.partition_rows(orphan)?
            };

            if recovered
                && discarded == 2
                && added != orphan
                && rows == expected
                && leftover == 0
                && orphan_rows == 0
            {
                Ok(CrashRecoveryResult::pass(DESCRIPTION, rows))
            } else {
                Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    expected,
                    rows,
                    &format!(
                        "recovered {}, {} discarded, added {} over orphan {}, {} staging areas left",
                        recovered, discarded, added, orphan, leftover
                    ),
                ))
            }
        })();
        self.record(DESCRIPTION, expected, result)
    }

    /// Tests that a drop which died after switch-out, before recording itself
    /// as pending, gets its rows back.
    pub fn test_crash_after_switch_out(&mut self) -> CrashRecoveryResult {
        const DESCRIPTION: &str = "Drop that died after switch-out restores its rows";
        let path = self.table_path("after-switch-out");
        let expected = (2 * ROWS_PER_PARTITION) as u64;
        let result = (|| -> LifecycleResult<CrashRecoveryResult> {
            let oldest = {
                let table = Self::reopen(&path)?;
                Self::populate(&table, &[day(2024, 1, 1), day(2024, 1, 2)])?;
                table.drop_oldest_partition()?;
                table.manager().catalog().oldest().id
            };
            {
                let config = default_config();
                let engine = Self::raw_engine(&path)?;
                engine.switch_out(oldest, config.tiers.ingest_tier, &config.structure)?;
            }

            let table = Self::reopen(&path)?;
            let restored = table.manager().engine().partition_rows(oldest)?;
            if table.pending_attention().is_some() || restored != ROWS_PER_PARTITION as u64 {
                return Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    expected,
                    restored,
                    "switched-out rows were not restored",
                ));
            }
            let archived_now = table
                .drop_oldest_partition()?
                .applied()
                .map_or(0, |dropped| dropped.rows);
            let remaining = Self::table_rows(&table);
            drop(table);

            let (batches, archived) = Self::archived(&path)?;
            let total = remaining + archived;
            if archived_now == ROWS_PER_PARTITION as u64 && batches == 1 && total == expected {
                Ok(CrashRecoveryResult::pass(DESCRIPTION, total))
            } else {
                Ok(CrashRecoveryResult::fail(
                    DESCRIPTION,
                    expected,
                    total,
                    &format!("{} batches after the retried drop", batches),
                ))
            }
        })();
        self.record(DESCRIPTION, expected, result)
    }

    /// Tests a crash after switch-out, before the archive acknowledged.
    pub fn test_crash_before_archive_ack(&mut self) -> CrashRecoveryResult {
        self.crash_during_drop(
            CrashPoint::BeforeArchiveAck,
            "before-ack",
            "Drop interrupted before archive ack resumes",
        )
    }

    /// Tests a crash after the archive acknowledged, before the merge.
    pub fn test_crash_after_archive_ack(&mut self) -> CrashRecoveryResult {
        self.crash_during_drop(
            CrashPoint::AfterArchiveAckBeforeMerge,
            "after-ack",
            "Drop interrupted after archive ack archives once",
        )
    }

    /// Runs all crash recovery tests.
    pub fn run_all_tests(&mut self) -> Vec<CrashRecoveryResult> {
        self.results.clear();

        self.test_committed_window_survives();
        self.test_crash_during_add();
        self.test_crash_after_switch_in();
        self.test_crash_after_switch_out();
        self.test_crash_before_archive_ack();
        self.test_crash_after_archive_ack();

        self.results.clone()
    }

    /// Returns a summary of test results.
    pub fn summary(&self) -> String {
        let passed = self.results.iter().filter(|r| r.passed).count();
        let total = self.results.len();

        let mut summary = format!(
            "\n=== Crash Recovery Test Summary ===\n\
             Passed: {}/{}\n\n",
            passed, total
        );

        for result in &self.results {
            let status = if result.passed { "✓" } else { "✗" };
            summary.push_str(&format!(
                "{} {}\n  Expected: {} rows, Actual: {} rows\n",
                status, result.description, result.expected_rows, result.actual_rows
            ));
            if let Some(ref error) = result.error {
                summary.push_str(&format!("  Error: {}\n", error));
            }
        }

        summary
    }

    /// Returns whether all tests passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_window_survives() {
        let mut harness = CrashHarness::new().unwrap();
        let result = harness.test_committed_window_survives();
        assert!(result.passed, "{}", harness.summary());
    }

    #[test]
    fn crash_during_add() {
        let mut harness = CrashHarness::new().unwrap();
        let result = harness.test_crash_during_add();
        assert!(result.passed, "{}", harness.summary());
    }

    #[test]
    fn crash_after_switch_in() {
        let mut harness = CrashHarness::new().unwrap();
        let result = harness.test_crash_after_switch_in();
        assert!(result.passed, "{}", harness.summary());
    }

    #[test]
    fn crash_after_switch_out() {
        let mut harness = CrashHarness::new().unwrap();
        let result = harness.test_crash_after_switch_out();
        assert!(result.passed, "{}", harness.summary());
    }

    #[test]
    fn crash_before_archive_ack() {
        let mut harness = CrashHarness::new().unwrap();
        let result = harness.test_crash_before_archive_ack();
        assert!(result.passed, "{}", harness.summary());
    }

    #[test]
    fn crash_after_archive_ack() {
        let mut harness = CrashHarness::new().unwrap();
        let result = harness.test_crash_after_archive_ack();
        assert!(result.passed, "{}", harness.summary());
        assert_eq!(result.actual_rows, (2 * ROWS_PER_PARTITION) as u64);
    }

    #[test]
    fn summary_counts_results() {
        let mut harness = CrashHarness::new().unwrap();
        harness.results.push(CrashRecoveryResult::pass("a", 1));
        harness.results.push(CrashRecoveryResult::fail("b", 1, 0, "lost"));
        assert!(!harness.all_passed());
        assert!(harness.summary().contains("Passed: 1/2"));
        assert!(harness.summary().contains("Error: lost"));
    }
}
