//! Stress tests for the sliding window.
//!
//! These exercise the single-writer lock, snapshot reads and the
//! scheduler's single-flight guard under concurrent access.

use crate::fixtures::rows_from;
use ebbtide_core::{CycleOutcome, LifecycleError, PartitionedTable, DAY};
use ebbtide_storage::PartitionKey;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations turned away without effect: lock contention, a skipped
    /// cycle or a boundary another writer got to first.
    pub rejected_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, rejected: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + rejected + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            rejected_ops: rejected,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Rejected: {}", self.rejected_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Rows loaded into each added partition.
    pub rows_per_partition: usize,
    /// First boundary added.
    pub start: PartitionKey,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            rows_per_partition: 16,
            start: PartitionKey::new(1_704_067_200),
        }
    }
}

fn boundary_at(config: &StressConfig, offset: u32) -> Option<PartitionKey> {
    config.start.checked_add_periods(DAY, offset)
}

fn is_rejection(err: &LifecycleError) -> bool {
    matches!(
        err,
        LifecycleError::ConcurrentModification | LifecycleError::BoundaryConflict { .. }
    )
}

/// Adds a partition per operation, dropping the oldest every third step.
pub fn stress_add_drop_cycles(table: &PartitionedTable, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let result = if i % 3 == 2 {
            table.drop_oldest_partition().map(|_| ())
        } else {
            let offset = u32::try_from(i).unwrap_or(u32::MAX);
            match boundary_at(config, offset) {
                Some(boundary) => {
                    let rows = rows_from(boundary, config.rows_per_partition, 1);
                    table.add_partition_with_rows(boundary, &rows).map(|_| ())
                }
                None => Err(LifecycleError::invalid_policy("boundary out of range")),
            }
        };
        match result {
            Ok(()) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, 0, failed, start.elapsed())
}

/// Races writers for ascending boundaries.
///
/// Each writer claims the next day from a shared counter and tries to add
/// it. A writer that loses the lock, or whose day was overtaken by a later
/// one, is counted as rejected.
pub fn stress_concurrent_adds(table: Arc<PartitionedTable>, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let next_day = Arc::new(AtomicU32::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let table = Arc::clone(&table);
            let successful = Arc::clone(&successful);
            let rejected = Arc::clone(&rejected);
            let failed = Arc::clone(&failed);
            let next_day = Arc::clone(&next_day);
            let config = config.clone();

            thread::spawn(move || {
                for _ in 0..ops_per_thread {
                    let offset = next_day.fetch_add(1, Ordering::SeqCst);
                    let Some(boundary) = boundary_at(&config, offset) else {
                        failed.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let rows = rows_from(boundary, config.rows_per_partition, 1);
                    match table.add_partition_with_rows(boundary, &rows) {
                        Ok(_) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) if is_rejection(&e) => {
                            rejected.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        rejected.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Reads catalog snapshots while one writer adds and drops partitions.
///
/// Every snapshot must be internally consistent: contiguous ranges,
/// unbounded at both ends. A torn snapshot counts as a failure.
pub fn stress_snapshot_reads(table: Arc<PartitionedTable>, config: &StressConfig) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));

    let start = Instant::now();

    let readers: Vec<_> = (0..config.threads)
        .map(|_| {
            let table = Arc::clone(&table);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let done = Arc::clone(&done);

            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let snapshot = table.partition_stats();
                    let contiguous = snapshot
                        .windows(2)
                        .all(|pair| pair[0].range.upper == pair[1].range.lower);
                    let bounded = snapshot.first().is_some_and(|p| p.range.lower.is_none())
                        && snapshot.last().is_some_and(|p| p.range.upper.is_none());
                    if contiguous && bounded {
                        successful.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    let writes = stress_add_drop_cycles(&table, config);
    done.store(true, Ordering::Release);

    for handle in readers {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed) + writes.successful_ops,
        0,
        failed.load(Ordering::Relaxed) + writes.failed_ops,
        start.elapsed(),
    )
}

/// Fires retention cycles from several threads at once.
///
/// At most one cycle runs at a time; the rest report `Skipped` and count
/// as rejected.
pub fn stress_concurrent_cycles(
    table: Arc<PartitionedTable>,
    now: PartitionKey,
    config: &StressConfig,
) -> StressTestResult {
    let successful = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let table = Arc::clone(&table);
            let successful = Arc::clone(&successful);
            let rejected = Arc::clone(&rejected);
            let failed = Arc::clone(&failed);

            thread::spawn(move || {
                for _ in 0..ops_per_thread {
                    match table.run_retention_cycle(now) {
                        Ok(CycleOutcome::Completed(_)) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(CycleOutcome::Skipped) => {
                            rejected.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        rejected.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}
