//! Stats command implementation.

use super::open_existing;
use ebbtide_core::{Partition, PendingDrop, RetentionPolicy, StatsSnapshot};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Table statistics.
#[derive(Debug, Serialize)]
pub struct StatsResult {
    /// Table path.
    pub path: String,
    /// Partitions, oldest first.
    pub partitions: Vec<Partition>,
    /// Retention policy in force.
    pub retention: RetentionPolicy,
    /// Interrupted drop awaiting retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_drop: Option<PendingDrop>,
    /// Lifecycle counters for this process.
    pub counters: StatsSnapshot,
}

/// Runs the stats command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("Reading stats for {:?}", path);
    let table = open_existing(path)?;
    let result = StatsResult {
        path: path.display().to_string(),
        partitions: table.partition_stats().to_vec(),
        retention: table.retention_policy(),
        pending_drop: table.pending_attention(),
        counters: table.stats(),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

fn print_text_output(result: &StatsResult) {
    println!("Table: {}", result.path);
    println!();
    println!(
        "Retention: {} periods back, {} ahead, {}s per period",
        result.retention.retain_periods,
        result.retention.lookahead_periods,
        result.retention.period_length.as_secs()
    );
    println!();
    println!("Partitions ({}):", result.partitions.len());
    println!(
        "  {:>4}  {:<8}  {:<44}  {:<6}  {:<5}  {:>10}",
        "ord", "id", "range", "tier", "comp", "rows"
    );
    for partition in &result.partitions {
        println!(
            "  {:>4}  {:<8}  {:<44}  {:<6}  {:<5}  {:>10}  {}",
            partition.ordinal,
            partition.id.to_string(),
            partition.range.to_string(),
            partition.tier.to_string(),
            partition.compression.to_string(),
            partition.row_count,
            partition.state
        );
    }

    if let Some(pending) = &result.pending_drop {
        println!();
        println!(
            "⚠ Drop of {} at {} stopped after switch-out ({} rows in {})",
            pending.partition, pending.boundary, pending.rows, pending.staging
        );
        println!("  Run `ebbtide drop-oldest` to finish it.");
    }
    if result.counters.orphans_discarded > 0 {
        println!();
        println!(
            "Discarded {} leftovers of interrupted operations on open",
            result.counters.orphans_discarded
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stats_in_both_formats() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");
        super::super::init::run(&path).unwrap();

        run(&path, "text").unwrap();
        run(&path, "json").unwrap();
    }

    #[test]
    fn result_serializes_partitions() {
        let result = StatsResult {
            path: "t".to_string(),
            partitions: Vec::new(),
            retention: RetentionPolicy::default(),
            pending_drop: None,
            counters: StatsSnapshot::default(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("pending_drop").is_none());
        assert_eq!(json["retention"]["retain_periods"], 30);
    }
}
