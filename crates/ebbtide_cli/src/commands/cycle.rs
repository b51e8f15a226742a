//! Run-cycle command implementation.

use super::open_existing;
use chrono::Utc;
use ebbtide_core::{CycleOutcome, CyclePlan, CycleReport};
use ebbtide_storage::PartitionKey;
use std::path::Path;
use tracing::{info, warn};

/// Runs the run-cycle command.
pub fn run(
    path: &Path,
    now: Option<&str>,
    dry_run: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let now = match now {
        Some(text) => PartitionKey::parse(text)?,
        None => PartitionKey::from_datetime(Utc::now()),
    };
    info!("Running retention cycle for {:?} at {}", path, now);
    let table = open_existing(path)?;

    if dry_run {
        let plan = table.plan_retention_cycle(now)?;
        match format {
            "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
            _ => print_plan(now, &plan),
        }
        return Ok(());
    }

    let outcome = table.run_retention_cycle(now)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&outcome)?),
        _ => match &outcome {
            CycleOutcome::Skipped => {
                warn!("Retention cycle skipped: another cycle holds the table");
                println!("Another cycle is in flight - skipped")
            }
            CycleOutcome::Completed(report) => print_report(now, report),
        },
    }
    Ok(())
}

fn print_window(required_oldest: Option<PartitionKey>, required_newest: Option<PartitionKey>) {
    if let (Some(oldest), Some(newest)) = (required_oldest, required_newest) {
        println!("  Required window: {} .. {}", oldest, newest);
    }
}

fn print_plan(now: PartitionKey, plan: &CyclePlan) {
    println!("Retention plan at {}", now);
    println!("(dry run - no changes will be made)");
    print_window(plan.required_oldest, plan.required_newest);
    println!();

    if plan.is_empty() {
        println!("Nothing to do - window already satisfies the policy");
        return;
    }
    for boundary in &plan.adds {
        println!("  + add boundary {}", boundary);
    }
    for boundary in &plan.drops {
        println!("  - drop boundary {}", boundary);
    }
}

fn print_report(now: PartitionKey, report: &CycleReport) {
    println!("Retention cycle at {}", now);
    print_window(report.required_oldest, report.required_newest);
    println!();

    for added in &report.added {
        println!("  + {} at {}", added.partition, added.boundary);
    }
    for dropped in &report.dropped {
        println!(
            "  - {} {} ({} rows archived)",
            dropped.partition, dropped.range, dropped.rows
        );
    }
    for change in &report.compression_changes {
        println!("  ~ {} compression {} -> {}", change.partition, change.from, change.to);
    }
    for change in &report.tier_changes {
        println!("  ~ {} tier {} -> {}", change.partition, change.from, change.to);
    }
    println!();
    println!(
        "✓ {} added, {} dropped",
        report.added.len(),
        report.dropped.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dry_run_then_run() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");
        super::super::init::run(&path).unwrap();

        run(&path, Some("2024-05-01T06:00:00Z"), true, "text").unwrap();
        run(&path, Some("2024-05-01T06:00:00Z"), false, "json").unwrap();
        run(&path, Some("2024-05-01T06:00:00Z"), true, "json").unwrap();
    }

    #[test]
    fn bad_now_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");
        super::super::init::run(&path).unwrap();
        assert!(run(&path, Some("yesterday"), true, "text").is_err());
    }
}
