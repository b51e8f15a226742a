//! Init command implementation.

use ebbtide_core::{PartitionedTable, TableConfig};
use std::path::Path;
use tracing::info;

/// Runs the init command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.join("MANIFEST").exists() {
        return Err(format!("Table already exists at {:?}", path).into());
    }

    info!("Creating table at {:?}", path);
    let table = PartitionedTable::open(path, TableConfig::default())?;
    let policy = table.retention_policy();

    println!("Created table at {:?}", path);
    println!("  Partitions: {}", table.partition_stats().len());
    println!(
        "  Retention:  {} periods back, {} ahead, {}s per period",
        policy.retain_periods,
        policy.lookahead_periods,
        policy.period_length.as_secs()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_creates_manifest_once() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events");

        run(&path).unwrap();
        assert!(path.join("MANIFEST").exists());
        assert!(run(&path).is_err());
    }
}
