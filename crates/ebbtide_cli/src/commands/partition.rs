//! Add-partition and drop-oldest command implementations.

use super::open_existing;
use ebbtide_core::{AdminOutcome, LifecycleError};
use ebbtide_storage::{PartitionKey, Row};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// A row key in a rows file: epoch seconds or a date string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeyField {
    Seconds(i64),
    Text(String),
}

/// One line of a rows file.
#[derive(Debug, Deserialize)]
struct RowLine {
    key: KeyField,
    #[serde(default)]
    payload: String,
}

/// Parses a JSON-lines rows file. Blank lines are skipped.
pub fn parse_rows(text: &str) -> Result<Vec<Row>, Box<dyn std::error::Error>> {
    let mut rows = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: RowLine = serde_json::from_str(line)
            .map_err(|e| format!("line {}: {}", number + 1, e))?;
        let key = match parsed.key {
            KeyField::Seconds(secs) => PartitionKey::new(secs),
            KeyField::Text(text) => {
                PartitionKey::parse(&text).map_err(|e| format!("line {}: {}", number + 1, e))?
            }
        };
        rows.push(Row::new(key, parsed.payload.into_bytes()));
    }
    Ok(rows)
}

/// Runs the add-partition command.
pub fn add(path: &Path, key: &str, rows: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let boundary = PartitionKey::parse(key)?;
    info!("Adding partition at {} to {:?}", boundary, path);
    let table = open_existing(path)?;

    match rows {
        Some(rows_path) => {
            let rows = parse_rows(&fs::read_to_string(rows_path)?)?;
            match table.add_partition_with_rows(boundary, &rows) {
                Ok(added) => println!(
                    "✓ Added {} at {} in {} ({} rows)",
                    added.partition, added.boundary, added.tier, added.rows
                ),
                Err(e) => {
                    // A kept staging area cannot outlive this process: the
                    // next open sweeps it.
                    if let Some(staging) = e.kept_staging() {
                        match table.discard_staging(staging) {
                            Ok(()) => println!("Discarded staging area {}", staging),
                            Err(discard) => {
                                warn!("Could not discard staging area {}: {}", staging, discard)
                            }
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        None => match table.add_partition(boundary)? {
            AdminOutcome::Applied(added) => println!(
                "✓ Added {} at {} in {}",
                added.partition, added.boundary, added.tier
            ),
            AdminOutcome::AlreadySatisfied => {
                println!("Boundary {} already exists - nothing to do", boundary);
            }
        },
    }
    Ok(())
}

/// Runs the drop-oldest command.
pub fn drop_oldest(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Dropping oldest partition of {:?}", path);
    let table = open_existing(path)?;

    match table.drop_oldest_partition() {
        Ok(AdminOutcome::Applied(dropped)) => {
            println!(
                "✓ Dropped {} {} ({} rows archived)",
                dropped.partition, dropped.range, dropped.rows
            );
            if dropped.resumed {
                println!("  Completed a previously interrupted drop");
            }
        }
        Ok(AdminOutcome::AlreadySatisfied) => {
            println!("Only one partition left - nothing to drop");
        }
        Err(e @ LifecycleError::PartialMigration { .. }) => {
            warn!("Drop left pending: {}", e);
            println!("✗ Drop stopped after switch-out; run drop-oldest again to finish it");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
