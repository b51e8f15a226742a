//! CLI command implementations.

pub mod cycle;
pub mod init;
pub mod partition;
pub mod policy;
pub mod stats;

use ebbtide_core::{PartitionedTable, TableConfig};
use std::path::Path;

/// Opens an existing table.
pub fn open_existing(path: &Path) -> Result<PartitionedTable, Box<dyn std::error::Error>> {
    if !path.join("MANIFEST").exists() {
        return Err(format!("No table found at {:?} (run `ebbtide init` first)", path).into());
    }
    let config = TableConfig::default().create_if_missing(false);
    Ok(PartitionedTable::open(path, config)?)
}
