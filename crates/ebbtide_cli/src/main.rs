//! Ebbtide CLI
//!
//! Administrative tools for time-partitioned tables.
//!
//! # Commands
//!
//! - `init` - Create a table directory
//! - `add-partition` - Add a partition above a boundary
//! - `drop-oldest` - Archive and remove the oldest partition
//! - `stats` - Display partitions and lifecycle counters
//! - `set-policy` - Replace the retention policy
//! - `run-cycle` - Run one retention cycle

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Ebbtide partition lifecycle tools.
#[derive(Parser)]
#[command(name = "ebbtide")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the table directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a table directory with a single unbounded partition
    Init,

    /// Add a partition whose lower boundary is KEY
    AddPartition {
        /// Boundary key (YYYY-MM-DD, RFC 3339, or epoch seconds)
        key: String,

        /// JSON-lines file of rows to switch in
        #[arg(short, long)]
        rows: Option<PathBuf>,
    },

    /// Archive the oldest partition and merge its boundary away
    DropOldest,

    /// Display partitions and lifecycle counters
    Stats {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Replace the retention policy
    SetPolicy {
        /// Periods of history to keep
        #[arg(long)]
        retain: u32,

        /// Periods of future partitions to pre-create
        #[arg(long)]
        lookahead: u32,

        /// Period length (seconds, or with suffix s, m, h, d, w)
        #[arg(long, default_value = "1d")]
        period: String,
    },

    /// Run one retention cycle
    RunCycle {
        /// Time to evaluate the policy at (defaults to the current time)
        #[arg(short, long)]
        now: Option<String>,

        /// Show what would be done without changing the table
        #[arg(short, long)]
        dry_run: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init => {
            let path = cli.path.ok_or("Table path required for init")?;
            commands::init::run(&path)?;
        }
        Commands::AddPartition { key, rows } => {
            let path = cli.path.ok_or("Table path required for add-partition")?;
            commands::partition::add(&path, &key, rows.as_deref())?;
        }
        Commands::DropOldest => {
            let path = cli.path.ok_or("Table path required for drop-oldest")?;
            commands::partition::drop_oldest(&path)?;
        }
        Commands::Stats { format } => {
            let path = cli.path.ok_or("Table path required for stats")?;
            commands::stats::run(&path, &format)?;
        }
        Commands::SetPolicy {
            retain,
            lookahead,
            period,
        } => {
            let path = cli.path.ok_or("Table path required for set-policy")?;
            commands::policy::run(&path, retain, lookahead, &period)?;
        }
        Commands::RunCycle {
            now,
            dry_run,
            format,
        } => {
            let path = cli.path.ok_or("Table path required for run-cycle")?;
            commands::cycle::run(&path, now.as_deref(), dry_run, &format)?;
        }
        Commands::Version => {
            println!("Ebbtide CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Ebbtide Core v{}", ebbtide_core::VERSION);
        }
    }

    Ok(())
}
