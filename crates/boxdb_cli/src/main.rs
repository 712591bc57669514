//! boxdb CLI
//!
//! Command-line tools for boxdb store directories.
//!
//! # Commands
//!
//! - `inspect` - Display store metadata, schema and object counts
//! - `verify` - Verify WAL and data file integrity
//! - `dump-wal` - Dump WAL records for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// boxdb command-line store tools.
#[derive(Parser)]
#[command(name = "boxdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Display store metadata, schema and object counts
    Inspect {
        /// List the properties of every entity
        #[arg(short, long)]
        schema: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify store integrity
    Verify {
        /// Check WAL records
        #[arg(short, long)]
        wal: bool,

        /// Check data file records
        #[arg(short, long)]
        data: bool,
    },

    /// Dump WAL records for debugging
    DumpWal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip records before this file offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = cli.path.ok_or("store path required (--path)")?;
    match cli.command {
        Commands::Inspect { schema, format } => {
            commands::inspect::run(&path, schema, &format)?;
        }
        Commands::Verify { wal, data } => {
            let all = !wal && !data;
            commands::verify::run(&path, wal || all, data || all)?;
        }
        Commands::DumpWal {
            limit,
            offset,
            format,
        } => {
            commands::dump_wal::run(&path, limit, offset, &format)?;
        }
    }

    Ok(())
}
