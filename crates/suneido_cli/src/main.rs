//! Suneido database CLI
//!
//! Command-line tools for Suneido database files.
//!
//! # Commands
//!
//! - `check` - Verify checksums and indexes, exit status 0 only if intact
//! - `rebuild` - Recover a damaged database from its last good commit
//! - `compact` - Copy live data into a fresh file
//! - `dump` - Write tables to a portable dump
//! - `load` - Read tables from a dump
//! - `inspect` - Display tables, sizes and log statistics

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Suneido database maintenance tools.
#[derive(Parser)]
#[command(name = "suneido-db")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify database integrity
    Check {
        /// Database file
        file: PathBuf,

        /// Worker threads for index checks
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Rebuild a damaged database, keeping the original as .bak
    Rebuild {
        /// Database file
        file: PathBuf,
    },

    /// Compact a database, keeping the original as .bak
    Compact {
        /// Database file
        file: PathBuf,
    },

    /// Dump the database or one table
    Dump {
        /// Database file
        file: PathBuf,

        /// Dump only this table
        #[arg(short, long)]
        table: Option<String>,

        /// Output file, `-` for stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load a dump, replacing tables of the same name
    Load {
        /// Database file, created if missing
        file: PathBuf,

        /// Dump file
        dump: PathBuf,

        /// Require the dump to hold a single table
        #[arg(long)]
        table: bool,
    },

    /// Display tables, sizes and log statistics
    Inspect {
        /// Show index details
        #[arg(short, long)]
        indexes: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Database file
        file: PathBuf,
    },

    /// Show version information
    Version,
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Check { file, workers } => commands::check::run(&file, workers),
        Commands::Rebuild { file } => commands::rebuild::run(&file),
        Commands::Compact { file } => commands::compact::run(&file),
        Commands::Dump {
            file,
            table,
            output,
        } => commands::dump::run(&file, table.as_deref(), output.as_deref()),
        Commands::Load { file, dump, table } => commands::load::run(&file, &dump, table),
        Commands::Inspect {
            indexes,
            format,
            file,
        } => commands::inspect::run(&file, indexes, &format),
        Commands::Version => {
            println!("suneido-db v{}", env!("CARGO_PKG_VERSION"));
            println!("suneido_core v{}", suneido_core::VERSION);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
