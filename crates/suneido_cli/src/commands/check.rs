//! Check command implementation.

use std::path::Path;
use suneido_core::tools::{check_file, CheckStatus};
use suneido_core::Config;

/// Runs the check command.
///
/// Fails unless the database checks out completely.
pub fn run(path: &Path, workers: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::default();
    if let Some(n) = workers {
        config = config.check_workers(n);
    }

    println!("Checking database at {}", path.display());
    println!();

    let report = check_file(path, &config)?;
    println!("  Size:            {} bytes", report.size);
    println!("  Commits:         {}", report.scan.commits);
    println!("  Data blocks:     {}", report.scan.data_blocks);
    println!(
        "  Clean shutdown:  {}",
        if report.scan.clean_shutdown { "yes" } else { "no" }
    );
    println!("  Tables checked:  {}", report.tables.len());
    if report.skipped > 0 {
        println!("  Tables skipped:  {}", report.skipped);
    }

    for table in report.tables.iter().filter(|t| !t.errors.is_empty()) {
        println!();
        println!("  {}:", table.table);
        for err in &table.errors {
            println!("    {err}");
        }
    }

    println!();
    match report.status {
        CheckStatus::Ok => {
            println!("✓ Database check passed");
            Ok(())
        }
        status => {
            if let Some(problem) = report.problem() {
                println!("Problem: {problem}");
            }
            println!("✗ Database check failed: {status}");
            Err(format!("database is {status}").into())
        }
    }
}
