//! Rebuild command implementation.

use std::path::Path;
use suneido_core::tools::rebuild_file;
use suneido_core::Config;

/// Runs the rebuild command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Rebuilding database at {}", path.display());
    let report = rebuild_file(path, &Config::default())?;
    println!();
    println!("  Commits replayed: {}", report.commits);
    println!("  Rows copied:      {}", report.rows);
    println!("  Tables:           {}", report.tables);
    if report.orphans > 0 {
        println!("  Orphaned rows:    {}", report.orphans);
    }
    if report.discarded > 0 {
        println!(
            "  Discarded:        {} bytes after offset {}",
            report.discarded, report.trusted_end
        );
    }
    println!();
    println!("✓ Rebuild complete (previous file kept with .bak suffix)");
    Ok(())
}
