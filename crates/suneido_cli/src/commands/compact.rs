//! Compact command implementation.

use std::path::Path;
use suneido_core::tools::compact_file;
use suneido_core::Config;

/// Runs the compact command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting database at {}", path.display());
    let report = compact_file(path, &Config::default())?;
    let saved = report.before.saturating_sub(report.after);
    println!();
    println!("  Tables:      {}", report.tables);
    println!("  Rows:        {}", report.rows);
    println!("  Size before: {} bytes", report.before);
    println!("  Size after:  {} bytes", report.after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        saved,
        if report.before > 0 {
            saved as f64 / report.before as f64 * 100.0
        } else {
            0.0
        }
    );
    println!();
    println!("✓ Compaction complete (previous file kept with .bak suffix)");
    Ok(())
}
