//! Load command implementation.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use suneido_core::tools::{load_database, load_table};
use suneido_core::{Config, Database, OpenMode};

/// Runs the load command.
///
/// The database is created if it does not exist. With `single_table` the
/// dump must hold exactly one table.
pub fn run(path: &Path, dump: &Path, single_table: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mode = if path.exists() {
        OpenMode::Open
    } else {
        OpenMode::Create
    };
    let db = Database::open_with_config(path, Config::default().mode(mode))?;
    let input = BufReader::new(File::open(dump)?);

    if single_table {
        let rows = load_table(&db, input)?;
        println!("Loaded {rows} rows from {}", dump.display());
    } else {
        let stats = load_database(&db, input)?;
        println!(
            "Loaded {} tables, {} rows from {}",
            stats.tables,
            stats.rows,
            dump.display()
        );
    }
    db.close()?;
    Ok(())
}
