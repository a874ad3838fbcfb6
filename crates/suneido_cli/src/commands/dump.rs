//! Dump command implementation.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use suneido_core::tools::{dump_database, dump_table};
use suneido_core::Database;

/// Runs the dump command.
///
/// Writes to `output`, or to `<table>.su` or `database.su` in the current
/// directory when no output is given. An output of `-` writes to stdout.
pub fn run(
    path: &Path,
    table: Option<&str>,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open_read_only(path)?;
    let default_name = match table {
        Some(t) => format!("{t}.su"),
        None => "database.su".to_string(),
    };
    let target = output.map_or_else(|| Path::new(&default_name).to_path_buf(), Path::to_path_buf);
    let mut out: Box<dyn Write> = if target.as_os_str() == "-" {
        Box::new(BufWriter::new(io::stdout().lock()))
    } else {
        Box::new(BufWriter::new(File::create(&target)?))
    };

    match table {
        Some(t) => {
            let rows = dump_table(&db, t, &mut out)?;
            eprintln!("Dumped {rows} rows from {t} to {}", target.display());
        }
        None => {
            let stats = dump_database(&db, &mut out)?;
            eprintln!(
                "Dumped {} tables, {} rows to {}",
                stats.tables,
                stats.rows,
                target.display()
            );
        }
    }
    out.flush()?;
    db.close()?;
    Ok(())
}
