//! Inspect command implementation.

use serde::Serialize;
use std::path::Path;
use suneido_core::tools::scan;
use suneido_core::Database;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Number of commits in the log.
    pub commits: usize,
    /// Number of data blocks in the log.
    pub data_blocks: usize,
    /// Whether the last session ended cleanly.
    pub clean_shutdown: bool,
    /// Live bytes over all user tables.
    pub live_size: u64,
    /// User tables.
    pub tables: Vec<TableSummary>,
    /// View names.
    pub views: Vec<String>,
}

/// Summary of one table.
#[derive(Debug, Serialize)]
pub struct TableSummary {
    /// Table number.
    pub num: u32,
    /// Table name.
    pub name: String,
    /// Schema text.
    pub schema: String,
    /// Live rows.
    pub rows: u64,
    /// Live bytes.
    pub size: u64,
    /// Indexes.
    pub indexes: Vec<IndexSummary>,
}

/// Summary of one index.
#[derive(Debug, Serialize)]
pub struct IndexSummary {
    /// Comma-separated columns.
    pub columns: String,
    /// Tree levels above the leaves.
    pub levels: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_indexes: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {}", path.display()).into());
    }
    let db = Database::open_read_only(path)?;
    let scanned = scan(db.storage());

    let mut result = InspectResult {
        path: path.display().to_string(),
        size: db.storage().size(),
        commits: scanned.commits,
        data_blocks: scanned.data_blocks,
        clean_shutdown: scanned.clean_shutdown,
        live_size: 0,
        tables: Vec::new(),
        views: db.schema().views().map(|(name, _)| name.to_string()).collect(),
    };

    let t = db.readonly_tran()?;
    let schema = t.schema().clone();
    for table in schema.user_tables() {
        let info = t.table_info(&table.name)?;
        result.live_size += info.total_size;
        result.tables.push(TableSummary {
            num: table.num,
            name: table.name.clone(),
            schema: table.schema(),
            rows: info.nrows,
            size: info.total_size,
            indexes: info
                .indexes
                .iter()
                .map(|ix| IndexSummary {
                    columns: ix.columns.clone(),
                    levels: ix.levels,
                })
                .collect(),
        });
    }
    t.complete()?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result, show_indexes),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult, show_indexes: bool) {
    println!("Suneido Database Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    println!("  File size:      {}", format_size(result.size));
    println!("  Live data:      {}", format_size(result.live_size));
    println!("  Commits:        {}", result.commits);
    println!("  Data blocks:    {}", result.data_blocks);
    println!(
        "  Clean shutdown: {}",
        if result.clean_shutdown { "yes" } else { "no" }
    );
    println!();
    println!("Tables:");
    for table in &result.tables {
        println!(
            "  [{}] {} {} rows, {}",
            table.num,
            table.name,
            table.rows,
            format_size(table.size)
        );
        println!("      {}", table.schema);
        if show_indexes {
            for ix in &table.indexes {
                println!("      ({}) {} levels", ix.columns, ix.levels);
            }
        }
    }
    if !result.views.is_empty() {
        println!();
        println!("Views: {}", result.views.join(", "));
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
