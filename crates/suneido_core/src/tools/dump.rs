//! Dump and load.
//!
//! A dump is a text header line followed by one section per table:
//!
//! ```text
//! Suneido dump
//! ====== customers (id,name,-,city) key(id) index(city)
//! <u32 LE length><record bytes> ... <u32 0>
//! ====== views (view_name,view_definition) key(view_name)
//! ...
//! ```
//!
//! Records are written exactly as stored, so field positions survive and
//! `-` placeholders in the schema keep unused positions.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::schema::views_row;
use bytes::Bytes;
use std::io::{BufRead, Read, Write};
use tracing::{debug, info};

/// First line of every dump.
pub const DUMP_HEADER: &str = "Suneido dump";

/// Name of the section holding view definitions.
pub const VIEWS_SECTION: &str = "views";

const SECTION_PREFIX: &str = "====== ";
const VIEWS_SCHEMA: &str = "(view_name,view_definition) key(view_name)";

/// Counts from a dump or load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    /// Tables written or read, the views section included.
    pub tables: usize,
    /// Rows written or read.
    pub rows: usize,
}

/// Dumps every user table and the views.
///
/// # Errors
///
/// Returns an error if reading the database or writing `out` fails.
pub fn dump_database<W: Write>(db: &Database, mut out: W) -> CoreResult<DumpStats> {
    let mut stats = DumpStats::default();
    let mut t = db.readonly_tran()?;
    writeln!(out, "{DUMP_HEADER}")?;
    let schema = t.schema().clone();
    for table in schema.user_tables() {
        let rows = t.records(&table.name)?;
        write_section(&mut out, &table.name, &table.schema(), rows.iter().map(|(_, r)| r))?;
        stats.tables += 1;
        stats.rows += rows.len();
    }
    let views: Vec<Record> = schema.views().map(|(n, d)| views_row(n, d)).collect();
    if !views.is_empty() {
        write_section(&mut out, VIEWS_SECTION, VIEWS_SCHEMA, views.iter())?;
        stats.tables += 1;
        stats.rows += views.len();
    }
    t.complete()?;
    out.flush()?;
    info!(tables = stats.tables, rows = stats.rows, "dumped database");
    Ok(stats)
}

/// Dumps one table.
///
/// # Errors
///
/// Returns `NotFound` for an unknown table, or an I/O error.
pub fn dump_table<W: Write>(db: &Database, table: &str, mut out: W) -> CoreResult<usize> {
    let mut t = db.readonly_tran()?;
    let def = t.table(table)?;
    let rows = t.records(table)?;
    writeln!(out, "{DUMP_HEADER}")?;
    write_section(&mut out, &def.name, &def.schema(), rows.iter().map(|(_, r)| r))?;
    t.complete()?;
    out.flush()?;
    info!(table, rows = rows.len(), "dumped table");
    Ok(rows.len())
}

fn write_section<'a, W: Write>(
    out: &mut W,
    name: &str,
    schema: &str,
    rows: impl Iterator<Item = &'a Record>,
) -> CoreResult<()> {
    writeln!(out, "{SECTION_PREFIX}{name} {schema}")?;
    for rec in rows {
        let len = u32::try_from(rec.size())
            .map_err(|_| CoreError::invalid_operation("record too large to dump"))?;
        out.write_all(&len.to_le_bytes())?;
        out.write_all(rec.as_bytes())?;
    }
    out.write_all(&0u32.to_le_bytes())?;
    Ok(())
}

/// Loads every section of a dump, replacing tables of the same name.
///
/// # Errors
///
/// Returns `InvalidFormat` for a malformed dump, or any error from the
/// transactions that apply it.
pub fn load_database<R: BufRead>(db: &Database, mut input: R) -> CoreResult<DumpStats> {
    read_header(&mut input)?;
    let mut stats = DumpStats::default();
    while let Some((name, schema)) = read_section_header(&mut input)? {
        stats.rows += load_section(db, &name, &schema, &mut input)?;
        stats.tables += 1;
    }
    info!(tables = stats.tables, rows = stats.rows, "loaded database");
    Ok(stats)
}

/// Loads a single-table dump and returns the number of rows.
///
/// # Errors
///
/// Returns `InvalidFormat` if the dump does not hold exactly one section.
pub fn load_table<R: BufRead>(db: &Database, mut input: R) -> CoreResult<usize> {
    read_header(&mut input)?;
    let (name, schema) = read_section_header(&mut input)?
        .ok_or_else(|| CoreError::invalid_format("dump has no table"))?;
    let n = load_section(db, &name, &schema, &mut input)?;
    if read_section_header(&mut input)?.is_some() {
        return Err(CoreError::invalid_format("dump holds more than one table"));
    }
    info!(table = %name, rows = n, "loaded table");
    Ok(n)
}

fn read_header<R: BufRead>(input: &mut R) -> CoreResult<()> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    if line.trim_end() != DUMP_HEADER {
        return Err(CoreError::invalid_format("missing dump header"));
    }
    Ok(())
}

fn read_section_header<R: BufRead>(input: &mut R) -> CoreResult<Option<(String, String)>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let rest = line
        .trim_end()
        .strip_prefix(SECTION_PREFIX)
        .ok_or_else(|| CoreError::invalid_format(format!("bad section header {line:?}")))?;
    let (name, schema) = rest
        .split_once(' ')
        .ok_or_else(|| CoreError::invalid_format(format!("section {rest:?} has no schema")))?;
    Ok(Some((name.to_string(), schema.trim().to_string())))
}

fn read_record<R: BufRead>(input: &mut R) -> CoreResult<Option<Record>> {
    let mut len = [0u8; 4];
    input.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut buf = Vec::new();
    input.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(CoreError::invalid_format(format!(
            "record of {len} bytes cut off after {}",
            buf.len()
        )));
    }
    Record::from_bytes(Bytes::from(buf)).map(Some)
}

fn load_section<R: BufRead>(db: &Database, name: &str, schema: &str, input: &mut R) -> CoreResult<usize> {
    if name == VIEWS_SECTION {
        let mut views = Vec::new();
        while let Some(rec) = read_record(input)? {
            views.push((rec.get_string(0)?, rec.get_string(1)?));
        }
        db.transaction(|t| {
            for (view, def) in &views {
                if t.schema().view(view).is_some() {
                    t.drop_view(view)?;
                }
                t.add_view(view, def)?;
            }
            Ok(())
        })?;
        return Ok(views.len());
    }

    db.transaction(|t| {
        if t.schema().get(name).is_some() {
            t.drop_table(name)?;
        }
        t.create_table(name, schema).map(|_| ())
    })?;
    let mut t = db.bulk_transaction()?;
    let mut n = 0;
    while let Some(rec) = read_record(input)? {
        t.add_record(name, rec)?;
        n += 1;
    }
    t.commit()?;
    debug!(table = name, rows = n, "loaded section");
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;
    use crate::schema::IndexMode;
    use std::io::Cursor;

    fn source() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|t| {
            t.create_table("stock", "(sku,qty,note) key(sku) index(qty)")?;
            for i in 0..25 {
                t.add_record(
                    "stock",
                    RecordBuilder::new().string(&format!("s{i:02}")).int(i * 3).build(),
                )?;
            }
            t.create_table("empty", "(a) key(a)")?;
            t.add_view("low", "stock where qty < 10")?;
            Ok(())
        })
        .unwrap();
        db.transaction(|t| {
            t.drop_column("stock", "note")?;
            t.add_index("stock", "sku,qty", IndexMode::Unique)
        })
        .unwrap();
        db
    }

    #[test]
    fn dump_then_load_preserves_rows() {
        let src = source();
        let mut buf = Vec::new();
        let stats = dump_database(&src, &mut buf).unwrap();
        assert_eq!(stats.tables, 3);
        assert_eq!(stats.rows, 26);
        assert!(buf.starts_with(b"Suneido dump\n====== "));

        let dst = Database::open_in_memory().unwrap();
        let loaded = load_database(&dst, Cursor::new(&buf)).unwrap();
        assert_eq!(loaded, stats);

        let (a, b) = (src.schema(), dst.schema());
        assert_eq!(
            a.require("stock").unwrap().schema(),
            b.require("stock").unwrap().schema()
        );
        assert_eq!(b.view("low"), Some("stock where qty < 10"));
        let before = src.read(|t| t.records("stock")).unwrap();
        let after = dst.read(|t| t.records("stock")).unwrap();
        let recs = |v: Vec<(crate::types::Address, Record)>| v.into_iter().map(|(_, r)| r).collect::<Vec<_>>();
        assert_eq!(recs(before), recs(after));
        assert_eq!(dst.check().status, crate::tools::CheckStatus::Ok);
    }

    #[test]
    fn load_table_replaces_existing() {
        let src = source();
        let mut buf = Vec::new();
        assert_eq!(dump_table(&src, "stock", &mut buf).unwrap(), 25);

        let dst = Database::open_in_memory().unwrap();
        dst.transaction(|t| {
            t.create_table("stock", "(other) key(other)")?;
            t.add_record("stock", RecordBuilder::new().int(1).build())?;
            Ok(())
        })
        .unwrap();
        assert_eq!(load_table(&dst, Cursor::new(&buf)).unwrap(), 25);
        assert_eq!(dst.read(|t| t.records("stock")).unwrap().len(), 25);
        assert!(dst.schema().require("stock").unwrap().field("sku").is_some());
    }

    #[test]
    fn bad_header_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let err = load_database(&db, Cursor::new(b"not a dump\n".to_vec())).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
    }

    #[test]
    fn truncated_section_is_an_error() {
        let src = source();
        let mut buf = Vec::new();
        dump_table(&src, "stock", &mut buf).unwrap();
        buf.truncate(buf.len() - 10);
        let dst = Database::open_in_memory().unwrap();
        assert!(load_table(&dst, Cursor::new(&buf)).is_err());
    }

    #[test]
    fn oversized_record_length_is_an_error() {
        let src = source();
        let mut buf = Vec::new();
        assert_eq!(dump_table(&src, "empty", &mut buf).unwrap(), 0);
        assert!(buf.ends_with(&[0, 0, 0, 0]));
        buf.truncate(buf.len() - 4);
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        buf.extend_from_slice(b"short");

        let dst = Database::open_in_memory().unwrap();
        let err = load_table(&dst, Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
    }
}
