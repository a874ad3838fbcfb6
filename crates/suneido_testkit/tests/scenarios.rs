//! End-to-end scenarios over database files: damage, recovery, compaction,
//! concurrency and dump/load.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use suneido_core::dbfile::backup_path;
use suneido_core::storage::BLOCK_HEADER_SIZE;
use suneido_core::tools::{
    check_file, compact_file, dump_database, load_database, rebuild_file, CheckStatus,
};
use suneido_core::{Config, ConflictKind, CoreError, Database, OpenMode, RecordBuilder};
use suneido_testkit::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn row_count(db: &Database, table: &str) -> usize {
    db.read(|t| t.records(table)).unwrap().len()
}

#[test]
fn corrupted_block_is_detected_and_rebuilt() {
    init_tracing();
    let test_db = TestDatabase::file();
    scenarios::customers(&test_db, 50);
    scenarios::add_customers(&test_db, 50, 10);
    let (_dir, path) = test_db.into_closed();

    let adr = last_data_block(&path).unwrap().unwrap();
    flip_byte(&path, adr.0 + BLOCK_HEADER_SIZE + 6).unwrap();

    let report = check_file(&path, &Config::default()).unwrap();
    assert_eq!(report.status, CheckStatus::Corrupted);
    assert!(report.problem().is_some());

    let rebuilt = rebuild_file(&path, &Config::default()).unwrap();
    assert!(rebuilt.discarded > 0);
    assert!(backup_path(&path).exists());
    assert_eq!(check_file(&path, &Config::default()).unwrap().status, CheckStatus::Ok);

    let db = Database::open(&path).unwrap();
    assert_eq!(row_count(&db, "customers"), 59);
    let first = db.read(|t| t.lookup("customers", "id", &RecordBuilder::new().int(0).build()));
    assert!(first.unwrap().is_some());
}

#[test]
fn damaged_commit_checksum_rebuilds_every_index() {
    init_tracing();
    let test_db = TestDatabase::file();
    scenarios::customers(&test_db, 40);
    scenarios::add_customers(&test_db, 40, 5);
    let (_dir, path) = test_db.into_closed();

    let commit = last_commit_block(&path).unwrap().unwrap();
    flip_byte(&path, commit.adr.0 + commit.size() - 4).unwrap();

    let report = check_file(&path, &Config::default()).unwrap();
    assert_eq!(report.status, CheckStatus::Corrupted);
    assert!(report.problem().unwrap().contains("checksum"));

    let rebuilt = rebuild_file(&path, &Config::default()).unwrap();
    assert!(rebuilt.discarded > 0);
    assert_eq!(check_file(&path, &Config::default()).unwrap().status, CheckStatus::Ok);

    let db = Database::open(&path).unwrap();
    let rows = db.read(|t| t.records("customers")).unwrap();
    assert_eq!(rows.len(), 44);
    db.read(|t| {
        for (adr, rec) in &rows {
            let id = RecordBuilder::new().int(rec.get_int(0)?).build();
            assert_eq!(t.lookup("customers", "id", &id)?.map(|(a, _)| a), Some(*adr));
            for columns in ["name", "city,id"] {
                let index = t.get_btree_index("customers", columns)?;
                let key = index.key_of(rec);
                let found = index
                    .equal(&key)
                    .map(|k| k.map(|k| k.adr))
                    .collect::<Result<Vec<_>, _>>()?;
                assert!(found.contains(adr), "{columns} misses row {adr}");
            }
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(db.check().status, CheckStatus::Ok);
}

#[test]
fn compaction_after_deleting_half() {
    init_tracing();
    let test_db = TestDatabase::file();
    scenarios::customers(&test_db, 1000);
    test_db
        .transaction(|t| {
            for (adr, rec) in t.records("customers")? {
                if rec.get_int(0)? % 2 == 0 {
                    t.remove_record("customers", adr)?;
                }
            }
            Ok(())
        })
        .unwrap();
    let (_dir, path) = test_db.into_closed();

    let report = compact_file(&path, &Config::default()).unwrap();
    assert_eq!(report.tables, 1);
    assert_eq!(report.rows, 500);
    assert!(report.after < report.before);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.check().status, CheckStatus::Ok);
    let rows = db.read(|t| t.records("customers")).unwrap();
    assert_eq!(rows.len(), 500);
    assert!(rows.iter().all(|(_, r)| r.get_int(0).unwrap() % 2 == 1));
    let info = db.read(|t| t.table_info("customers")).unwrap();
    assert_eq!(info.nrows, 500);
}

#[test]
fn concurrent_duplicate_keys_conflict() {
    let test_db = TestDatabase::memory();
    scenarios::customers(&test_db, 5);

    let mut a = test_db.update_transaction().unwrap();
    let mut b = test_db.update_transaction().unwrap();
    a.add_record("customers", scenarios::customer(100)).unwrap();
    b.add_record("customers", scenarios::customer(100)).unwrap();
    a.commit().unwrap();

    match b.commit() {
        Err(CoreError::Conflict {
            kind: ConflictKind::DuplicateKey { table, .. },
        }) => assert_eq!(table, "customers"),
        other => panic!("expected a duplicate key conflict, got {other:?}"),
    }
    assert_eq!(row_count(&test_db, "customers"), 6);
}

#[test]
fn crash_without_damage_opens_without_rebuild() {
    init_tracing();
    let test_db = TestDatabase::file();
    scenarios::customers(&test_db, 20);
    let copy = test_db.dir().unwrap().join("crashed.db");
    crash_copy(&test_db, &copy).unwrap();

    let report = check_file(&copy, &Config::default()).unwrap();
    assert_eq!(report.status, CheckStatus::Corrupted);
    assert!(report.problem().unwrap().contains("shutdown"));

    let db = Database::open(&copy).unwrap();
    assert_eq!(row_count(&db, "customers"), 20);
    assert!(!backup_path(&copy).exists());
    assert_eq!(db.check().status, CheckStatus::Ok);
}

#[test]
fn crash_with_uncommitted_tail_is_rebuilt_on_open() {
    init_tracing();
    let test_db = TestDatabase::file();
    scenarios::customers(&test_db, 20);
    let copy = test_db.dir().unwrap().join("crashed.db");
    crash_copy(&test_db, &copy).unwrap();
    let num = test_db.schema().require("customers").unwrap().num;
    append_uncommitted(&copy, num, &scenarios::customer(999)).unwrap();

    let refused = Database::open_with_config(&copy, Config::default().auto_rebuild(false));
    assert!(matches!(refused, Err(CoreError::Corrupted { .. })));

    let db = Database::open(&copy).unwrap();
    assert!(backup_path(&copy).exists());
    assert_eq!(row_count(&db, "customers"), 20);
    assert_eq!(db.check().status, CheckStatus::Ok);
}

#[test]
fn torn_shutdown_marker_is_recovered() {
    init_tracing();
    let test_db = TestDatabase::file();
    scenarios::customers(&test_db, 10);
    let (_dir, path) = test_db.into_closed();
    truncate_by(&path, 16).unwrap();

    assert_eq!(
        check_file(&path, &Config::default()).unwrap().status,
        CheckStatus::Corrupted
    );
    let db = Database::open(&path).unwrap();
    assert_eq!(row_count(&db, "customers"), 10);
}

#[test]
fn header_only_file_is_unrecoverable() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("empty.db");
    std::fs::write(&path, b"SUNEIDB1").unwrap();
    let report = check_file(&path, &Config::default()).unwrap();
    assert_eq!(report.status, CheckStatus::Unrecoverable);
    assert!(rebuild_file(&path, &Config::default()).is_err());
}

#[test]
fn dump_and_load_between_files() {
    init_tracing();
    let src = TestDatabase::file();
    scenarios::customers(&src, 200);
    scenarios::many_tables(&src, 3, 10);
    src.transaction(|t| t.add_view("west", "customers where city = 'Vancouver'"))
        .unwrap();

    let dump = src.dir().unwrap().join("all.su");
    let stats = dump_database(&src, BufWriter::new(File::create(&dump).unwrap())).unwrap();
    assert_eq!(stats.tables, 5);
    assert_eq!(stats.rows, 200 + 30 + 1);

    let target = src.dir().unwrap().join("copy.db");
    let dst = Database::open_with_config(&target, Config::default().mode(OpenMode::Create)).unwrap();
    let loaded = load_database(&dst, BufReader::new(File::open(&dump).unwrap())).unwrap();
    assert_eq!(loaded, stats);
    assert_eq!(row_count(&dst, "customers"), 200);
    assert_eq!(row_count(&dst, "table_2"), 10);
    assert!(dst.schema().view("west").is_some());
    assert_eq!(dst.check().status, CheckStatus::Ok);
}

#[test]
fn reads_see_a_consistent_snapshot_under_writes() {
    let test_db = TestDatabase::memory();
    create_stress_table(&test_db);
    let config = StressConfig {
        threads: 3,
        transactions: 20,
        rows_per_transaction: 3,
        key_space: 1_000_000,
    };
    let (result, torn) = stress_readers_and_writers(&test_db, &config, 2);
    assert_eq!(torn, 0);
    assert_eq!(result.failed_ops, 0);
    assert_eq!(
        row_count(&test_db, STRESS_TABLE),
        result.successful_ops * config.rows_per_transaction
    );
}
