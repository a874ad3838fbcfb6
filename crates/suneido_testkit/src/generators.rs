//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use proptest::prelude::*;
use suneido_core::trie::{IndexInfo, TableInfo};
use suneido_core::{Address, Record, Value};

/// Strategy for generating field values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        prop::string::string_regex("[a-zA-Z0-9 ]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::Str),
    ]
}

/// Strategy for generating records of up to `max_fields` fields.
pub fn record_strategy(max_fields: usize) -> impl Strategy<Value = Record> {
    prop::collection::vec(value_strategy(), 0..=max_fields)
        .prop_map(|values| Record::from_values(&values))
}

/// Strategy for generating `(int, string)` index keys.
pub fn key_strategy() -> impl Strategy<Value = Record> {
    (any::<i64>(), "[a-z]{0,12}").prop_map(|(n, s)| {
        Record::from_values(&[Value::Int(n), Value::Str(s)])
    })
}

/// Strategy for generating a set of distinct integer keys.
pub fn unique_ints_strategy(max: usize) -> impl Strategy<Value = Vec<i64>> {
    prop::collection::hash_set(-1_000_000i64..1_000_000, 0..max)
        .prop_map(|set| set.into_iter().collect())
}

/// Strategy for generating valid table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}")
        .expect("Invalid regex")
        .prop_filter("Name must not clash with system tables", |s| {
            !matches!(s.as_str(), "tables" | "columns" | "indexes" | "views")
        })
}

/// Strategy for generating data addresses: aligned and non-zero.
pub fn address_strategy() -> impl Strategy<Value = Address> {
    (1u64..1 << 40).prop_map(|n| Address(n * 8))
}

/// Strategy for generating per-table metadata entries.
pub fn table_info_strategy() -> impl Strategy<Value = TableInfo> {
    (
        1u32..50_000,
        any::<u32>(),
        any::<u32>(),
        prop::collection::vec((address_strategy(), 0usize..6), 0..4),
    )
        .prop_map(|(table, nrows, size, indexes)| TableInfo {
            table,
            nrows: u64::from(nrows),
            total_size: u64::from(size),
            indexes: indexes
                .into_iter()
                .enumerate()
                .map(|(i, (root, levels))| IndexInfo {
                    columns: format!("c{i}"),
                    root,
                    levels,
                })
                .collect(),
        })
}

/// A write applied to a single-key table in model-based tests.
#[derive(Debug, Clone)]
pub enum TableOp {
    /// Insert a row with this key, if absent.
    Insert(i64),
    /// Delete the row with this key, if present.
    Delete(i64),
    /// Commit the writes so far.
    Commit,
}

/// Strategy for generating table operations over a small key space.
pub fn table_op_strategy() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        4 => (0i64..64).prop_map(TableOp::Insert),
        2 => (0i64..64).prop_map(TableOp::Delete),
        1 => Just(TableOp::Commit),
    ]
}

/// Strategy for generating a sequence of table operations.
pub fn table_ops_strategy(max: usize) -> impl Strategy<Value = Vec<TableOp>> {
    prop::collection::vec(table_op_strategy(), 0..max)
}
