//! Property tests for B-tree nodes, trees, the hash trie, block iteration
//! and transactions against a simple model.

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use suneido_core::btree::MemNode;
use suneido_core::storage::BlockType;
use suneido_core::{
    Address, Btree, BtreeKey, BtreeNode, Database, DbHashTrie, Record, RecordBuilder, Storage,
};
use suneido_testkit::prelude::*;

fn int_key(n: i64) -> Record {
    RecordBuilder::new().int(n).build()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn node_pack_round_trip(
        keys in prop::collection::btree_set((key_strategy(), address_strategy()), 0..40),
        leaf in any::<bool>(),
    ) {
        let keys: Vec<BtreeKey> = keys
            .into_iter()
            .map(|(k, adr)| {
                let key = BtreeKey::new(k, adr);
                if leaf { key } else { key.with_child(Address(adr.0 + 8)) }
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        let node = BtreeNode::from(MemNode::from_keys(leaf, sorted.clone()));
        let packed = node.pack().unwrap();
        prop_assert_eq!(packed.len(), node.packed_size());

        let reopened = BtreeNode::from_packed(packed).unwrap();
        prop_assert_eq!(reopened.is_leaf(), leaf);
        let back = reopened.keys().unwrap();
        prop_assert_eq!(back.len(), sorted.len());
        for (a, b) in back.iter().zip(&sorted) {
            prop_assert_eq!(a, b);
            prop_assert_eq!(a.child, b.child);
        }
    }

    #[test]
    fn leaf_split_partitions_keys(
        keys in prop::collection::btree_set((0i64..50, 1u64..1000), 1..60),
        new in (0i64..50, 1000u64..2000),
    ) {
        let keys: Vec<BtreeKey> = keys
            .into_iter()
            .map(|(k, a)| BtreeKey::new(int_key(k), Address(a * 8)))
            .collect();
        let n = keys.len();
        let node = BtreeNode::from(MemNode::from_keys(true, keys));
        let added = BtreeKey::new(int_key(new.0), Address(new.1 * 8));
        if let Some(split) = node.split(added).unwrap() {
            let (left, right) = (split.left.keys(), split.right.keys());
            prop_assert_eq!(left.len() + right.len(), n + 1);
            prop_assert!(!left.is_empty() && !right.is_empty());
            prop_assert!(left.iter().all(|k| *k < split.separator));
            prop_assert!(right.iter().all(|k| *k > split.separator));
            prop_assert!(!left[left.len() - 1].same_fields(&right[0]));
        }
    }

    #[test]
    fn tree_iterates_in_order(keys in unique_ints_strategy(400)) {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut tree = Btree::new(storage.clone(), 256);
        for (i, k) in keys.iter().enumerate() {
            tree.insert(BtreeKey::new(int_key(*k), Address(8 * (i as u64 + 1)))).unwrap();
        }
        let found: Vec<i64> = tree
            .iter()
            .map(|k| k.unwrap().key.get_int(0).unwrap())
            .collect();
        let mut expected = keys.clone();
        expected.sort_unstable();
        prop_assert_eq!(&found, &expected);

        let root = tree.store().unwrap();
        let reopened = Btree::open(storage, root, tree.levels(), 256);
        prop_assert_eq!(reopened.count().unwrap(), expected.len());
    }

    #[test]
    fn tree_removes_exactly_what_was_removed(
        keys in unique_ints_strategy(300),
        drop_every in 2usize..5,
    ) {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut tree = Btree::new(storage, 200);
        let entries: Vec<BtreeKey> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| BtreeKey::new(int_key(*k), Address(8 * (i as u64 + 1))))
            .collect();
        for e in &entries {
            tree.insert(e.clone()).unwrap();
        }
        let mut kept = BTreeSet::new();
        for (i, e) in entries.iter().enumerate() {
            if i % drop_every == 0 {
                prop_assert!(tree.remove(e).unwrap());
            } else {
                kept.insert(e.key.get_int(0).unwrap());
            }
        }
        let found: Vec<i64> = tree.iter().map(|k| k.unwrap().key.get_int(0).unwrap()).collect();
        prop_assert_eq!(found, kept.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn trie_survives_store_and_reload(
        infos in prop::collection::vec(table_info_strategy(), 0..120),
    ) {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let mut trie = DbHashTrie::new(storage.clone());
        let mut expected = std::collections::BTreeMap::new();
        for info in infos {
            expected.insert(info.table, info.clone());
            trie = trie.with(info).unwrap();
        }
        let adr = trie.store(|i| Ok(i.clone())).unwrap();
        let reloaded = DbHashTrie::from(storage, adr).unwrap();
        for (num, info) in &expected {
            let got = reloaded.get(*num).unwrap();
            prop_assert_eq!(got.as_deref(), Some(info));
        }
        prop_assert_eq!(reloaded.iter().count(), expected.len());
    }

    #[test]
    fn reverse_iteration_mirrors_forward(
        payloads in prop::collection::vec(prop::collection::vec(1u8..=255, 0..64), 1..60),
    ) {
        let storage = Storage::in_memory().unwrap();
        for p in &payloads {
            storage.append_block(BlockType::Other, p, 0).unwrap();
        }
        let forward: Vec<Address> = storage.iter().map(|b| b.adr).collect();
        let mut backward: Vec<Address> = storage.rev_iter().map(|b| b.adr).collect();
        backward.reverse();
        prop_assert_eq!(forward.len(), payloads.len());
        prop_assert_eq!(forward, backward);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn transactions_match_a_set_model(ops in table_ops_strategy(120)) {
        let db = Database::open_in_memory().unwrap();
        db.transaction(|t| t.create_table("model", "(k) key(k)").map(|_| ())).unwrap();

        let mut committed = BTreeSet::new();
        let mut pending = committed.clone();
        let mut t = db.update_transaction().unwrap();
        for op in ops {
            match op {
                TableOp::Insert(k) => {
                    if pending.insert(k) {
                        t.add_record("model", int_key(k)).unwrap();
                    } else {
                        prop_assert!(t.add_record("model", int_key(k)).is_err());
                    }
                }
                TableOp::Delete(k) => {
                    if pending.remove(&k) {
                        let (adr, _) = t.lookup("model", "k", &int_key(k)).unwrap().unwrap();
                        t.remove_record("model", adr).unwrap();
                    }
                }
                TableOp::Commit => {
                    t.commit().unwrap();
                    committed = pending.clone();
                    t = db.update_transaction().unwrap();
                }
            }
        }
        t.abort();

        let rows: Vec<i64> = db
            .read(|t| t.records("model"))
            .unwrap()
            .iter()
            .map(|(_, r)| r.get_int(0).unwrap())
            .collect();
        prop_assert_eq!(rows, committed.into_iter().collect::<Vec<_>>());
        prop_assert_eq!(db.check().status, suneido_core::CheckStatus::Ok);
    }
}
