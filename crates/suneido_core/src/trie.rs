//! Persistent hash trie of per-table metadata.
//!
//! Table numbers are consumed five bits at a time, giving 32-way branch
//! nodes. After [`MAX_DEPTH`] branch levels, keys that still collide share a
//! chain node. Updates copy the path from the root to the changed slot and
//! share every other subtrie with the previous version, so a reader holding
//! an old [`DbHashTrie`] never sees a later change.
//!
//! ## Node Encoding
//!
//! ```text
//! branch: 0 u8 | bitmap u32 | per slot: 0 u8 + entry, or 1 u8 + child u64
//! chain:  1 u8 | count u16 | entries
//! entry:  table u32 | nrows u64 | total_size u64 | nindexes u16
//!         | per index: len u16 + columns | root u64 | levels u32
//! ```
//!
//! All integers are little-endian. Nodes are stored as `Other` blocks.

use crate::error::{CoreError, CoreResult};
use crate::storage::{read_u64, BlockType, Storage};
use crate::types::{Address, TableNum};
use std::sync::Arc;

const BITS_PER_LEVEL: u32 = 5;
const MASK: u32 = (1 << BITS_PER_LEVEL) - 1;

/// Branch levels before collisions are chained.
pub const MAX_DEPTH: u32 = 4;

const KIND_BRANCH: u8 = 0;
const KIND_CHAIN: u8 = 1;
const SLOT_ENTRY: u8 = 0;
const SLOT_CHILD: u8 = 1;

/// Location of one index's B-tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Comma-separated indexed columns.
    pub columns: String,
    /// Root node address.
    pub root: Address,
    /// Interior levels above the leaves.
    pub levels: usize,
}

/// Per-table statistics and index roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Table number.
    pub table: TableNum,
    /// Live row count.
    pub nrows: u64,
    /// Total bytes of live rows.
    pub total_size: u64,
    /// One entry per index.
    pub indexes: Vec<IndexInfo>,
}

impl TableInfo {
    /// Creates an entry with no rows and no indexes.
    #[must_use]
    pub fn new(table: TableNum) -> Self {
        Self {
            table,
            nrows: 0,
            total_size: 0,
            indexes: Vec::new(),
        }
    }

    /// Index by its comma-separated columns.
    #[must_use]
    pub fn index(&self, columns: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|ix| ix.columns == columns)
    }

    fn encode(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        buf.extend_from_slice(&self.table.to_le_bytes());
        buf.extend_from_slice(&self.nrows.to_le_bytes());
        buf.extend_from_slice(&self.total_size.to_le_bytes());
        let n = u16::try_from(self.indexes.len())
            .map_err(|_| CoreError::internal("too many indexes"))?;
        buf.extend_from_slice(&n.to_le_bytes());
        for ix in &self.indexes {
            if ix.root.is_temp() {
                return Err(CoreError::internal(format!(
                    "storing provisional index root {} for table {}",
                    ix.root, self.table
                )));
            }
            let cols = ix.columns.as_bytes();
            let len = u16::try_from(cols.len())
                .map_err(|_| CoreError::internal("index columns too long"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(cols);
            buf.extend_from_slice(&ix.root.0.to_le_bytes());
            let levels =
                u32::try_from(ix.levels).map_err(|_| CoreError::internal("too many levels"))?;
            buf.extend_from_slice(&levels.to_le_bytes());
        }
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> CoreResult<Self> {
        let table = r.u32()?;
        let nrows = r.u64()?;
        let total_size = r.u64()?;
        let n = r.u16()?;
        let mut indexes = Vec::with_capacity(usize::from(n));
        for _ in 0..n {
            let len = usize::from(r.u16()?);
            let columns = String::from_utf8(r.bytes(len)?.to_vec())
                .map_err(|_| r.error("index columns are not utf-8"))?;
            let root = Address(r.u64()?);
            let levels = r.u32()? as usize;
            indexes.push(IndexInfo {
                columns,
                root,
                levels,
            });
        }
        Ok(Self {
            table,
            nrows,
            total_size,
            indexes,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    adr: Address,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(self.error("trie node truncated"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        Ok(read_u64(self.bytes(8)?, 0))
    }

    fn error(&self, message: &str) -> CoreError {
        CoreError::corrupted(self.adr.0, message)
    }
}

#[derive(Debug, Clone)]
enum NodeRef {
    Mem(Arc<TrieNode>),
    Stored(Address),
}

#[derive(Debug, Clone)]
enum Slot {
    Entry(Arc<TableInfo>),
    Child(NodeRef),
}

#[derive(Debug, Clone)]
enum TrieNode {
    Branch { bitmap: u32, slots: Vec<Slot> },
    Chain(Vec<Arc<TableInfo>>),
}

impl TrieNode {
    fn empty() -> Self {
        Self::Branch {
            bitmap: 0,
            slots: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Branch { slots, .. } => slots.is_empty(),
            Self::Chain(entries) => entries.is_empty(),
        }
    }

    /// The sole entry of a node that can be folded into its parent's slot.
    fn single_entry(&self) -> Option<Arc<TableInfo>> {
        match self {
            Self::Branch { slots, .. } => match slots.as_slice() {
                [Slot::Entry(e)] => Some(e.clone()),
                _ => None,
            },
            Self::Chain(entries) => match entries.as_slice() {
                [e] => Some(e.clone()),
                _ => None,
            },
        }
    }

    fn decode(data: &[u8], adr: Address) -> CoreResult<Self> {
        let mut r = Reader { data, pos: 0, adr };
        match r.u8()? {
            KIND_BRANCH => {
                let bitmap = r.u32()?;
                let mut slots = Vec::with_capacity(bitmap.count_ones() as usize);
                for _ in 0..bitmap.count_ones() {
                    slots.push(match r.u8()? {
                        SLOT_ENTRY => Slot::Entry(Arc::new(TableInfo::decode(&mut r)?)),
                        SLOT_CHILD => Slot::Child(NodeRef::Stored(Address(r.u64()?))),
                        tag => return Err(r.error(&format!("bad trie slot tag {tag}"))),
                    });
                }
                Ok(Self::Branch { bitmap, slots })
            }
            KIND_CHAIN => {
                let n = r.u16()?;
                let entries = (0..n)
                    .map(|_| TableInfo::decode(&mut r).map(Arc::new))
                    .collect::<CoreResult<_>>()?;
                Ok(Self::Chain(entries))
            }
            kind => Err(r.error(&format!("bad trie node kind {kind}"))),
        }
    }
}

fn bit_at(key: TableNum, depth: u32) -> u32 {
    (key >> (depth * BITS_PER_LEVEL)) & MASK
}

fn slot_pos(bitmap: u32, bit: u32) -> usize {
    (bitmap & ((1u32 << bit) - 1)).count_ones() as usize
}

/// A persistent map from table number to [`TableInfo`].
#[derive(Clone)]
pub struct DbHashTrie {
    storage: Arc<Storage>,
    root: NodeRef,
}

impl DbHashTrie {
    /// Creates an empty trie.
    #[must_use]
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            root: NodeRef::Mem(Arc::new(TrieNode::empty())),
        }
    }

    /// Opens a stored trie.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the root node cannot be decoded.
    pub fn from(storage: Arc<Storage>, adr: Address) -> CoreResult<Self> {
        let trie = Self {
            storage,
            root: NodeRef::Stored(adr),
        };
        trie.load(&trie.root)?;
        Ok(trie)
    }

    /// Stored root address, or `None` if there are unsaved changes.
    #[must_use]
    pub fn address(&self) -> Option<Address> {
        match self.root {
            NodeRef::Stored(adr) => Some(adr),
            NodeRef::Mem(_) => None,
        }
    }

    fn load(&self, node: &NodeRef) -> CoreResult<Arc<TrieNode>> {
        match node {
            NodeRef::Mem(n) => Ok(n.clone()),
            NodeRef::Stored(adr) => {
                let block = self.storage.read_block(*adr)?;
                if block.block_type != BlockType::Other {
                    return Err(CoreError::corrupted(adr.0, "expected a trie node block"));
                }
                TrieNode::decode(&block.payload, *adr).map(Arc::new)
            }
        }
    }

    /// Looks up a table.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if a stored node cannot be decoded.
    pub fn get(&self, table: TableNum) -> CoreResult<Option<Arc<TableInfo>>> {
        let mut node = self.load(&self.root)?;
        let mut depth = 0;
        loop {
            let next = match &*node {
                TrieNode::Chain(entries) => {
                    return Ok(entries.iter().find(|e| e.table == table).cloned());
                }
                TrieNode::Branch { bitmap, slots } => {
                    let bit = bit_at(table, depth);
                    if bitmap & (1 << bit) == 0 {
                        return Ok(None);
                    }
                    match &slots[slot_pos(*bitmap, bit)] {
                        Slot::Entry(e) => {
                            return Ok((e.table == table).then(|| e.clone()));
                        }
                        Slot::Child(child) => self.load(child)?,
                    }
                }
            };
            node = next;
            depth += 1;
        }
    }

    /// Returns a trie with `info` added or replaced.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if a stored node cannot be decoded.
    pub fn with(&self, info: TableInfo) -> CoreResult<Self> {
        let root = self.load(&self.root)?;
        let node = self.with_node(&root, 0, Arc::new(info))?;
        Ok(Self {
            storage: self.storage.clone(),
            root: NodeRef::Mem(Arc::new(node)),
        })
    }

    fn with_node(&self, node: &TrieNode, depth: u32, info: Arc<TableInfo>) -> CoreResult<TrieNode> {
        match node {
            TrieNode::Chain(entries) => {
                let mut entries = entries.clone();
                match entries.iter().position(|e| e.table == info.table) {
                    Some(i) => entries[i] = info,
                    None => entries.push(info),
                }
                Ok(TrieNode::Chain(entries))
            }
            TrieNode::Branch { bitmap, slots } => {
                let bit = bit_at(info.table, depth);
                let pos = slot_pos(*bitmap, bit);
                let mut slots = slots.clone();
                if bitmap & (1 << bit) == 0 {
                    slots.insert(pos, Slot::Entry(info));
                    return Ok(TrieNode::Branch {
                        bitmap: bitmap | (1 << bit),
                        slots,
                    });
                }
                let current = slots[pos].clone();
                slots[pos] = match &current {
                    Slot::Entry(e) if e.table == info.table => Slot::Entry(info),
                    Slot::Entry(e) => {
                        let pair = Self::pair(e.clone(), info, depth + 1);
                        Slot::Child(NodeRef::Mem(Arc::new(pair)))
                    }
                    Slot::Child(child) => {
                        let child = self.load(child)?;
                        let updated = self.with_node(&child, depth + 1, info)?;
                        Slot::Child(NodeRef::Mem(Arc::new(updated)))
                    }
                };
                Ok(TrieNode::Branch {
                    bitmap: *bitmap,
                    slots,
                })
            }
        }
    }

    fn pair(a: Arc<TableInfo>, b: Arc<TableInfo>, depth: u32) -> TrieNode {
        if depth >= MAX_DEPTH {
            return TrieNode::Chain(vec![a, b]);
        }
        let (ba, bb) = (bit_at(a.table, depth), bit_at(b.table, depth));
        if ba == bb {
            let child = Self::pair(a, b, depth + 1);
            return TrieNode::Branch {
                bitmap: 1 << ba,
                slots: vec![Slot::Child(NodeRef::Mem(Arc::new(child)))],
            };
        }
        let slots = if ba < bb {
            vec![Slot::Entry(a), Slot::Entry(b)]
        } else {
            vec![Slot::Entry(b), Slot::Entry(a)]
        };
        TrieNode::Branch {
            bitmap: (1 << ba) | (1 << bb),
            slots,
        }
    }

    /// Returns a trie without `table`. Unchanged if it was absent.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if a stored node cannot be decoded.
    pub fn without(&self, table: TableNum) -> CoreResult<Self> {
        let root = self.load(&self.root)?;
        Ok(match self.without_node(&root, 0, table)? {
            Some(node) => Self {
                storage: self.storage.clone(),
                root: NodeRef::Mem(Arc::new(node)),
            },
            None => self.clone(),
        })
    }

    fn without_node(&self, node: &TrieNode, depth: u32, table: TableNum) -> CoreResult<Option<TrieNode>> {
        match node {
            TrieNode::Chain(entries) => {
                let Some(i) = entries.iter().position(|e| e.table == table) else {
                    return Ok(None);
                };
                let mut entries = entries.clone();
                entries.remove(i);
                Ok(Some(TrieNode::Chain(entries)))
            }
            TrieNode::Branch { bitmap, slots } => {
                let bit = bit_at(table, depth);
                if bitmap & (1 << bit) == 0 {
                    return Ok(None);
                }
                let pos = slot_pos(*bitmap, bit);
                let mut slots = slots.clone();
                let mut bitmap = *bitmap;
                let current = slots[pos].clone();
                match &current {
                    Slot::Entry(e) if e.table == table => {
                        slots.remove(pos);
                        bitmap &= !(1 << bit);
                    }
                    Slot::Entry(_) => return Ok(None),
                    Slot::Child(child) => {
                        let child = self.load(child)?;
                        let Some(updated) = self.without_node(&child, depth + 1, table)? else {
                            return Ok(None);
                        };
                        if updated.is_empty() {
                            slots.remove(pos);
                            bitmap &= !(1 << bit);
                        } else if let Some(e) = updated.single_entry() {
                            slots[pos] = Slot::Entry(e);
                        } else {
                            slots[pos] = Slot::Child(NodeRef::Mem(Arc::new(updated)));
                        }
                    }
                }
                Ok(Some(TrieNode::Branch { bitmap, slots }))
            }
        }
    }

    /// Iterates every entry in trie order.
    #[must_use]
    pub fn iter(&self) -> TrieIter<'_> {
        let mut iter = TrieIter {
            trie: self,
            stack: Vec::new(),
            error: None,
            finished: false,
        };
        match self.load(&self.root) {
            Ok(root) => iter.stack.push((root, 0)),
            Err(e) => iter.error = Some(e),
        }
        iter
    }

    /// Appends every in-memory node and returns the root address.
    ///
    /// `translate` is applied to each entry held by an in-memory node before
    /// it is written. Entries in stored subtries are left alone.
    ///
    /// # Errors
    ///
    /// Returns any error from `translate`, or a storage error.
    pub fn store<F>(&mut self, mut translate: F) -> CoreResult<Address>
    where
        F: FnMut(&TableInfo) -> CoreResult<TableInfo>,
    {
        let adr = self.store_node(&self.root, &mut translate)?;
        self.root = NodeRef::Stored(adr);
        Ok(adr)
    }

    fn store_node<F>(&self, node: &NodeRef, translate: &mut F) -> CoreResult<Address>
    where
        F: FnMut(&TableInfo) -> CoreResult<TableInfo>,
    {
        let node = match node {
            NodeRef::Stored(adr) => return Ok(*adr),
            NodeRef::Mem(node) => node,
        };
        let mut buf = Vec::new();
        match &**node {
            TrieNode::Branch { bitmap, slots } => {
                buf.push(KIND_BRANCH);
                buf.extend_from_slice(&bitmap.to_le_bytes());
                for slot in slots {
                    match slot {
                        Slot::Entry(e) => {
                            buf.push(SLOT_ENTRY);
                            translate(e)?.encode(&mut buf)?;
                        }
                        Slot::Child(child) => {
                            let adr = self.store_node(child, translate)?;
                            buf.push(SLOT_CHILD);
                            buf.extend_from_slice(&adr.0.to_le_bytes());
                        }
                    }
                }
            }
            TrieNode::Chain(entries) => {
                buf.push(KIND_CHAIN);
                let n = u16::try_from(entries.len())
                    .map_err(|_| CoreError::internal("trie chain too long"))?;
                buf.extend_from_slice(&n.to_le_bytes());
                for e in entries {
                    translate(e)?.encode(&mut buf)?;
                }
            }
        }
        self.storage.append_block(BlockType::Other, &buf, 0)
    }
}

impl std::fmt::Debug for DbHashTrie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHashTrie")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Iterator over a [`DbHashTrie`].
pub struct TrieIter<'a> {
    trie: &'a DbHashTrie,
    stack: Vec<(Arc<TrieNode>, usize)>,
    error: Option<CoreError>,
    finished: bool,
}

impl Iterator for TrieIter<'_> {
    type Item = CoreResult<Arc<TableInfo>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(e) = self.error.take() {
            self.finished = true;
            return Some(Err(e));
        }
        loop {
            let Some((node, i)) = self.stack.last_mut() else {
                self.finished = true;
                return None;
            };
            let at = *i;
            *i += 1;
            let child = match &**node {
                TrieNode::Chain(entries) => match entries.get(at) {
                    Some(e) => return Some(Ok(e.clone())),
                    None => None,
                },
                TrieNode::Branch { slots, .. } => match slots.get(at) {
                    Some(Slot::Entry(e)) => return Some(Ok(e.clone())),
                    Some(Slot::Child(child)) => Some(child.clone()),
                    None => None,
                },
            };
            match child {
                Some(child) => match self.trie.load(&child) {
                    Ok(n) => self.stack.push((n, 0)),
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                },
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(table: TableNum, nrows: u64) -> TableInfo {
        TableInfo {
            table,
            nrows,
            total_size: nrows * 10,
            indexes: vec![IndexInfo {
                columns: "id".into(),
                root: Address(8),
                levels: 0,
            }],
        }
    }

    fn storage() -> Arc<Storage> {
        Arc::new(Storage::in_memory().unwrap())
    }

    fn sorted(trie: &DbHashTrie) -> Vec<TableInfo> {
        let mut all: Vec<TableInfo> = trie
            .iter()
            .map(|e| e.map(|e| (*e).clone()))
            .collect::<CoreResult<_>>()
            .unwrap();
        all.sort_by_key(|e| e.table);
        all
    }

    #[test]
    fn get_with_and_replace() {
        let mut trie = DbHashTrie::new(storage());
        for t in 1..100 {
            trie = trie.with(info(t, 1)).unwrap();
        }
        trie = trie.with(info(42, 7)).unwrap();
        assert_eq!(trie.get(42).unwrap().unwrap().nrows, 7);
        assert_eq!(trie.get(41).unwrap().unwrap().nrows, 1);
        assert!(trie.get(100).unwrap().is_none());
        assert_eq!(sorted(&trie).len(), 99);
    }

    #[test]
    fn old_versions_are_unchanged() {
        let v1 = DbHashTrie::new(storage()).with(info(5, 1)).unwrap();
        let v2 = v1.with(info(5, 2)).unwrap().with(info(37, 3)).unwrap();
        let v3 = v2.without(5).unwrap();

        assert_eq!(v1.get(5).unwrap().unwrap().nrows, 1);
        assert!(v1.get(37).unwrap().is_none());
        assert_eq!(v2.get(5).unwrap().unwrap().nrows, 2);
        assert!(v3.get(5).unwrap().is_none());
        assert_eq!(v3.get(37).unwrap().unwrap().nrows, 3);
    }

    #[test]
    fn deep_collisions_chain() {
        let a = 3;
        let b = 3 + (1 << 20);
        let c = 3 + (2 << 20);
        let trie = DbHashTrie::new(storage())
            .with(info(a, 1))
            .unwrap()
            .with(info(b, 2))
            .unwrap()
            .with(info(c, 3))
            .unwrap();
        assert_eq!(trie.get(b).unwrap().unwrap().nrows, 2);
        let trie = trie.without(a).unwrap().without(c).unwrap();
        assert_eq!(trie.get(b).unwrap().unwrap().nrows, 2);
        assert!(trie.get(a).unwrap().is_none());
        assert_eq!(sorted(&trie).len(), 1);
    }

    #[test]
    fn store_and_reopen() {
        let storage = storage();
        let mut trie = DbHashTrie::new(storage.clone());
        for t in 1..70 {
            trie = trie.with(info(t, u64::from(t))).unwrap();
        }
        let adr = trie.store(|e| Ok(e.clone())).unwrap();
        assert_eq!(trie.address(), Some(adr));

        let reopened = DbHashTrie::from(storage.clone(), adr).unwrap();
        assert_eq!(sorted(&reopened), sorted(&trie));

        let mut changed = reopened.with(info(3, 300)).unwrap();
        assert_eq!(changed.address(), None);
        let adr2 = changed.store(|e| Ok(e.clone())).unwrap();
        let again = DbHashTrie::from(storage, adr2).unwrap();
        assert_eq!(again.get(3).unwrap().unwrap().nrows, 300);
        assert_eq!(reopened.get(3).unwrap().unwrap().nrows, 3);
    }

    #[test]
    fn translator_sees_only_changed_paths() {
        let storage = storage();
        let mut trie = DbHashTrie::new(storage.clone());
        for t in [1, 33, 2, 34] {
            trie = trie.with(info(t, 0)).unwrap();
        }
        trie.store(|e| Ok(e.clone())).unwrap();

        let mut changed = trie.with(info(33, 0)).unwrap();
        let mut seen = Vec::new();
        changed
            .store(|e| {
                seen.push(e.table);
                let mut e = e.clone();
                e.nrows = 9;
                Ok(e)
            })
            .unwrap();
        assert!(seen.contains(&33));
        assert!(!seen.contains(&2));
        assert!(!seen.contains(&34));
        assert_eq!(changed.get(33).unwrap().unwrap().nrows, 9);
    }

    #[test]
    fn provisional_roots_are_rejected() {
        let mut entry = info(5, 0);
        entry.indexes[0].root = Address::temp(1);
        let mut trie = DbHashTrie::new(storage()).with(entry).unwrap();
        assert!(trie.store(|e| Ok(e.clone())).is_err());
    }

    #[test]
    fn corrupt_root_is_reported() {
        let storage = storage();
        let adr = storage.append_block(BlockType::Other, &[9, 9, 9], 0).unwrap();
        assert!(matches!(
            DbHashTrie::from(storage, adr),
            Err(CoreError::Corrupted { .. })
        ));
    }
}
