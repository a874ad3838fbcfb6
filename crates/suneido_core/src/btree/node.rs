//! B-tree nodes.
//!
//! A node is either a [`MemNode`] (an in-memory builder produced by every
//! mutation) or a [`DbNode`] (a read view over packed bytes from storage).
//! Mutating a `DbNode` copies it into a `MemNode` first; packed bytes are
//! never modified.
//!
//! ## Packed Layout
//!
//! ```text
//! +---------+--------+-------+------------------------+---------------------+
//! | count   | leaf   | 0 0 0 | offsets (count + 1)    | entries             |
//! | u32 LE  | u8     |       | u32 LE, from the start |                     |
//! +---------+--------+-------+------------------------+---------------------+
//!
//! entry = record | adr u64 LE [| child u64 LE]   (child only in interior nodes)
//! ```
//!
//! The offsets give O(1) positional access, so a `DbNode` decodes only the
//! keys a search actually visits.
//!
//! ## Invariants
//!
//! - Keys within a node are sorted
//! - A leaf split never separates keys with equal fields, so a run of
//!   equal fields may grow one leaf past the node budget

use super::key::BtreeKey;
use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use crate::types::Address;
use bytes::Bytes;

const NODE_HEADER: usize = 8;

/// In-memory node builder.
#[derive(Debug, Clone, Default)]
pub struct MemNode {
    leaf: bool,
    keys: Vec<BtreeKey>,
    /// Total size of the packed entries.
    bytes: usize,
}

impl MemNode {
    /// Creates an empty node.
    #[must_use]
    pub fn new(leaf: bool) -> Self {
        Self {
            leaf,
            keys: Vec::new(),
            bytes: 0,
        }
    }

    /// Creates a node from keys that are already sorted.
    #[must_use]
    pub fn from_keys(leaf: bool, keys: Vec<BtreeKey>) -> Self {
        let bytes = keys.iter().map(|k| entry_size(leaf, k)).sum();
        Self { leaf, keys, bytes }
    }

    /// The keys.
    #[must_use]
    pub fn keys(&self) -> &[BtreeKey] {
        &self.keys
    }

    /// Replaces the key at `i`.
    pub fn replace(&mut self, i: usize, key: BtreeKey) {
        self.bytes = self.bytes - entry_size(self.leaf, &self.keys[i]) + entry_size(self.leaf, &key);
        self.keys[i] = key;
    }

    /// Inserts `key` in order and returns its position.
    pub fn insert(&mut self, key: BtreeKey) -> usize {
        let i = self.keys.partition_point(|k| *k < key);
        self.bytes += entry_size(self.leaf, &key);
        self.keys.insert(i, key);
        i
    }

    fn remove_range(&mut self, from: usize, to: usize) {
        let leaf = self.leaf;
        let removed: usize = self.keys.drain(from..to).map(|k| entry_size(leaf, &k)).sum();
        self.bytes -= removed;
    }

    fn pack(&self) -> CoreResult<Bytes> {
        let size = self.packed_size();
        let (Ok(n), Ok(_)) = (u32::try_from(self.keys.len()), u32::try_from(size)) else {
            return Err(CoreError::internal(format!(
                "node of {} keys and {size} bytes is too large to pack",
                self.keys.len()
            )));
        };
        let header = NODE_HEADER + 4 * (self.keys.len() + 1);
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&n.to_le_bytes());
        buf.push(u8::from(self.leaf));
        buf.extend_from_slice(&[0, 0, 0]);
        let mut off = header;
        buf.extend_from_slice(&(off as u32).to_le_bytes());
        for k in &self.keys {
            off += entry_size(self.leaf, k);
            buf.extend_from_slice(&(off as u32).to_le_bytes());
        }
        for k in &self.keys {
            buf.extend_from_slice(k.key.as_bytes());
            buf.extend_from_slice(&k.adr.0.to_le_bytes());
            if !self.leaf {
                buf.extend_from_slice(&k.child.unwrap_or_default().0.to_le_bytes());
            }
        }
        Ok(Bytes::from(buf))
    }

    /// Size of the packed form.
    #[must_use]
    pub fn packed_size(&self) -> usize {
        NODE_HEADER + 4 * (self.keys.len() + 1) + self.bytes
    }

    /// Splits a node that holds one key too many; `pos` is where that key
    /// went. Returns the node unchanged if a leaf has no boundary between
    /// distinct fields.
    pub(crate) fn split_grown(mut self, pos: usize) -> Result<Split, MemNode> {
        let n = self.keys.len();
        let leaf = self.leaf;
        if n < 2 || (leaf && self.keys[0].same_fields(&self.keys[n - 1])) {
            return Err(self);
        }
        let keys = &self.keys;
        let boundary = |m: usize| !leaf || !keys[m - 1].same_fields(&keys[m]);
        let at = if pos == n - 1 && boundary(n - 1) {
            Some(n - 1)
        } else {
            let mid = n / 2;
            (0..n)
                .flat_map(|d| [mid.checked_sub(d), mid.checked_add(d)])
                .flatten()
                .find(|&m| m >= 1 && m < n && boundary(m))
        };
        let Some(m) = at else {
            return Err(self);
        };

        let right = self.keys.split_off(m);
        let separator = if leaf {
            self.keys[m - 1].minimize()
        } else {
            right[0].clone().without_child()
        };
        Ok(Split {
            left: MemNode::from_keys(leaf, self.keys),
            separator,
            right: MemNode::from_keys(leaf, right),
        })
    }
}

fn entry_size(leaf: bool, k: &BtreeKey) -> usize {
    k.key.size() + if leaf { 8 } else { 16 }
}

/// Read view over a packed node.
#[derive(Clone)]
pub struct DbNode {
    data: Bytes,
    count: usize,
    leaf: bool,
}

impl DbNode {
    /// Wraps packed bytes, validating the header and offsets.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the layout is inconsistent.
    pub fn new(data: Bytes) -> CoreResult<Self> {
        if data.len() < NODE_HEADER + 4 {
            return Err(CoreError::invalid_format("node shorter than its header"));
        }
        let count = read_u32(&data, 0) as usize;
        let leaf = match data[4] {
            0 => false,
            1 => true,
            b => return Err(CoreError::invalid_format(format!("invalid node flag {b}"))),
        };
        if data[5..NODE_HEADER] != [0, 0, 0] {
            return Err(CoreError::invalid_format("invalid node header"));
        }
        let header = count
            .checked_add(1)
            .and_then(|c| c.checked_mul(4))
            .and_then(|c| c.checked_add(NODE_HEADER))
            .unwrap_or(usize::MAX);
        if data.len() < header {
            return Err(CoreError::invalid_format("node offsets past end"));
        }
        let min_entry = 6 + if leaf { 8 } else { 16 };
        let mut prev = read_u32(&data, NODE_HEADER) as usize;
        if prev != header {
            return Err(CoreError::invalid_format("node offsets do not start after header"));
        }
        for i in 1..=count {
            let off = read_u32(&data, NODE_HEADER + 4 * i) as usize;
            if off < prev + min_entry || off > data.len() {
                return Err(CoreError::invalid_format(format!("node entry {i} out of range")));
            }
            prev = off;
        }
        if prev != data.len() {
            return Err(CoreError::invalid_format("node length mismatch"));
        }
        Ok(Self { data, count, leaf })
    }

    fn get(&self, i: usize) -> CoreResult<BtreeKey> {
        if i >= self.count {
            return Err(CoreError::internal(format!(
                "node index {i} out of range for {} keys",
                self.count
            )));
        }
        let start = read_u32(&self.data, NODE_HEADER + 4 * i) as usize;
        let end = read_u32(&self.data, NODE_HEADER + 4 * (i + 1)) as usize;
        let tail = if self.leaf { 8 } else { 16 };
        let rec_end = end - tail;
        let key = Record::from_bytes(self.data.slice(start..rec_end))?;
        let adr = Address(read_u64(&self.data, rec_end));
        let child = (!self.leaf).then(|| Address(read_u64(&self.data, rec_end + 8)));
        Ok(BtreeKey { key, adr, child })
    }
}

impl std::fmt::Debug for DbNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbNode")
            .field("count", &self.count)
            .field("leaf", &self.leaf)
            .field("size", &self.data.len())
            .finish()
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// The result of splitting a node.
#[derive(Debug, Clone)]
pub struct Split {
    /// Keys below the separator.
    pub left: MemNode,
    /// Sorts after every left key and before every right key.
    pub separator: BtreeKey,
    /// Keys above the separator.
    pub right: MemNode,
}

/// A B-tree node in either representation.
#[derive(Debug, Clone)]
pub enum BtreeNode {
    /// In-memory builder.
    Mem(MemNode),
    /// Storage-backed view.
    Db(DbNode),
}

impl BtreeNode {
    /// Creates an empty leaf.
    #[must_use]
    pub fn empty_leaf() -> Self {
        Self::Mem(MemNode::new(true))
    }

    /// Reopens a packed node.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the bytes are not a valid node.
    pub fn from_packed(data: Bytes) -> CoreResult<Self> {
        DbNode::new(data).map(Self::Db)
    }

    /// Returns true for leaf nodes.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        match self {
            Self::Mem(m) => m.leaf,
            Self::Db(d) => d.leaf,
        }
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Mem(m) => m.keys.len(),
            Self::Db(d) => d.count,
        }
    }

    /// Returns true if the node has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key at position `i`.
    ///
    /// # Errors
    ///
    /// Returns an error if `i` is out of range or the packed key is invalid.
    pub fn get(&self, i: usize) -> CoreResult<BtreeKey> {
        match self {
            Self::Mem(m) => m.keys.get(i).cloned().ok_or_else(|| {
                CoreError::internal(format!("node index {i} out of range for {} keys", m.keys.len()))
            }),
            Self::Db(d) => d.get(i),
        }
    }

    /// All keys in order.
    ///
    /// # Errors
    ///
    /// Returns an error if a packed key is invalid.
    pub fn keys(&self) -> CoreResult<Vec<BtreeKey>> {
        match self {
            Self::Mem(m) => Ok(m.keys.clone()),
            Self::Db(d) => (0..d.count).map(|i| d.get(i)).collect(),
        }
    }

    /// Copies the node into an in-memory builder.
    ///
    /// # Errors
    ///
    /// Returns an error if a packed key is invalid.
    pub fn to_mem(&self) -> CoreResult<MemNode> {
        match self {
            Self::Mem(m) => Ok(m.clone()),
            Self::Db(d) => Ok(MemNode {
                leaf: d.leaf,
                keys: self.keys()?,
                bytes: d.data.len() - (NODE_HEADER + 4 * (d.count + 1)),
            }),
        }
    }

    /// Index of the largest key less than or equal to `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a packed key is invalid.
    pub fn find(&self, key: &BtreeKey) -> CoreResult<Option<usize>> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid)? <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo.checked_sub(1))
    }

    /// Index of the first key greater than or equal to `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a packed key is invalid.
    pub fn lower_bound(&self, key: &BtreeKey) -> CoreResult<usize> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid)? < *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Returns a copy with `key` inserted in order.
    ///
    /// # Errors
    ///
    /// Returns an error if a packed key is invalid.
    pub fn with(&self, key: BtreeKey) -> CoreResult<MemNode> {
        let mut mem = self.to_mem()?;
        mem.insert(key);
        Ok(mem)
    }

    /// Returns a copy without `key`, or `None` if it is not present.
    ///
    /// # Errors
    ///
    /// Returns an error if a packed key is invalid.
    pub fn without(&self, key: &BtreeKey) -> CoreResult<Option<MemNode>> {
        let i = self.lower_bound(key)?;
        if i < self.len() && self.get(i)? == *key {
            return self.without_index(i).map(Some);
        }
        Ok(None)
    }

    /// Returns a copy without the key at `i`.
    ///
    /// # Errors
    ///
    /// Returns an error if `i` is out of range.
    pub fn without_index(&self, i: usize) -> CoreResult<MemNode> {
        self.without_range(i, i + 1)
    }

    /// Returns a copy without the keys in `[from, to)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds.
    pub fn without_range(&self, from: usize, to: usize) -> CoreResult<MemNode> {
        if from > to || to > self.len() {
            return Err(CoreError::internal(format!(
                "range {from}..{to} out of bounds for {} keys",
                self.len()
            )));
        }
        let mut mem = self.to_mem()?;
        mem.remove_range(from, to);
        Ok(mem)
    }

    /// Returns a copy whose entry `i` points at `child`.
    ///
    /// # Errors
    ///
    /// Returns an error for leaves or an out-of-range index.
    pub fn with_child(&self, i: usize, child: Address) -> CoreResult<MemNode> {
        if self.is_leaf() || i >= self.len() {
            return Err(CoreError::internal("with_child on a leaf or past the end"));
        }
        let mut mem = self.to_mem()?;
        mem.keys[i].child = Some(child);
        Ok(mem)
    }

    /// Splits the node after inserting `key`.
    ///
    /// Appending past the last key splits off just the new key, which keeps
    /// sequentially loaded trees full. Otherwise the split falls as near the
    /// middle as possible. Leaf splits never separate keys with equal fields;
    /// `None` means no such split point exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a packed key is invalid.
    pub fn split(&self, key: BtreeKey) -> CoreResult<Option<Split>> {
        let mut mem = self.to_mem()?;
        let pos = mem.insert(key);
        Ok(mem.split_grown(pos).ok())
    }

    /// Packed bytes.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the node is too large for 32-bit offsets.
    pub fn pack(&self) -> CoreResult<Bytes> {
        match self {
            Self::Mem(m) => m.pack(),
            Self::Db(d) => Ok(d.data.clone()),
        }
    }

    /// Size of the packed form.
    #[must_use]
    pub fn packed_size(&self) -> usize {
        match self {
            Self::Mem(m) => m.packed_size(),
            Self::Db(d) => d.data.len(),
        }
    }
}

impl From<MemNode> for BtreeNode {
    fn from(m: MemNode) -> Self {
        Self::Mem(m)
    }
}

impl PartialEq for BtreeNode {
    fn eq(&self, other: &Self) -> bool {
        if self.is_leaf() != other.is_leaf() || self.len() != other.len() {
            return false;
        }
        match (self.keys(), other.keys()) {
            (Ok(a), Ok(b)) => a
                .iter()
                .zip(&b)
                .all(|(x, y)| x == y && x.child == y.child),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;

    fn key(n: i64, adr: u64) -> BtreeKey {
        BtreeKey::new(RecordBuilder::new().int(n).build(), Address(adr))
    }

    fn leaf(keys: &[(i64, u64)]) -> BtreeNode {
        BtreeNode::Mem(MemNode::from_keys(
            true,
            keys.iter().map(|&(n, a)| key(n, a)).collect(),
        ))
    }

    #[test]
    fn with_keeps_order() {
        let mut node = BtreeNode::empty_leaf();
        for (n, a) in [(5, 8), (1, 16), (3, 24), (3, 8)] {
            node = node.with(key(n, a)).unwrap().into();
        }
        let keys = node.keys().unwrap();
        assert_eq!(keys, vec![key(1, 16), key(3, 8), key(3, 24), key(5, 8)]);
    }

    #[test]
    fn find_and_lower_bound() {
        let node = leaf(&[(10, 8), (20, 8), (30, 8)]);
        assert_eq!(node.find(&key(5, 0)).unwrap(), None);
        assert_eq!(node.find(&key(20, 8)).unwrap(), Some(1));
        assert_eq!(node.find(&key(25, 0)).unwrap(), Some(1));
        assert_eq!(node.find(&key(99, 0)).unwrap(), Some(2));
        assert_eq!(node.lower_bound(&key(20, 9)).unwrap(), 2);
        assert_eq!(node.lower_bound(&key(0, 0)).unwrap(), 0);
    }

    #[test]
    fn without_missing_is_none() {
        let node = leaf(&[(1, 8), (2, 8)]);
        assert!(node.without(&key(3, 8)).unwrap().is_none());
        let m = node.without(&key(1, 8)).unwrap().unwrap();
        assert_eq!(m.keys(), &[key(2, 8)]);
        assert_eq!(node.without_range(0, 2).unwrap().keys().len(), 0);
        assert!(node.without_range(1, 3).is_err());
    }

    #[test]
    fn pack_round_trip_leaf_and_interior() {
        let l = leaf(&[(1, 8), (2, 16), (3, 24)]);
        let db = BtreeNode::from_packed(l.pack().unwrap()).unwrap();
        assert!(matches!(db, BtreeNode::Db(_)));
        assert_eq!(db, l);
        assert_eq!(db.packed_size(), l.packed_size());

        let interior = BtreeNode::Mem(MemNode::from_keys(
            false,
            vec![
                BtreeKey::min().with_child(Address(800)),
                key(50, 8).minimize().with_child(Address(900)),
            ],
        ));
        let db = BtreeNode::from_packed(interior.pack().unwrap()).unwrap();
        assert_eq!(db, interior);
        assert_eq!(db.get(1).unwrap().child, Some(Address(900)));
        assert_eq!(db.get(1).unwrap().adr, Address::MAX);
    }

    #[test]
    fn db_node_upgrades_on_mutation() {
        let db = BtreeNode::from_packed(leaf(&[(1, 8), (3, 8)]).pack().unwrap()).unwrap();
        let m = db.with(key(2, 8)).unwrap();
        assert_eq!(m.keys().len(), 3);
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn from_packed_rejects_garbage() {
        assert!(BtreeNode::from_packed(Bytes::from_static(&[1, 0, 1, 0])).is_err());
        let mut bad = leaf(&[(1, 8)]).pack().unwrap().to_vec();
        bad[4] = 7;
        assert!(BtreeNode::from_packed(Bytes::from(bad)).is_err());
    }

    #[test]
    fn split_middle() {
        let node = leaf(&[(1, 8), (2, 8), (3, 8), (4, 8), (6, 8)]);
        let split = node.split(key(5, 8)).unwrap().unwrap();
        assert_eq!(split.left.keys().len() + split.right.keys().len(), node.len() + 1);
        assert!(split.left.keys().iter().all(|k| *k < split.separator));
        assert!(split.right.keys().iter().all(|k| split.separator <= *k));
    }

    #[test]
    fn split_append_takes_only_new_key() {
        let node = leaf(&[(1, 8), (2, 8), (3, 8)]);
        let split = node.split(key(4, 8)).unwrap().unwrap();
        assert_eq!(split.left.keys().len(), 3);
        assert_eq!(split.right.keys(), &[key(4, 8)]);
        assert_eq!(split.separator, key(3, 8).minimize());
    }

    #[test]
    fn split_never_separates_equal_fields() {
        let node = leaf(&[(1, 8), (2, 8), (2, 16), (2, 24), (2, 32)]);
        let split = node.split(key(2, 40)).unwrap().unwrap();
        assert_eq!(split.left.keys(), &[key(1, 8)]);
        assert_eq!(split.right.keys().len(), 5);

        let all_same = leaf(&[(7, 8), (7, 16)]);
        assert!(all_same.split(key(7, 24)).unwrap().is_none());
    }

    #[test]
    fn long_equal_run_packs_and_reopens() {
        let keys: Vec<BtreeKey> = (1..=70_000u64).map(|a| key(3, a * 8)).collect();
        let node = BtreeNode::Mem(MemNode::from_keys(true, keys));
        assert!(node.split(key(3, 8 * 70_001)).unwrap().is_none());

        let packed = node.pack().unwrap();
        assert_eq!(packed.len(), node.packed_size());
        let db = BtreeNode::from_packed(packed).unwrap();
        assert_eq!(db.len(), 70_000);
        assert_eq!(db.get(69_999).unwrap(), key(3, 8 * 70_000));
        assert_eq!(db.to_mem().unwrap().packed_size(), node.packed_size());
    }

    #[test]
    fn cached_size_follows_mutations() {
        let node = leaf(&[(1, 8), (2, 8), (3, 8), (4, 8)]);
        let fresh = |m: &MemNode| MemNode::from_keys(true, m.keys().to_vec()).packed_size();
        let grown = node.with(key(9, 8)).unwrap();
        assert_eq!(grown.packed_size(), fresh(&grown));
        let shrunk = node.without_range(1, 3).unwrap();
        assert_eq!(shrunk.packed_size(), fresh(&shrunk));
        let mut replaced = node.to_mem().unwrap();
        replaced.replace(0, BtreeKey::new(RecordBuilder::new().string("longer").build(), Address(8)));
        assert_eq!(replaced.packed_size(), fresh(&replaced));
    }

    #[test]
    fn interior_split_uses_right_key() {
        let keys = (0..5)
            .map(|i| key(i * 10, 8).minimize().with_child(Address(1000 + i as u64 * 8)))
            .collect();
        let node = BtreeNode::Mem(MemNode::from_keys(false, keys));
        let split = node
            .split(key(25, 8).minimize().with_child(Address(2000)))
            .unwrap()
            .unwrap();
        assert_eq!(split.separator.child, None);
        assert_eq!(split.separator, split.right.keys()[0]);
        assert_eq!(split.left.keys().len() + split.right.keys().len(), 6);
    }
}
