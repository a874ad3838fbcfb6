//! Persistent copy-on-write B-tree.
//!
//! A [`Btree`] is a root address plus a map of dirty nodes. Nodes reached
//! through stored addresses are read from [`Storage`] and never modified;
//! every change copies the path from the leaf to the root into dirty nodes
//! with provisional addresses. [`Btree::store`] appends the dirty nodes
//! children-first and leaves a tree whose every address is real.
//!
//! Cloning a tree is cheap and gives an independent version: both share the
//! stored nodes and their own copy of the dirty map.
//!
//! ## Interior Nodes
//!
//! Entry `i` of an interior node covers keys from its separator up to the
//! next entry's separator. The first entry always carries the minimum key,
//! so descent takes `find(key).unwrap_or(0)`.

use super::key::BtreeKey;
use super::node::{BtreeNode, MemNode};
use crate::error::{CoreError, CoreResult};
use crate::storage::{BlockType, Storage};
use crate::types::Address;
use std::collections::HashMap;
use std::sync::Arc;

type PathEntry = (Address, Arc<BtreeNode>, usize);

/// A persistent B-tree over [`BtreeKey`]s.
#[derive(Clone)]
pub struct Btree {
    storage: Arc<Storage>,
    node_size: usize,
    root: Address,
    levels: usize,
    dirty: HashMap<Address, Arc<BtreeNode>>,
    next_temp: u64,
}

impl Btree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new(storage: Arc<Storage>, node_size: usize) -> Self {
        let mut tree = Self {
            storage,
            node_size,
            root: Address::NULL,
            levels: 0,
            dirty: HashMap::new(),
            next_temp: 0,
        };
        tree.root = tree.put_dirty(Address::NULL, BtreeNode::empty_leaf());
        tree
    }

    /// Opens a stored tree.
    #[must_use]
    pub fn open(storage: Arc<Storage>, root: Address, levels: usize, node_size: usize) -> Self {
        Self {
            storage,
            node_size,
            root,
            levels,
            dirty: HashMap::new(),
            next_temp: 0,
        }
    }

    /// Root address. Provisional while the tree has unsaved changes.
    #[must_use]
    pub fn root(&self) -> Address {
        self.root
    }

    /// Number of interior levels above the leaves.
    #[must_use]
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Returns true if the tree has unsaved nodes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Loads the node at `adr`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if a stored node is invalid, or `Internal` for an
    /// unknown provisional address.
    pub fn node(&self, adr: Address) -> CoreResult<Arc<BtreeNode>> {
        if adr.is_temp() {
            return self
                .dirty
                .get(&adr)
                .cloned()
                .ok_or_else(|| CoreError::internal(format!("unknown dirty node {adr}")));
        }
        let block = self.storage.read_block(adr)?;
        if block.block_type != BlockType::Other {
            return Err(CoreError::corrupted(adr.0, "expected a node block"));
        }
        BtreeNode::from_packed(block.payload)
            .map(Arc::new)
            .map_err(|e| CoreError::corrupted(adr.0, e.to_string()))
    }

    fn put_dirty(&mut self, old: Address, node: BtreeNode) -> Address {
        let adr = if old.is_temp() {
            old
        } else {
            self.next_temp += 1;
            Address::temp(self.next_temp)
        };
        self.dirty.insert(adr, Arc::new(node));
        adr
    }

    fn descend(&self, key: &BtreeKey) -> CoreResult<(Vec<PathEntry>, Address)> {
        let mut path = Vec::with_capacity(self.levels);
        let mut adr = self.root;
        for _ in 0..self.levels {
            let node = self.node(adr)?;
            let i = node.find(key)?.unwrap_or(0);
            let child = node
                .get(i)?
                .child
                .ok_or_else(|| CoreError::corrupted(adr.0, "interior entry without child"))?;
            path.push((adr, node, i));
            adr = child;
        }
        Ok((path, adr))
    }

    /// Takes a node for modification. A dirty node held only by this tree is
    /// reused in place; anything else is copied.
    fn take_mem(&mut self, adr: Address) -> CoreResult<MemNode> {
        if let Some(node) = self.dirty.remove(&adr) {
            return match Arc::try_unwrap(node) {
                Ok(BtreeNode::Mem(mem)) => Ok(mem),
                Ok(node) => node.to_mem(),
                Err(shared) => shared.to_mem(),
            };
        }
        self.node(adr)?.to_mem()
    }

    /// Inserts a key, splitting nodes up the path as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn insert(&mut self, key: BtreeKey) -> CoreResult<()> {
        let (path, leaf_adr) = self.descend(&key)?;
        let leaf = self.take_mem(leaf_adr)?;
        let (mut adr, mut pending) = self.insert_into(leaf_adr, leaf, key);

        for (parent_adr, parent, i) in path.into_iter().rev() {
            let node = parent.with_child(i, adr)?;
            match pending.take() {
                None => adr = self.put_dirty(parent_adr, node.into()),
                Some(sep) => (adr, pending) = self.insert_into(parent_adr, node, sep),
            }
        }

        if let Some(sep) = pending {
            let root = MemNode::from_keys(false, vec![BtreeKey::min().with_child(adr), sep]);
            adr = self.put_dirty(Address::NULL, root.into());
            self.levels += 1;
        }
        self.root = adr;
        Ok(())
    }

    /// Adds `key` to `node`, returning the node's new address and the
    /// separator for a split-off right sibling.
    fn insert_into(
        &mut self,
        adr: Address,
        mut node: MemNode,
        key: BtreeKey,
    ) -> (Address, Option<BtreeKey>) {
        let pos = node.insert(key);
        if node.packed_size() <= self.node_size {
            return (self.put_dirty(adr, node.into()), None);
        }
        match node.split_grown(pos) {
            Ok(split) => {
                let left = self.put_dirty(adr, split.left.into());
                let right = self.put_dirty(Address::NULL, split.right.into());
                (left, Some(split.separator.with_child(right)))
            }
            Err(grown) => (self.put_dirty(adr, grown.into()), None),
        }
    }

    /// Removes a key. Returns false if it was not present.
    ///
    /// Empty leaves are unlinked from their parents and a root with a single
    /// child is replaced by that child.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn remove(&mut self, key: &BtreeKey) -> CoreResult<bool> {
        let (path, leaf_adr) = self.descend(key)?;
        let leaf = self.node(leaf_adr)?;
        let Some(mem) = leaf.without(key)? else {
            return Ok(false);
        };

        let mut unlink = mem.keys().is_empty() && !path.is_empty();
        let mut adr = if unlink {
            self.dirty.remove(&leaf_adr);
            Address::NULL
        } else {
            self.put_dirty(leaf_adr, mem.into())
        };

        for (depth, (parent_adr, parent, i)) in path.into_iter().enumerate().rev() {
            let mut mem = if unlink {
                let mut mem = parent.without_index(i)?;
                if i == 0 {
                    if let Some(first) = mem.keys().first().cloned() {
                        let child = first.child.unwrap_or_default();
                        mem.replace(0, BtreeKey::min().with_child(child));
                    }
                }
                mem
            } else {
                parent.with_child(i, adr)?
            };
            unlink = mem.keys().is_empty() && depth > 0;
            if unlink {
                self.dirty.remove(&parent_adr);
                adr = Address::NULL;
            } else if mem.keys().is_empty() {
                mem = MemNode::new(true);
                self.levels = 0;
                adr = self.put_dirty(parent_adr, mem.into());
            } else {
                adr = self.put_dirty(parent_adr, mem.into());
            }
        }
        self.root = adr;

        while self.levels > 0 {
            let root = self.node(self.root)?;
            if root.len() != 1 {
                break;
            }
            let child = root
                .get(0)?
                .child
                .ok_or_else(|| CoreError::corrupted(self.root.0, "interior entry without child"))?;
            self.dirty.remove(&self.root);
            self.root = child;
            self.levels -= 1;
        }
        Ok(true)
    }

    /// Returns true if the exact key is present.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn contains(&self, key: &BtreeKey) -> CoreResult<bool> {
        let (_, leaf_adr) = self.descend(key)?;
        let leaf = self.node(leaf_adr)?;
        let i = leaf.lower_bound(key)?;
        Ok(i < leaf.len() && leaf.get(i)? == *key)
    }

    /// Iterates all keys in order.
    #[must_use]
    pub fn iter(&self) -> BtreeIter<'_> {
        self.seek(&BtreeKey::min())
    }

    /// Iterates keys greater than or equal to `key`.
    #[must_use]
    pub fn seek(&self, key: &BtreeKey) -> BtreeIter<'_> {
        let mut iter = BtreeIter {
            tree: self,
            stack: Vec::new(),
            upper: None,
            error: None,
            finished: false,
        };
        if let Err(e) = iter.position(key) {
            iter.error = Some(e);
        }
        iter
    }

    /// Iterates keys in `[from, to)`.
    #[must_use]
    pub fn range(&self, from: &BtreeKey, to: &BtreeKey) -> BtreeIter<'_> {
        let mut iter = self.seek(from);
        iter.upper = Some(to.clone());
        iter
    }

    /// Counts the keys.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn count(&self) -> CoreResult<usize> {
        self.iter().try_fold(0, |n, k| k.map(|_| n + 1))
    }

    /// Counts the nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if a node cannot be read.
    pub fn node_count(&self) -> CoreResult<usize> {
        self.count_nodes(self.root, self.levels)
    }

    fn count_nodes(&self, adr: Address, level: usize) -> CoreResult<usize> {
        if level == 0 {
            return Ok(1);
        }
        let node = self.node(adr)?;
        let mut n = 1;
        for key in node.keys()? {
            let child = key
                .child
                .ok_or_else(|| CoreError::corrupted(adr.0, "interior entry without child"))?;
            n += self.count_nodes(child, level - 1)?;
        }
        Ok(n)
    }

    /// Appends every dirty node, children first, and returns the stored root.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a leaf still references a provisional record,
    /// or a storage error if an append fails.
    pub fn store(&mut self) -> CoreResult<Address> {
        let root = self.store_node(self.root)?;
        self.root = root;
        self.dirty.clear();
        self.next_temp = 0;
        Ok(root)
    }

    fn store_node(&self, adr: Address) -> CoreResult<Address> {
        if !adr.is_temp() {
            return Ok(adr);
        }
        let node = self.node(adr)?;
        let mut mem = node.to_mem()?;
        if node.is_leaf() {
            if let Some(k) = mem.keys().iter().find(|k| k.adr.is_temp()) {
                return Err(CoreError::internal(format!(
                    "storing a leaf that references provisional record {}",
                    k.adr
                )));
            }
        } else {
            for i in 0..mem.keys().len() {
                let key = mem.keys()[i].clone();
                let child = key
                    .child
                    .ok_or_else(|| CoreError::internal("interior entry without child"))?;
                let stored = self.store_node(child)?;
                if stored != child {
                    mem.replace(i, key.with_child(stored));
                }
            }
        }
        self.storage
            .append_block(BlockType::Other, &BtreeNode::Mem(mem).pack()?, 0)
    }
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree")
            .field("root", &self.root)
            .field("levels", &self.levels)
            .field("dirty", &self.dirty.len())
            .finish_non_exhaustive()
    }
}

/// In-order iterator over a [`Btree`].
///
/// Yields `CoreResult` items; the first error ends the iteration.
pub struct BtreeIter<'a> {
    tree: &'a Btree,
    stack: Vec<(Arc<BtreeNode>, usize)>,
    upper: Option<BtreeKey>,
    error: Option<CoreError>,
    finished: bool,
}

enum Step {
    Pop,
    Yield(BtreeKey),
    Descend(Address),
}

impl BtreeIter<'_> {
    fn position(&mut self, key: &BtreeKey) -> CoreResult<()> {
        let mut adr = self.tree.root;
        loop {
            let node = self.tree.node(adr)?;
            if node.is_leaf() {
                let j = node.lower_bound(key)?;
                self.stack.push((node, j));
                return Ok(());
            }
            let i = node.find(key)?.unwrap_or(0);
            let child = node
                .get(i)?
                .child
                .ok_or_else(|| CoreError::corrupted(adr.0, "interior entry without child"))?;
            self.stack.push((node, i));
            adr = child;
        }
    }

    fn step(&mut self) -> CoreResult<Option<Step>> {
        let Some((node, i)) = self.stack.last_mut() else {
            return Ok(None);
        };
        if *i >= node.len() {
            return Ok(Some(Step::Pop));
        }
        let key = node.get(*i)?;
        if node.is_leaf() {
            *i += 1;
            return Ok(Some(Step::Yield(key)));
        }
        let child = key
            .child
            .ok_or_else(|| CoreError::internal("interior entry without child"))?;
        Ok(Some(Step::Descend(child)))
    }
}

impl Iterator for BtreeIter<'_> {
    type Item = CoreResult<BtreeKey>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Some(e) = self.error.take() {
            self.finished = true;
            return Some(Err(e));
        }
        loop {
            match self.step() {
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Ok(Some(Step::Pop)) => {
                    self.stack.pop();
                    if let Some((_, i)) = self.stack.last_mut() {
                        *i += 1;
                    }
                }
                Ok(Some(Step::Yield(key))) => {
                    if self.upper.as_ref().is_some_and(|u| key >= *u) {
                        self.finished = true;
                        return None;
                    }
                    return Some(Ok(key));
                }
                Ok(Some(Step::Descend(child))) => match self.tree.node(child) {
                    Ok(node) => self.stack.push((node, 0)),
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                },
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
