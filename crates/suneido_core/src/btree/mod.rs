//! Copy-on-write B-trees for table indexes.
//!
//! - [`BtreeKey`]: an index entry ordered by key fields then data address
//! - [`BtreeNode`]: a node, either freshly built in memory or read from storage
//! - [`Btree`]: a persistent tree with dirty-node tracking
//! - [`BtreeIndex`]: a tree bound to a table index definition
//!
//! ## Invariants
//!
//! - Keys within a node are strictly ascending.
//! - A stored node never changes; updates produce new nodes.
//! - All leaves are at the same depth.

mod index;
mod key;
mod node;
mod tree;

pub use index::BtreeIndex;
pub use key::BtreeKey;
pub use node::{BtreeNode, DbNode, MemNode, Split};
pub use tree::{Btree, BtreeIter};
