//! Embeddable disk-resident concurrent B+ tree index.
//!
//! The crate is built from three tightly coupled layers: a block-file
//! allocator with an on-disk free list ([`store`]), a fixed-capacity
//! pinned-page buffer pool with clock replacement ([`buffer`]), and the
//! lock-coupled B+ tree itself ([`tree`]). The tree drives the pool and two
//! allocator instances (index nodes and record payloads); the pool calls
//! back into tree-supplied hooks only at eviction time, giving the tree a
//! chance to reclaim cache space by merging cold sibling subtrees instead
//! of evicting.

#![warn(missing_docs)]

pub mod buffer;
pub mod error;
pub mod options;
pub mod store;
pub mod tree;

pub use error::{Error, Result};
pub use options::BTreeOptions;
pub use tree::BTree;
