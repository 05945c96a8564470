//! On-page node layout.
//!
//! A node overlays a block's content region through an explicit
//! encode/decode boundary:
//!
//! ```text
//! offset 0:             tag (1 = leaf, 2 = inner)
//! offset 2:             key count, u16
//! offset 8:             keys[capacity], u64 LE
//! offset 8 + cap * 8:   children[capacity + 1], u64 LE
//! ```
//!
//! `children` always holds one more entry than `keys`. In an inner node
//! `children[i]` covers keys below `keys[i]` and the final child the
//! remainder. In a leaf, `children[i]` is the record id paired with
//! `keys[i]` and the final slot is the sibling link maintained by split and
//! merge bookkeeping.

use crate::error::{Error, Result};

const TAG_LEAF: u8 = 1;
const TAG_INNER: u8 = 2;

const TAG_OFFSET: usize = 0;
const KEY_COUNT_OFFSET: usize = 2;
const KEYS_OFFSET: usize = 8;

/// Smallest per-node key capacity the tree accepts; keeps split midpoints
/// and merge windows meaningful.
pub(crate) const MIN_CAPACITY: usize = 8;

/// Keys a node of `page_size` bytes can hold. The stable maximum visible to
/// other threads is one less; the last slot only carries a transient
/// overflow that the owning insertion resolves before unlocking.
pub(crate) fn capacity_for(page_size: usize) -> usize {
    page_size.saturating_sub(KEYS_OFFSET + 8) / 16
}

/// Decoded node contents. `children.len() == keys.len() + 1` always.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Node {
    pub leaf: bool,
    pub keys: Vec<u64>,
    pub children: Vec<u64>,
}

impl Node {
    /// A fresh empty leaf; the lone child slot is the (unset) sibling link.
    pub fn new_leaf() -> Self {
        Self {
            leaf: true,
            keys: Vec::new(),
            children: vec![0],
        }
    }

    pub fn decode(buf: &[u8], capacity: usize) -> Result<Self> {
        let needed = KEYS_OFFSET + (2 * capacity + 1) * 8;
        if buf.len() < needed {
            return Err(Error::Corruption("node page shorter than its layout"));
        }
        let leaf = match buf[TAG_OFFSET] {
            TAG_LEAF => true,
            TAG_INNER => false,
            _ => return Err(Error::Corruption("unknown node tag")),
        };
        let count = u16::from_le_bytes(
            buf[KEY_COUNT_OFFSET..KEY_COUNT_OFFSET + 2]
                .try_into()
                .expect("2 bytes"),
        ) as usize;
        if count > capacity {
            return Err(Error::Corruption("node key count exceeds capacity"));
        }
        let word = |offset: usize| {
            u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8 bytes"))
        };
        let keys = (0..count).map(|i| word(KEYS_OFFSET + i * 8)).collect();
        let children_offset = KEYS_OFFSET + capacity * 8;
        let children = (0..=count).map(|i| word(children_offset + i * 8)).collect();
        Ok(Self {
            leaf,
            keys,
            children,
        })
    }

    /// Writes the node back into `buf`. Bytes past the live prefix are left
    /// untouched; decode never reads them.
    pub fn encode(&self, buf: &mut [u8], capacity: usize) {
        debug_assert!(self.keys.len() <= capacity);
        debug_assert_eq!(self.children.len(), self.keys.len() + 1);
        buf[TAG_OFFSET] = if self.leaf { TAG_LEAF } else { TAG_INNER };
        buf[KEY_COUNT_OFFSET..KEY_COUNT_OFFSET + 2]
            .copy_from_slice(&(self.keys.len() as u16).to_le_bytes());
        for (i, key) in self.keys.iter().enumerate() {
            buf[KEYS_OFFSET + i * 8..KEYS_OFFSET + i * 8 + 8].copy_from_slice(&key.to_le_bytes());
        }
        let children_offset = KEYS_OFFSET + capacity * 8;
        for (i, child) in self.children.iter().enumerate() {
            buf[children_offset + i * 8..children_offset + i * 8 + 8]
                .copy_from_slice(&child.to_le_bytes());
        }
    }

    /// Index of the child subtree covering `key`: the first slot whose key
    /// is strictly greater, or the final child.
    pub fn child_index(&self, key: u64) -> usize {
        self.keys
            .iter()
            .position(|&k| key < k)
            .unwrap_or(self.keys.len())
    }

    /// Inserts a (key, child) pair at `index`, shifting greater entries
    /// right.
    pub fn insert_at(&mut self, index: usize, key: u64, child: u64) {
        self.keys.insert(index, key);
        self.children.insert(index, child);
    }
}

/// Cheap classifier used by the buffer pool's inner-node hook.
pub(crate) fn peek_is_inner(buf: &[u8]) -> bool {
    buf.first() == Some(&TAG_INNER)
}
