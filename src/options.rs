//! Construction-time configuration.

use crate::error::{Error, Result};
use crate::tree::node;

/// Configuration options for [`crate::BTree::open`].
///
/// These control the node page size, the record payload size, buffer pool
/// capacity, and the two opportunistic maintenance features together with
/// their sampling tunables.
#[derive(Clone, Debug)]
pub struct BTreeOptions {
    /// Size of each index node block in bytes (e.g. 4096).
    pub page_size: usize,
    /// Fixed size of every record payload in bytes.
    pub record_size: usize,
    /// Number of node pages the buffer pool keeps in memory.
    pub cache_pages: usize,
    /// Whether hot leaves are split pre-emptively on detected contention.
    pub contention_split: bool,
    /// Whether the pool may merge cold sibling subtrees instead of evicting.
    pub eviction_merge: bool,
    /// Probability of recording a contention sample on a qualifying update.
    pub d1: f64,
    /// Probability of evaluating the recorded samples (must be <= `d1`).
    pub d2: f64,
    /// Slow-path ratio above which a leaf is considered contended.
    pub d3: f64,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            record_size: 128,
            cache_pages: 128,
            contention_split: true,
            eviction_merge: true,
            d1: 0.05,
            d2: 0.01,
            d3: 0.8,
        }
    }
}

impl BTreeOptions {
    /// Checks that the options describe a usable tree.
    pub fn validate(&self) -> Result<()> {
        let capacity = node::capacity_for(self.page_size);
        if capacity < node::MIN_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "page size {} holds only {} keys per node, need at least {}",
                self.page_size,
                capacity,
                node::MIN_CAPACITY
            )));
        }
        if capacity > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "page size {} exceeds the on-page key count encoding",
                self.page_size
            )));
        }
        if self.record_size == 0 {
            return Err(Error::InvalidArgument("record size must be non-zero".into()));
        }
        if self.cache_pages < 8 {
            return Err(Error::InvalidArgument(format!(
                "cache of {} pages is too small to pin a root-to-leaf path",
                self.cache_pages
            )));
        }
        for (name, value) in [("d1", self.d1), ("d2", self.d2), ("d3", self.d3)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidArgument(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }
        if self.d2 > self.d1 {
            return Err(Error::InvalidArgument(format!(
                "d2 ({}) must not exceed d1 ({})",
                self.d2, self.d1
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BTreeOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_tiny_pages() {
        let options = BTreeOptions {
            page_size: 64,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn rejects_inverted_probabilities() {
        let options = BTreeOptions {
            d1: 0.01,
            d2: 0.05,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
