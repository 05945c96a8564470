//! Fixed-size record payloads over their own block file.

use std::path::Path;

use crate::error::Result;
use crate::store::{BlockId, BlockStore};

/// Store for the opaque fixed-size payloads referenced by leaf entries.
///
/// Record ids are independent of index node ids; the tree serializes access
/// to each record through the owning leaf's lock.
pub struct RecordStore {
    store: BlockStore,
}

impl RecordStore {
    /// Opens or creates the record file at `path`.
    pub fn open(path: impl AsRef<Path>, record_size: usize) -> Result<Self> {
        Ok(Self {
            store: BlockStore::open(path, record_size)?,
        })
    }

    /// Size of every record payload in bytes.
    pub fn record_size(&self) -> usize {
        self.store.block_size()
    }

    /// Allocates a record and returns its id together with a blank payload.
    pub fn create_record(&self) -> Result<(BlockId, Vec<u8>)> {
        self.store.create_block()
    }

    /// Reads a record's payload.
    pub fn read_record(&self, id: BlockId) -> Result<Vec<u8>> {
        self.store.read_block(id)
    }

    /// Overwrites a record's payload; `payload` must be exactly
    /// [`record_size`](Self::record_size) bytes.
    pub fn write_record(&self, id: BlockId, payload: &[u8]) -> Result<()> {
        self.store.write_block(id, payload)
    }

    /// Returns a record's block to the free list.
    pub fn delete_record(&self, id: BlockId) -> Result<()> {
        self.store.delete_block(id)
    }

    /// Number of live records.
    pub fn len(&self) -> u64 {
        self.store.entry_count()
    }

    /// Whether no records are allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
