//! Block-file allocator.
//!
//! A block file is a fixed header followed by fixed-size blocks. Unused
//! blocks form a singly linked free list threaded through their own
//! trailers, so deleted ids are reused before the file ever grows.
//!
//! ```text
//! offset 0:                  Header { block_size, total_blocks,
//!                                     free_blocks, free_list_head }  (4 x u64, LE)
//! offset 32 + id * stride:   content[block_size] | used: u8 | next_free: u64
//! ```

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

mod records;

pub use records::RecordStore;

/// Stable identifier of an allocated disk block. Ids are reused after
/// deletion.
pub type BlockId = u64;

/// Serialized size of the file header.
const HEADER_LEN: u64 = 32;
/// Per-block trailer: one `used` byte plus the free-list successor id.
const TRAILER_LEN: u64 = 9;

/// In-memory copy of the file header; the single source of truth for
/// allocation state, flushed synchronously on every mutation.
#[derive(Clone, Copy, Debug)]
struct Header {
    block_size: u64,
    total_blocks: u64,
    free_blocks: u64,
    free_list_head: u64,
}

impl Header {
    fn decode(buf: &[u8; 32]) -> Self {
        let word = |i: usize| u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().expect("8 bytes"));
        Self {
            block_size: word(0),
            total_blocks: word(1),
            free_blocks: word(2),
            free_list_head: word(3),
        }
    }

    fn encode(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        for (i, word) in [
            self.block_size,
            self.total_blocks,
            self.free_blocks,
            self.free_list_head,
        ]
        .into_iter()
        .enumerate()
        {
            buf[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        buf
    }
}

/// Allocator over one block file.
///
/// The header mutex serializes allocation state; raw content reads and
/// writes for a given id are deliberately outside it, so callers must
/// serialize access to each id themselves.
#[derive(Debug)]
pub struct BlockStore {
    file: std::fs::File,
    block_size: usize,
    header: Mutex<Header>,
}

impl BlockStore {
    /// Opens or creates the block file at `path`.
    ///
    /// An existing file must have been created with the same block size;
    /// anything else is a fatal open error.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if block_size == 0 {
            return Err(Error::InvalidArgument("block size must be non-zero".into()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let header = if file.metadata()?.len() == 0 {
            let header = Header {
                block_size: block_size as u64,
                total_blocks: 0,
                free_blocks: 0,
                free_list_head: 0,
            };
            file.write_all_at(&header.encode(), 0)?;
            debug!(path = %path.display(), block_size, "store.create");
            header
        } else {
            let mut buf = [0u8; 32];
            file.read_exact_at(&mut buf, 0)?;
            let header = Header::decode(&buf);
            if header.block_size != block_size as u64 {
                return Err(Error::BlockSizeMismatch {
                    expected: block_size as u64,
                    found: header.block_size,
                });
            }
            debug!(
                path = %path.display(),
                total = header.total_blocks,
                free = header.free_blocks,
                "store.open"
            );
            header
        };
        Ok(Self {
            file,
            block_size,
            header: Mutex::new(header),
        })
    }

    /// Content size of each block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of live blocks (total minus free).
    pub fn entry_count(&self) -> u64 {
        let header = self.header.lock();
        header.total_blocks - header.free_blocks
    }

    /// Allocates a block, reusing the free-list head when one exists and
    /// appending at end-of-file otherwise. Returns the id and a blank
    /// payload; the header is flushed before returning.
    pub fn create_block(&self) -> Result<(BlockId, Vec<u8>)> {
        let mut header = self.header.lock();
        let id = if header.free_blocks > 0 {
            let id = header.free_list_head;
            let next = self.read_next_free(id)?;
            self.write_used(id, true)?;
            header.free_list_head = next;
            header.free_blocks -= 1;
            id
        } else {
            let id = header.total_blocks;
            let mut block = vec![0u8; self.stride() as usize];
            block[self.block_size] = 1; // used flag
            self.file.write_all_at(&block, self.block_offset(id))?;
            header.total_blocks += 1;
            id
        };
        self.flush_header(&header)?;
        Ok((id, vec![0u8; self.block_size]))
    }

    /// Returns a block to the free list. Deleting an already-free block is a
    /// no-op.
    pub fn delete_block(&self, id: BlockId) -> Result<()> {
        let mut header = self.header.lock();
        if id >= header.total_blocks {
            return Err(Error::InvalidArgument(format!(
                "block {id} beyond allocated range {}",
                header.total_blocks
            )));
        }
        if !self.read_used(id)? {
            return Ok(());
        }
        self.write_used(id, false)?;
        self.write_next_free(id, header.free_list_head)?;
        header.free_list_head = id;
        header.free_blocks += 1;
        self.flush_header(&header)
    }

    /// Reads one block's content bytes. Uncached; every call touches storage.
    pub fn read_block(&self, id: BlockId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        self.file.read_exact_at(&mut buf, self.block_offset(id))?;
        Ok(buf)
    }

    /// Writes one block's content bytes. Uncached; every call touches storage.
    pub fn write_block(&self, id: BlockId, content: &[u8]) -> Result<()> {
        if content.len() != self.block_size {
            return Err(Error::InvalidArgument(format!(
                "content of {} bytes does not fill a {}-byte block",
                content.len(),
                self.block_size
            )));
        }
        self.file.write_all_at(content, self.block_offset(id))?;
        Ok(())
    }

    fn stride(&self) -> u64 {
        self.block_size as u64 + TRAILER_LEN
    }

    fn block_offset(&self, id: BlockId) -> u64 {
        HEADER_LEN + id * self.stride()
    }

    fn flush_header(&self, header: &Header) -> Result<()> {
        self.file.write_all_at(&header.encode(), 0)?;
        Ok(())
    }

    fn read_used(&self, id: BlockId) -> Result<bool> {
        let mut flag = [0u8; 1];
        self.file
            .read_exact_at(&mut flag, self.block_offset(id) + self.block_size as u64)?;
        Ok(flag[0] != 0)
    }

    fn write_used(&self, id: BlockId, used: bool) -> Result<()> {
        self.file
            .write_all_at(&[used as u8], self.block_offset(id) + self.block_size as u64)?;
        Ok(())
    }

    fn read_next_free(&self, id: BlockId) -> Result<BlockId> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, self.block_offset(id) + self.block_size as u64 + 1)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_next_free(&self, id: BlockId, next: BlockId) -> Result<()> {
        self.file.write_all_at(
            &next.to_le_bytes(),
            self.block_offset(id) + self.block_size as u64 + 1,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const BLOCK_SIZE: usize = 256;

    fn file_len(store: &BlockStore) -> u64 {
        store.file.metadata().unwrap().len()
    }

    #[test]
    fn creates_sequential_ids_and_stores_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks"), BLOCK_SIZE).unwrap();
        for i in 0..100u64 {
            let (id, blank) = store.create_block().unwrap();
            assert_eq!(id, i);
            assert!(blank.iter().all(|&b| b == 0));
            let mut content = blank;
            content.fill((i % 100) as u8);
            store.write_block(id, &content).unwrap();
            assert_eq!(store.entry_count(), i + 1);
        }
        for i in 0..100u64 {
            let content = store.read_block(i).unwrap();
            assert!(content.iter().all(|&b| b == (i % 100) as u8));
        }
    }

    #[test]
    fn delete_shrinks_entry_count_but_not_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks"), BLOCK_SIZE).unwrap();
        for i in 0..100u64 {
            let (id, _) = store.create_block().unwrap();
            let content = vec![(id % 100) as u8; BLOCK_SIZE];
            store.write_block(id, &content).unwrap();
            if i % 2 == 0 {
                let before = store.entry_count();
                store.delete_block(id).unwrap();
                assert_eq!(store.entry_count(), before - 1);
            }
        }
        let expected = HEADER_LEN + 100 * (BLOCK_SIZE as u64 + TRAILER_LEN);
        assert_eq!(file_len(&store), expected);
    }

    #[test]
    fn deleting_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks"), BLOCK_SIZE).unwrap();
        let (id, _) = store.create_block().unwrap();
        store.delete_block(id).unwrap();
        let free_count = store.entry_count();
        store.delete_block(id).unwrap();
        assert_eq!(store.entry_count(), free_count);
    }

    #[test]
    fn freed_ids_are_reused_before_the_file_grows() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks"), BLOCK_SIZE).unwrap();
        for _ in 0..50 {
            store.create_block().unwrap();
        }
        let len_before = file_len(&store);
        for id in (0..50u64).rev() {
            store.delete_block(id).unwrap();
        }
        // ids come back most-recently-freed first
        let (id, _) = store.create_block().unwrap();
        assert_eq!(id, 0);
        for _ in 0..49 {
            store.create_block().unwrap();
        }
        assert_eq!(store.entry_count(), 50);
        assert_eq!(file_len(&store), len_before);
    }

    #[test]
    fn reopen_preserves_contents_and_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        {
            let store = BlockStore::open(&path, BLOCK_SIZE).unwrap();
            for i in 0..20u64 {
                let (id, _) = store.create_block().unwrap();
                store.write_block(id, &vec![i as u8; BLOCK_SIZE]).unwrap();
            }
            store.delete_block(7).unwrap();
        }
        let store = BlockStore::open(&path, BLOCK_SIZE).unwrap();
        assert_eq!(store.entry_count(), 19);
        assert_eq!(store.read_block(3).unwrap(), vec![3u8; BLOCK_SIZE]);
        let (id, _) = store.create_block().unwrap();
        assert_eq!(id, 7);
    }

    #[test]
    fn mismatched_block_size_is_a_fatal_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        BlockStore::open(&path, BLOCK_SIZE).unwrap();
        match BlockStore::open(&path, BLOCK_SIZE * 2) {
            Err(Error::BlockSizeMismatch { expected, found }) => {
                assert_eq!(expected, (BLOCK_SIZE * 2) as u64);
                assert_eq!(found, BLOCK_SIZE as u64);
            }
            other => panic!("expected block size mismatch, got {other:?}"),
        }
    }

    #[test]
    fn wrong_sized_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks"), BLOCK_SIZE).unwrap();
        let (id, _) = store.create_block().unwrap();
        assert!(store.write_block(id, &[0u8; 16]).is_err());
    }

    #[test]
    fn concurrent_create_write_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path().join("blocks"), BLOCK_SIZE).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    let (id, _) = store.create_block().unwrap();
                    let content = vec![(id % 100) as u8; BLOCK_SIZE];
                    store.write_block(id, &content).unwrap();
                    assert_eq!(store.read_block(id).unwrap(), content);
                    store.delete_block(id).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.entry_count(), 0);
    }
}
