//! Concurrent disk-resident B+ tree.
//!
//! Keys are `u64`; values are opaque fixed-size records held in a separate
//! block file and addressed from leaf entries. Index nodes live behind the
//! buffer pool; all traversal is lock-coupled parent-before-child. The two
//! opportunistic maintenance features (contention splits and eviction-time
//! merges) are wired in here: the first from the update path, the second
//! through the hooks handed to the pool at construction.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::buffer::{
    BufferPool, PageReadGuard, PageRef, PageWriteGuard, PoolHooks, PoolStats, ReclaimScope,
};
use crate::error::{Error, Result};
use crate::options::BTreeOptions;
use crate::store::{BlockId, RecordStore};

pub(crate) mod node;
mod xmerge;


use node::Node;

/// The root always occupies block 0 of the index file and its id never
/// changes; root overflow relocates content, not the root itself.
const ROOT_BLOCK: BlockId = 0;

/// Counters for the adaptive contention machinery.
#[derive(Clone, Copy, Debug, Default)]
pub struct TreeStats {
    /// Lock upgrades attempted after a positive contention evaluation.
    pub contention_split_attempts: u64,
    /// Upgrades that re-validated and actually split the leaf.
    pub contention_splits: u64,
}

/// Hooks the tree installs into its buffer pool. Classification reads only
/// the node tag; reclaim defers to the eviction-time merge.
struct TreeHooks {
    merge_enabled: bool,
    capacity: usize,
}

impl PoolHooks for TreeHooks {
    fn classify_inner(&self, buf: &[u8]) -> bool {
        node::peek_is_inner(buf)
    }

    fn attempt_reclaim(&self, scope: &mut ReclaimScope<'_>, target: BlockId) -> Result<bool> {
        if !self.merge_enabled {
            return Ok(false);
        }
        xmerge::attempt(scope, target, self.capacity)
    }
}

/// Ordered key-to-record index over two backing block files.
///
/// All operations take `&self` and may run from any number of threads.
/// Destruction flushes dirty pages; it must only happen once every
/// operation has quiesced, which Rust's ownership rules already guarantee.
pub struct BTree {
    pool: BufferPool,
    records: RecordStore,
    options: BTreeOptions,
    capacity: usize,
    root: BlockId,
    contention_attempts: AtomicU64,
    contention_splits: AtomicU64,
}

impl BTree {
    /// Opens or creates a tree over the given index and record files.
    ///
    /// Reopening existing files validates their stored block sizes against
    /// the configured ones. A fresh index file is seeded with an empty root
    /// leaf, so the tree always holds at least one page.
    pub fn open(
        index_path: impl AsRef<Path>,
        record_path: impl AsRef<Path>,
        options: BTreeOptions,
    ) -> Result<Self> {
        options.validate()?;
        let capacity = node::capacity_for(options.page_size);
        let hooks: Arc<dyn PoolHooks> = Arc::new(TreeHooks {
            merge_enabled: options.eviction_merge,
            capacity,
        });
        let pool = BufferPool::open(
            index_path,
            options.page_size,
            options.cache_pages,
            Some(hooks),
        )?;
        let records = RecordStore::open(record_path, options.record_size)?;
        let tree = Self {
            pool,
            records,
            options,
            capacity,
            root: ROOT_BLOCK,
            contention_attempts: AtomicU64::new(0),
            contention_splits: AtomicU64::new(0),
        };
        if tree.pool.entry_count() == 0 {
            let id = tree.pool.new_page()?;
            if id != ROOT_BLOCK {
                return Err(Error::Corruption("fresh index file did not start empty"));
            }
            let page = tree.pin_spin(id, false)?;
            {
                let mut guard = page.buf.write_arc();
                Node::new_leaf().encode(&mut guard, capacity);
            }
            tree.pool.unpin_page(id, true);
            debug!(capacity, "tree.create");
        }
        Ok(tree)
    }

    /// Number of stored records.
    pub fn len(&self) -> u64 {
        self.records.len()
    }

    /// Whether the tree holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Contention counters.
    pub fn stats(&self) -> TreeStats {
        TreeStats {
            contention_split_attempts: self.contention_attempts.load(Ordering::Relaxed),
            contention_splits: self.contention_splits.load(Ordering::Relaxed),
        }
    }

    /// Buffer pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Writes every unpinned dirty page back to disk.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush()
    }

    /// Looks up `key` and returns a copy of its record.
    pub fn find(&self, key: u64) -> Result<Option<Vec<u8>>> {
        let mut page = self.pin_spin(self.root, true)?;
        let mut guard: PageReadGuard = page.buf.read_arc();
        loop {
            let node = Node::decode(&guard, self.capacity)?;
            if node.leaf {
                let result = match node.keys.iter().position(|&k| k == key) {
                    Some(index) => Some(self.records.read_record(node.children[index])?),
                    None => None,
                };
                drop(guard);
                self.pool.unpin_page(page.id, false);
                return Ok(result);
            }
            let next_id = node.children[node.child_index(key)];
            let next = self.pin_spin(next_id, true)?;
            let next_guard = next.buf.read_arc();
            drop(guard);
            self.pool.unpin_page(page.id, false);
            page = next;
            guard = next_guard;
        }
    }

    /// Whether `key` is present. Separator keys in inner nodes are copies of
    /// live leaf keys, so a match at any level answers immediately.
    pub fn contains(&self, key: u64) -> Result<bool> {
        let mut page = self.pin_spin(self.root, true)?;
        let mut guard: PageReadGuard = page.buf.read_arc();
        loop {
            let node = Node::decode(&guard, self.capacity)?;
            if node.keys.contains(&key) {
                drop(guard);
                self.pool.unpin_page(page.id, false);
                return Ok(true);
            }
            if node.leaf {
                drop(guard);
                self.pool.unpin_page(page.id, false);
                return Ok(false);
            }
            let next_id = node.children[node.child_index(key)];
            let next = self.pin_spin(next_id, true)?;
            let next_guard = next.buf.read_arc();
            drop(guard);
            self.pool.unpin_page(page.id, false);
            page = next;
            guard = next_guard;
        }
    }

    /// Inserts a new key with the given record payload.
    ///
    /// `record` must be exactly the configured record size. Keys are unique;
    /// inserting a key that is already present is a caller error and leaves
    /// the index with a shadowed duplicate entry.
    pub fn insert(&self, key: u64, record: &[u8]) -> Result<()> {
        if record.len() != self.records.record_size() {
            return Err(Error::InvalidArgument(format!(
                "record of {} bytes, tree stores {}-byte records",
                record.len(),
                self.records.record_size()
            )));
        }
        self.insert_at(self.root, key, record)
    }

    /// Applies `mutate` to the record stored under `key`, in place and
    /// exactly once. Returns false, touching nothing, when the key is
    /// absent. The closure must not re-enter the tree.
    pub fn update<F>(&self, key: u64, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut [u8]),
    {
        let mut parent: Option<(PageRef, PageReadGuard)> = None;
        let mut page = self.pin_spin(self.root, true)?;
        let mut guard: PageReadGuard = page.buf.read_arc();
        loop {
            let next_id = {
                let node = Node::decode(&guard, self.capacity)?;
                if node.leaf {
                    drop(guard);
                    // fast path: uncontended try-lock; slow path feeds the
                    // contention sampling
                    let (fast, wguard) = match page.buf.try_write_arc() {
                        Some(wguard) => (true, wguard),
                        None => (false, page.buf.write_arc()),
                    };
                    let wnode = Node::decode(&wguard, self.capacity)?;
                    if wnode.leaf {
                        return self.update_leaf(parent, page, wguard, &wnode, fast, key, &mut mutate);
                    }
                    // a concurrent root split rebuilt this page as a branch;
                    // drop back to shared and keep descending
                    drop(wguard);
                    guard = page.buf.read_arc();
                    continue;
                }
                node.children[node.child_index(key)]
            };
            let next = self.pin_spin(next_id, true)?;
            let next_guard = next.buf.read_arc();
            if let Some((old_parent, old_guard)) = parent.take() {
                drop(old_guard);
                self.pool.unpin_page(old_parent.id, false);
            }
            parent = Some((page, guard));
            page = next;
            guard = next_guard;
        }
    }

    /// Retries a pin until the pool has a slot for it, yielding between
    /// attempts. Unbounded by design: progress relies on the replacement
    /// policy, not on fairness.
    fn pin_spin(&self, id: BlockId, initialized: bool) -> Result<PageRef> {
        loop {
            if let Some(page) = self.pool.pin_page(id, initialized)? {
                return Ok(page);
            }
            std::thread::yield_now();
        }
    }

    /// Exclusive-locked recursive insertion step. The caller's lock on the
    /// parent stays held across the recursion, so a transiently overfull
    /// child is never observable from another thread.
    fn insert_at(&self, id: BlockId, key: u64, record: &[u8]) -> Result<()> {
        let page = self.pin_spin(id, true)?;
        let mut guard = page.buf.write_arc();
        let mut node = Node::decode(&guard, self.capacity)?;
        debug_assert!(node.keys.len() < self.capacity);
        let index = node.child_index(key);

        if node.leaf {
            let (record_id, _) = self.records.create_record()?;
            self.records.write_record(record_id, record)?;
            node.insert_at(index, key, record_id);
            if id == self.root && node.keys.len() == self.capacity {
                self.split_root(&mut node)?;
            }
            node.encode(&mut guard, self.capacity);
            drop(guard);
            self.pool.unpin_page(id, true);
            return Ok(());
        }

        let child_id = node.children[index];
        debug_assert_ne!(child_id, id);
        self.insert_at(child_id, key, record)?;

        // the recursion may have left the child overfull; resolve it before
        // our own lock releases
        let child = self.pin_spin(child_id, true)?;
        let mut child_guard = child.buf.write_arc();
        let mut child_node = Node::decode(&child_guard, self.capacity)?;
        if child_node.keys.len() == self.capacity {
            let (left_id, separator) = self.split_child(child_id, &mut child_node)?;
            node.insert_at(index, separator, left_id);
            child_node.encode(&mut child_guard, self.capacity);
        }
        drop(child_guard);
        self.pool.unpin_page(child_id, true);

        if id == self.root && node.keys.len() == self.capacity {
            self.split_root(&mut node)?;
        }
        node.encode(&mut guard, self.capacity);
        drop(guard);
        self.pool.unpin_page(id, true);
        Ok(())
    }

    /// Splits a full node at its midpoint. The original block keeps the
    /// upper half so every pointer to it stays valid; the lower half moves
    /// to a fresh block. Returns the new block's id and the separator to
    /// promote. For leaves the separator is copied (it stays as the right
    /// half's first key); for branches it moves up and out of both halves,
    /// with the left half adopting the right's leftmost child pointer.
    ///
    /// `right_home` is where the upper half will ultimately live (`id`
    /// itself, except during root relocation) and becomes the left leaf's
    /// sibling link.
    fn split_child(&self, right_home: BlockId, node: &mut Node) -> Result<(BlockId, u64)> {
        let mid = self.capacity / 2;
        if node.leaf {
            self.split_child_at(right_home, node, mid)
        } else {
            let left_tail = node.children[mid];
            let left_id = self.split_off_left(node, mid, left_tail)?;
            let separator = node.keys.remove(0);
            node.children.remove(0);
            Ok((left_id, separator))
        }
    }

    /// Moves entries `[0, at)` of `node` into a freshly allocated block and
    /// returns its id. `left_last_child` fills the left node's final child
    /// slot: the sibling link for leaves, the adopted boundary pointer for
    /// branches.
    fn split_off_left(&self, node: &mut Node, at: usize, left_last_child: u64) -> Result<BlockId> {
        let left_id = self.pool.new_page()?;
        let left_page = self.pin_spin(left_id, false)?;
        let mut left = Node {
            leaf: node.leaf,
            keys: node.keys.drain(..at).collect(),
            children: node.children.drain(..at).collect(),
        };
        left.children.push(left_last_child);
        {
            let mut guard = left_page.buf.write_arc();
            left.encode(&mut guard, self.capacity);
        }
        self.pool.unpin_page(left_id, true);
        Ok(left_id)
    }

    /// Root overflow: split, relocate the upper half into a fresh block,
    /// and rebuild block 0 as a one-key branch over the two halves; the
    /// root's id never changes.
    fn split_root(&self, node: &mut Node) -> Result<()> {
        let right_id = self.pool.new_page()?;
        let (left_id, separator) = self.split_child(right_id, node)?;
        let right_page = self.pin_spin(right_id, false)?;
        {
            let mut guard = right_page.buf.write_arc();
            node.encode(&mut guard, self.capacity);
        }
        self.pool.unpin_page(right_id, true);
        *node = Node {
            leaf: false,
            keys: vec![separator],
            children: vec![left_id, right_id],
        };
        debug!(left = left_id, right = right_id, "tree.root_split");
        Ok(())
    }

    /// Terminal step of [`BTree::update`] once the target leaf is held
    /// exclusively (parent, when present, still shared).
    #[allow(clippy::too_many_arguments)]
    fn update_leaf(
        &self,
        parent: Option<(PageRef, PageReadGuard)>,
        page: PageRef,
        wguard: PageWriteGuard,
        wnode: &Node,
        fast: bool,
        key: u64,
        mutate: &mut dyn FnMut(&mut [u8]),
    ) -> Result<bool> {
        let Some(index) = wnode.keys.iter().position(|&k| k == key) else {
            drop(wguard);
            if let Some((parent_page, parent_guard)) = parent {
                drop(parent_guard);
                self.pool.unpin_page(parent_page.id, false);
            }
            self.pool.unpin_page(page.id, false);
            return Ok(false);
        };
        let record_id = wnode.children[index];
        let mut payload = self.records.read_record(record_id)?;
        mutate(&mut payload);
        self.records.write_record(record_id, &payload)?;

        // contention split never involves the root, as leaf or as parent
        if page.id != self.root {
            if let Some((parent_page, parent_guard)) = parent {
                if parent_page.id != self.root {
                    let split = self.try_contention_split(
                        &parent_page,
                        parent_guard,
                        &page,
                        wguard,
                        fast,
                        index,
                        key,
                    )?;
                    self.pool.unpin_page(parent_page.id, split);
                    self.pool.unpin_page(page.id, split);
                    return Ok(true);
                }
                drop(wguard);
                drop(parent_guard);
                self.pool.unpin_page(parent_page.id, false);
                self.pool.unpin_page(page.id, false);
                return Ok(true);
            }
        }
        drop(wguard);
        if let Some((parent_page, parent_guard)) = parent {
            drop(parent_guard);
            self.pool.unpin_page(parent_page.id, false);
        }
        self.pool.unpin_page(page.id, false);
        Ok(true)
    }

    /// Statistical pre-emptive split of a hot leaf.
    ///
    /// Entered holding the leaf exclusively and its parent shared; consumes
    /// both guards. On a positive evaluation the locks are fully released
    /// and re-acquired parent-before-child, the same order as ordinary
    /// descent, and the decision is re-validated before splitting, since
    /// the world may have moved during the unlocked window. Returns whether
    /// a split happened, which also decides the dirty flags at unpin.
    fn try_contention_split(
        &self,
        parent_page: &PageRef,
        parent_guard: PageReadGuard,
        page: &PageRef,
        wguard: PageWriteGuard,
        fast: bool,
        index: usize,
        key: u64,
    ) -> Result<bool> {
        if !self.options.contention_split || page.id == self.root {
            return Ok(false);
        }
        let roll: f64 = rand::thread_rng().gen();
        let (_, _, previous_index) = page.samples();
        if roll < self.options.d1 {
            page.record_sample(!fast, index);
        }
        if roll >= self.options.d2 {
            return Ok(false);
        }

        let mut split = false;
        let (updates, slow_paths, _) = page.samples();
        let ratio = if updates == 0 {
            0.0
        } else {
            slow_paths as f64 / updates as f64
        };
        // contention must show up on two distinct offsets; a single hot slot
        // gains nothing from splitting
        if ratio > self.options.d3 && previous_index != index {
            let parent_node = Node::decode(&parent_guard, self.capacity)?;
            if parent_node.keys.len() < self.capacity - 1 {
                self.contention_attempts.fetch_add(1, Ordering::Relaxed);
                drop(wguard);
                drop(parent_guard);
                let mut parent_wguard = parent_page.buf.write_arc();
                let mut wguard = page.buf.write_arc();
                let mut parent_node = Node::decode(&parent_wguard, self.capacity)?;
                let mut node = Node::decode(&wguard, self.capacity)?;
                let parent_index = parent_node.child_index(key);
                let mid = (previous_index + index + 1) / 2;
                if node.leaf
                    && mid < node.keys.len()
                    && !parent_node.keys.is_empty()
                    && parent_node.keys.len() < self.capacity - 1
                    && node.keys.get(index) == Some(&key)
                    // a parent split during the unlocked window may have
                    // migrated this leaf under a different branch
                    && parent_node.children.get(parent_index) == Some(&page.id)
                {
                    let (left_id, separator) = self.split_child_at(page.id, &mut node, mid)?;
                    parent_node.insert_at(parent_index, separator, left_id);
                    node.encode(&mut wguard, self.capacity);
                    parent_node.encode(&mut parent_wguard, self.capacity);
                    split = true;
                    self.contention_splits.fetch_add(1, Ordering::Relaxed);
                    debug!(leaf = page.id, parent = parent_page.id, "tree.contention_split");
                }
                page.reset_samples();
                return Ok(split);
            }
        }
        page.reset_samples();
        Ok(split)
    }

    /// Leaf split at an arbitrary pivot, used by the contention path where
    /// the pivot is the midpoint of the two observed hot offsets.
    fn split_child_at(
        &self,
        right_home: BlockId,
        node: &mut Node,
        at: usize,
    ) -> Result<(BlockId, u64)> {
        debug_assert!(node.leaf);
        let left_id = self.split_off_left(node, at, right_home)?;
        Ok((left_id, node.keys[0]))
    }
}
