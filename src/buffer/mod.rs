//! Pinned-page buffer pool with clock (second-chance) replacement.
//!
//! A fixed array of slots fronts one [`BlockStore`]. Residency lives behind
//! a single table lock, held briefly; each page carries its own content
//! lock. At eviction time the pool first offers an injected reclaim hook
//! the chance to free a *different* slot (the tree merges cold sibling
//! subtrees there), falling back to ordinary second-chance eviction.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::store::{BlockId, BlockStore};

mod page;

pub use page::{Page, PageReadGuard, PageWriteGuard};

/// Shared handle to a cached page.
pub type PageRef = Arc<Page>;

/// Capability interface the pool's owner supplies at construction.
///
/// `classify_inner` runs on freshly loaded pages so the pool can keep a set
/// of resident inner-node ids; `attempt_reclaim` runs when the pool is about
/// to evict and may instead satisfy the pending load by compacting pages
/// elsewhere through the [`ReclaimScope`].
pub trait PoolHooks: Send + Sync {
    /// Returns true when the page bytes hold an inner index node.
    fn classify_inner(&self, buf: &[u8]) -> bool;
    /// Tries to free a slot for `target` without evicting. Must report
    /// success only after `target` has been made resident.
    fn attempt_reclaim(&self, scope: &mut ReclaimScope<'_>, target: BlockId) -> Result<bool>;
}

struct PoolState {
    slots: Vec<Option<PageRef>>,
    resident: HashMap<BlockId, usize>,
    inner_nodes: HashSet<BlockId>,
    hand: usize,
}

/// Mutable view of the pool handed to [`PoolHooks::attempt_reclaim`].
///
/// The hook runs under the exclusive table lock, so every resident page it
/// sees as unpinned stays unpinned for the duration of the call.
pub struct ReclaimScope<'a> {
    state: &'a mut PoolState,
    store: &'a BlockStore,
}

impl ReclaimScope<'_> {
    /// Ids of resident pages classified as inner nodes.
    pub fn inner_nodes(&self) -> &HashSet<BlockId> {
        &self.state.inner_nodes
    }

    /// The resident page for `id`, if any.
    pub fn resident(&self, id: BlockId) -> Option<&PageRef> {
        self.state
            .resident
            .get(&id)
            .and_then(|&slot| self.state.slots[slot].as_ref())
    }

    /// Frees `victim`'s backing block, drops it from the pool, and loads
    /// `target` into the vacated slot. The victim must be resident and
    /// unpinned; the target must not be resident.
    pub fn adopt_slot(&mut self, victim: BlockId, target: BlockId) -> Result<()> {
        let slot = self
            .state
            .resident
            .remove(&victim)
            .ok_or(Error::Corruption("reclaim victim not resident"))?;
        debug_assert!(!self.state.resident.contains_key(&target));
        self.state.inner_nodes.remove(&victim);
        self.store.delete_block(victim)?;
        let content = self.store.read_block(target)?;
        self.state.slots[slot] = Some(Arc::new(Page::new(target, content)));
        self.state.resident.insert(target, slot);
        Ok(())
    }
}

/// Point-in-time counters, in the style of the storage layer's other stats
/// snapshots.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolStats {
    /// Pins satisfied from a resident page.
    pub hits: u64,
    /// Pins that had to load from disk.
    pub misses: u64,
    /// Pages evicted by the clock sweep.
    pub evictions: u64,
    /// Loads satisfied by the reclaim hook instead of an eviction.
    pub reclaims: u64,
}

/// Fixed-capacity cache of pages over one block file.
pub struct BufferPool {
    store: BlockStore,
    capacity: usize,
    hooks: Option<Arc<dyn PoolHooks>>,
    state: RwLock<PoolState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    reclaims: AtomicU64,
}

impl BufferPool {
    /// Opens the backing block file and readies `capacity` empty slots.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        capacity: usize,
        hooks: Option<Arc<dyn PoolHooks>>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "buffer pool needs at least one slot".into(),
            ));
        }
        let store = BlockStore::open(path, block_size)?;
        Ok(Self {
            store,
            capacity,
            hooks,
            state: RwLock::new(PoolState {
                slots: (0..capacity).map(|_| None).collect(),
                resident: HashMap::new(),
                inner_nodes: HashSet::new(),
                hand: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
        })
    }

    /// Number of live blocks in the backing file.
    pub fn entry_count(&self) -> u64 {
        self.store.entry_count()
    }

    /// Pins the page for `id`, loading it on a miss.
    ///
    /// `initialized` tells the pool the block already holds a valid node, so
    /// a fresh load may be classified by the inner-node hook. Returns
    /// `Ok(None)`, the pool's only backpressure signal, when a full clock
    /// sweep finds no unpinned slot; callers are expected to retry.
    pub fn pin_page(&self, id: BlockId, initialized: bool) -> Result<Option<PageRef>> {
        {
            let state = self.state.read();
            if let Some(page) = Self::lookup(&state, id)? {
                page.pin();
                page.set_referenced(true);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(page));
            }
        }
        let mut state = self.state.write();
        // somebody else may have loaded it while we upgraded
        if let Some(page) = Self::lookup(&state, id)? {
            page.pin();
            page.set_referenced(true);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(page));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        if !self.load_slot(&mut state, id, initialized)? {
            return Ok(None);
        }
        let page = Self::lookup(&state, id)?
            .ok_or(Error::Corruption("freshly loaded page not resident"))?;
        page.pin();
        Ok(Some(page))
    }

    /// Drops one pin, optionally marking the page modified first. A no-op
    /// for ids that are no longer resident.
    pub fn unpin_page(&self, id: BlockId, modified: bool) {
        let state = self.state.read();
        let Some(&slot) = state.resident.get(&id) else {
            return;
        };
        let Some(page) = state.slots[slot].as_ref() else {
            return;
        };
        if modified {
            page.set_modified(true);
        }
        page.unpin();
    }

    /// Allocates a block in the backing file without loading it.
    pub fn new_page(&self) -> Result<BlockId> {
        let (id, _) = self.store.create_block()?;
        Ok(id)
    }

    /// Deletes a page. Resident and unpinned: marked deleted and dropped
    /// from the residency maps, with the disk block reclaimed by a later
    /// sweep. Resident and pinned: fails with `false` so the caller can
    /// retry. Non-resident: deleted on disk directly. A deleted id must not
    /// be pinned again.
    pub fn delete_page(&self, id: BlockId) -> Result<bool> {
        let mut state = self.state.write();
        if let Some(&slot) = state.resident.get(&id) {
            let page = state.slots[slot]
                .clone()
                .ok_or(Error::Corruption("resident page missing from slot"))?;
            if page.pin_count() > 0 {
                return Ok(false);
            }
            page.mark_deleted();
            state.resident.remove(&id);
            state.inner_nodes.remove(&id);
            return Ok(true);
        }
        self.store.delete_block(id)?;
        Ok(true)
    }

    /// Writes back every modified unpinned page. Pinned pages are skipped;
    /// their holders decide modification state at unpin time.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.write();
        for page in state.slots.iter().flatten() {
            if page.pin_count() == 0 && !page.is_deleted() && page.is_modified() {
                self.store.write_block(page.id, &page.buf.read())?;
                page.set_modified(false);
            }
        }
        Ok(())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
        }
    }

    fn lookup(state: &PoolState, id: BlockId) -> Result<Option<PageRef>> {
        match state.resident.get(&id) {
            Some(&slot) => state.slots[slot]
                .clone()
                .ok_or(Error::Corruption("resident page missing from slot"))
                .map(Some),
            None => Ok(None),
        }
    }

    /// Clock sweep: finds or frees a slot and loads `id` into it. Fails only
    /// after one full pass encounters no unpinned slot at all.
    fn load_slot(&self, state: &mut PoolState, id: BlockId, initialized: bool) -> Result<bool> {
        let mut encounters = 0;
        let mut found_unpinned = false;
        while !(encounters >= self.capacity && !found_unpinned) {
            let hand = state.hand;
            match state.slots[hand].clone() {
                None => {
                    self.install_page(state, hand, id, initialized)?;
                    return Ok(true);
                }
                Some(page) if page.pin_count() == 0 => {
                    let deleted = page.is_deleted();
                    let referenced = page.is_referenced();
                    if deleted || !referenced {
                        // an eviction is imminent; let the owner try to free
                        // capacity elsewhere first
                        if let Some(hooks) = self.hooks.clone() {
                            let mut scope = ReclaimScope {
                                state: &mut *state,
                                store: &self.store,
                            };
                            if hooks.attempt_reclaim(&mut scope, id)? {
                                self.reclaims.fetch_add(1, Ordering::Relaxed);
                                return Ok(true);
                            }
                        }
                    }
                    found_unpinned = true;
                    if deleted {
                        self.store.delete_block(page.id)?;
                        self.install_page(state, hand, id, initialized)?;
                        return Ok(true);
                    } else if !referenced {
                        if page.is_modified() {
                            self.store.write_block(page.id, &page.buf.read())?;
                        }
                        state.resident.remove(&page.id);
                        state.inner_nodes.remove(&page.id);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        trace!(evicted = page.id, loaded = id, "pool.evict");
                        self.install_page(state, hand, id, initialized)?;
                        return Ok(true);
                    } else {
                        page.set_referenced(false);
                    }
                }
                Some(_) => {}
            }
            encounters += 1;
            state.hand = (state.hand + 1) % self.capacity;
        }
        debug!(id, "pool.exhausted");
        Ok(false)
    }

    fn install_page(
        &self,
        state: &mut PoolState,
        slot: usize,
        id: BlockId,
        initialized: bool,
    ) -> Result<()> {
        let content = self.store.read_block(id)?;
        let page = Arc::new(Page::new(id, content));
        // id 0 is reserved by the owner (it always hosts the tree root) and
        // is never classified
        if initialized && id != 0 {
            if let Some(hooks) = &self.hooks {
                if hooks.classify_inner(&page.buf.read()) {
                    state.inner_nodes.insert(id);
                }
            }
        }
        state.slots[slot] = Some(page);
        state.resident.insert(id, slot);
        state.hand = (slot + 1) % self.capacity;
        Ok(())
    }
}

impl Drop for BufferPool {
    /// Teardown mirrors construction's contract: callers quiesce first, then
    /// deleted pages release their blocks and modified pages are written
    /// back, best-effort.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for page in state.slots.iter().flatten() {
            let result = if page.is_deleted() {
                self.store.delete_block(page.id)
            } else if page.is_modified() {
                self.store.write_block(page.id, &page.buf.read())
            } else {
                Ok(())
            };
            if let Err(err) = result {
                warn!(page = page.id, %err, "pool.teardown_flush_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: usize = 4096;

    fn open_pool(dir: &tempfile::TempDir, capacity: usize) -> BufferPool {
        BufferPool::open(dir.path().join("pool"), BLOCK_SIZE, capacity, None).unwrap()
    }

    fn tag_page(pool: &BufferPool, id: BlockId, tag: u8) {
        let page = pool.pin_page(id, false).unwrap().expect("slot available");
        page.buf.write()[0] = tag;
        pool.unpin_page(id, true);
    }

    fn read_tag(pool: &BufferPool, id: BlockId) -> u8 {
        let page = pool.pin_page(id, false).unwrap().expect("slot available");
        let tag = page.buf.read()[0];
        pool.unpin_page(id, false);
        tag
    }

    #[test]
    fn caches_and_reloads_pages_through_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, 500);
        let ids: Vec<BlockId> = (0..2000).map(|_| pool.new_page().unwrap()).collect();
        for &id in &ids {
            tag_page(&pool, id, (id % 100) as u8);
        }
        for &id in ids.iter().rev() {
            assert_eq!(read_tag(&pool, id), (id % 100) as u8);
        }
        let stats = pool.stats();
        assert!(stats.evictions > 0, "2000 pages through 500 slots must evict");
    }

    #[test]
    fn pin_counts_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, 8);
        let id = pool.new_page().unwrap();
        let first = pool.pin_page(id, false).unwrap().unwrap();
        let second = pool.pin_page(id, false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.pin_count(), 2);
        pool.unpin_page(id, false);
        pool.unpin_page(id, false);
        assert_eq!(first.pin_count(), 0);
    }

    #[test]
    fn reports_unavailable_when_every_slot_is_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, 8);
        let ids: Vec<BlockId> = (0..9).map(|_| pool.new_page().unwrap()).collect();
        let pinned: Vec<PageRef> = ids[..8]
            .iter()
            .map(|&id| pool.pin_page(id, false).unwrap().unwrap())
            .collect();
        assert!(pool.pin_page(ids[8], false).unwrap().is_none());
        pool.unpin_page(pinned[0].id, false);
        drop(pinned);
        assert!(pool.pin_page(ids[8], false).unwrap().is_some());
        pool.unpin_page(ids[8], false);
    }

    #[test]
    fn delete_page_defers_disk_reclaim_until_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, 8);
        let ids: Vec<BlockId> = (0..8).map(|_| pool.new_page().unwrap()).collect();
        for &id in &ids {
            tag_page(&pool, id, 1);
        }
        assert_eq!(pool.entry_count(), 8);
        for &id in &ids {
            assert!(pool.delete_page(id).unwrap());
        }
        // blocks are still allocated until their slots get reused
        assert_eq!(pool.entry_count(), 8);
        let fresh: Vec<BlockId> = (0..8).map(|_| pool.new_page().unwrap()).collect();
        for &id in &fresh {
            tag_page(&pool, id, 2);
        }
        assert_eq!(pool.entry_count(), 8);
    }

    #[test]
    fn delete_page_refuses_pinned_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, 8);
        let id = pool.new_page().unwrap();
        let _page = pool.pin_page(id, false).unwrap().unwrap();
        assert!(!pool.delete_page(id).unwrap());
        pool.unpin_page(id, false);
        assert!(pool.delete_page(id).unwrap());
    }

    #[test]
    fn delete_page_of_non_resident_id_hits_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir, 8);
        let id = pool.new_page().unwrap();
        assert_eq!(pool.entry_count(), 1);
        assert!(pool.delete_page(id).unwrap());
        assert_eq!(pool.entry_count(), 0);
    }

    #[test]
    fn drop_writes_modified_pages_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        let id;
        {
            let pool = BufferPool::open(&path, BLOCK_SIZE, 8, None).unwrap();
            id = pool.new_page().unwrap();
            tag_page(&pool, id, 42);
        }
        let pool = BufferPool::open(&path, BLOCK_SIZE, 8, None).unwrap();
        assert_eq!(read_tag(&pool, id), 42);
    }

    #[test]
    fn flush_persists_without_dropping_residency() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        let pool = BufferPool::open(&path, BLOCK_SIZE, 8, None).unwrap();
        let id = pool.new_page().unwrap();
        tag_page(&pool, id, 9);
        pool.flush().unwrap();
        let direct = BlockStore::open(&path, BLOCK_SIZE).unwrap();
        assert_eq!(direct.read_block(id).unwrap()[0], 9);
    }

    #[test]
    fn concurrent_pins_on_shared_and_private_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(open_pool(&dir, 64));
        let shared = pool.new_page().unwrap();
        let mut handles = Vec::new();
        for thread in 0..8u64 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let own = pool.new_page().unwrap();
                for round in 0..200u64 {
                    let tag = ((thread * 200 + round) % 100) as u8;
                    loop {
                        let Some(page) = pool.pin_page(own, false).unwrap() else {
                            std::thread::yield_now();
                            continue;
                        };
                        page.buf.write()[0] = tag;
                        pool.unpin_page(own, true);
                        break;
                    }
                    loop {
                        let Some(page) = pool.pin_page(own, false).unwrap() else {
                            std::thread::yield_now();
                            continue;
                        };
                        assert_eq!(page.buf.read()[0], tag);
                        pool.unpin_page(own, false);
                        break;
                    }
                    loop {
                        let Some(page) = pool.pin_page(shared, false).unwrap() else {
                            std::thread::yield_now();
                            continue;
                        };
                        page.buf.write()[0] = tag;
                        pool.unpin_page(shared, true);
                        break;
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
