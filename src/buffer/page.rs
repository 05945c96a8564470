//! One cached block and the runtime state the pool tracks for it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::store::BlockId;

/// Owned shared guard over a page's content, usable across lock-coupled
/// descent steps.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
/// Owned exclusive guard over a page's content.
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// A cached disk block.
///
/// The content lock is separate from the pool's table lock: the table lock
/// only protects residency, never node contents. Pin counts keep the slot
/// from being evicted; the remaining flags drive clock replacement and
/// write-back. The three sampling counters belong to the tree's contention
/// detection and are only touched while the content lock is held
/// exclusively.
pub struct Page {
    /// Backing block id; fixed for as long as the page occupies a slot.
    pub id: BlockId,
    /// Block content. Lock order is always parent before child.
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pin_count: AtomicUsize,
    referenced: AtomicBool,
    modified: AtomicBool,
    deleted: AtomicBool,
    updates: AtomicUsize,
    slow_paths: AtomicUsize,
    last_sample_pos: AtomicUsize,
}

impl Page {
    pub(crate) fn new(id: BlockId, content: Vec<u8>) -> Self {
        Self {
            id,
            buf: Arc::new(RwLock::new(content.into_boxed_slice())),
            pin_count: AtomicUsize::new(0),
            referenced: AtomicBool::new(true),
            modified: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            updates: AtomicUsize::new(0),
            slow_paths: AtomicUsize::new(0),
            last_sample_pos: AtomicUsize::new(0),
        }
    }

    /// Number of holders currently pinning this page.
    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::Relaxed)
    }

    /// Whether the page carries unwritten modifications.
    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Relaxed)
    }

    /// Whether the page is logically deleted and awaiting disk reclaim.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    pub(crate) fn is_referenced(&self) -> bool {
        self.referenced.load(Ordering::Relaxed)
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unpin(&self) {
        let previous = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "unpin of an unpinned page");
    }

    pub(crate) fn set_referenced(&self, value: bool) {
        self.referenced.store(value, Ordering::Relaxed);
    }

    pub(crate) fn set_modified(&self, value: bool) {
        self.modified.store(value, Ordering::Relaxed);
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Relaxed);
    }

    /// Snapshot of the contention counters: recorded updates, slow-path
    /// updates, and the leaf-local index of the most recent sample.
    pub(crate) fn samples(&self) -> (usize, usize, usize) {
        (
            self.updates.load(Ordering::Relaxed),
            self.slow_paths.load(Ordering::Relaxed),
            self.last_sample_pos.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn record_sample(&self, slow: bool, index: usize) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        if slow {
            self.slow_paths.fetch_add(1, Ordering::Relaxed);
        }
        self.last_sample_pos.store(index, Ordering::Relaxed);
    }

    pub(crate) fn reset_samples(&self) {
        self.updates.store(0, Ordering::Relaxed);
        self.slow_paths.store(0, Ordering::Relaxed);
        self.last_sample_pos.store(0, Ordering::Relaxed);
    }
}
