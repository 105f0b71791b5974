//! Seam between the allocator core and the item subsystem.
//!
//! The rebalancer has to reach into the hash table and LRU to evict live
//! items out of a page it is migrating. Everything it needs from that side
//! of the fence is expressed by [`ItemStore`] so the core never links
//! against the item code directly and tests can substitute a mock.

use crate::item::ItemRef;

/// Hooks the allocator core consumes from the item subsystem.
///
/// Implementations must be shareable across the worker threads.
pub trait ItemStore: Send + Sync {
    /// Run `f` while holding the item subsystem's structural lock (the
    /// cache lock). The rebalancer always enters this lock *before* the
    /// allocator lock; implementations must not call back into the
    /// allocator from here.
    fn with_cache_lock<R>(&self, f: impl FnOnce() -> R) -> R;

    /// The item subsystem's key hash, applied to the key bytes stored in an
    /// item header.
    fn key_hash(&self, key: &[u8]) -> u64;

    /// Remove a linked item from the hash table and LRU.
    ///
    /// Called with the cache lock held (inside [`Self::with_cache_lock`]).
    /// The implementation must clear `LINKED`, drop the link's reference,
    /// and remove the item from its structures. It must NOT return the
    /// chunk to the allocator: the caller owns the backing page and will
    /// stamp the chunk dead itself.
    ///
    /// # Safety
    /// `item` points at a live, linked item whose refcount the caller has
    /// pinned for the duration of the call.
    unsafe fn unlink_item(&self, item: ItemRef, key_hash: u64);

    /// Fill `out[class]` with the cumulative eviction count per slab class.
    /// `out` is sized `largest_class + 1`; index 0 is unused.
    fn evictions_snapshot(&self, out: &mut [u64]);
}

/// An item subsystem with no items. Useful when the allocator runs
/// standalone: every chunk the rebalancer encounters is either free or
/// mid-write, so no unlinking ever happens.
pub struct NullStore;

impl ItemStore for NullStore {
    fn with_cache_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }

    fn key_hash(&self, _key: &[u8]) -> u64 {
        0
    }

    unsafe fn unlink_item(&self, _item: ItemRef, _key_hash: u64) {
        unreachable!("NullStore never links items");
    }

    fn evictions_snapshot(&self, out: &mut [u64]) {
        out.fill(0);
    }
}
