//! Shared test support: a minimal stand-in for the item subsystem.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moray_slab::{ItemFlags, ItemRef, ItemStore, SlabAllocator};

/// Poll `cond` every 10 ms until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// A tiny item subsystem: per-class FIFOs of linked items with
/// evict-on-allocation-failure, enough to drive the allocator the way the
/// cache server would.
pub struct MockStore {
    /// The structural ("cache") lock the rebalancer enters first.
    structural: Mutex<()>,
    /// Per-class FIFO of linked items as (chunk address, requested bytes).
    linked: Mutex<Vec<VecDeque<(usize, usize)>>>,
    evictions: Vec<AtomicU64>,
}

impl MockStore {
    pub fn new(largest_class: usize) -> Self {
        Self {
            structural: Mutex::new(()),
            linked: Mutex::new(vec![VecDeque::new(); largest_class + 1]),
            evictions: (0..=largest_class).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Store one value, evicting the oldest item of the same class until
    /// the allocator yields a chunk.
    ///
    /// # Panics
    /// Panics when the class runs out of memory with nothing left to
    /// evict: the test asked for more than the limit can ever hold.
    pub fn set(&self, core: &SlabAllocator, key: &[u8], nbytes: usize) {
        let class = core.classify(nbytes);
        assert_ne!(class, 0, "value of {nbytes} bytes fits no class");
        loop {
            match core.alloc(nbytes, class) {
                Ok(chunk) => {
                    let _cache = self.structural.lock().expect("structural lock");
                    // SAFETY: chunk freshly allocated from `class`.
                    let it = unsafe { ItemRef::from_chunk(chunk) };
                    // SAFETY: every chunk holds the header plus a short key.
                    unsafe { it.write_key(key) };
                    it.set_class_id(class as u8);
                    it.set_refcount(1); // the link's reference
                    self.linked.lock().expect("list lock")[class]
                        .push_back((chunk.as_ptr() as usize, nbytes));
                    // Publish LINKED last: from here on the rebalancer may
                    // evict the item through unlink_item.
                    it.set_flags(ItemFlags::LINKED);
                    return;
                }
                Err(_) => {
                    let _cache = self.structural.lock().expect("structural lock");
                    let victim = self.linked.lock().expect("list lock")[class].pop_front();
                    let Some((addr, victim_bytes)) = victim else {
                        panic!("class {class} is out of memory with nothing to evict");
                    };
                    let ptr = NonNull::new(addr as *mut u8).expect("stored non-null");
                    // SAFETY: addr was recorded when the item was linked.
                    let it = unsafe { ItemRef::from_chunk(ptr) };
                    it.set_flags(ItemFlags::empty());
                    it.set_refcount(0);
                    it.set_class_id(0);
                    // SAFETY: chunk of `class` with its recorded size, now
                    // unlinked and owned by us.
                    unsafe { core.free(ptr, victim_bytes, class) };
                    self.evictions[class].fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn evictions(&self, class: usize) -> u64 {
        self.evictions[class].load(Ordering::Relaxed)
    }

    pub fn linked_count(&self, class: usize) -> usize {
        self.linked.lock().expect("list lock")[class].len()
    }
}

impl ItemStore for MockStore {
    fn with_cache_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _g = self.structural.lock().expect("structural lock");
        f()
    }

    fn key_hash(&self, key: &[u8]) -> u64 {
        // FNV-1a.
        key.iter().fold(0xcbf2_9ce4_8422_2325, |h, &b| {
            (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }

    unsafe fn unlink_item(&self, item: ItemRef, _key_hash: u64) {
        // The rebalancer already holds the structural lock here.
        let class = item.class_id() as usize;
        let addr = item.as_chunk().as_ptr() as usize;
        let mut linked = self.linked.lock().expect("list lock");
        if let Some(pos) = linked[class].iter().position(|&(a, _)| a == addr) {
            linked[class].remove(pos);
        }
        item.remove_flags(ItemFlags::LINKED);
        item.refcount_decr();
    }

    fn evictions_snapshot(&self, out: &mut [u64]) {
        for (slot, counter) in out.iter_mut().zip(&self.evictions) {
            *slot = counter.load(Ordering::Relaxed);
        }
    }
}
