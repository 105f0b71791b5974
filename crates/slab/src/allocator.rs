//! The owning allocator value: slab-class table, backing arena, and the
//! public API. Every entry point takes the allocator lock for its entire
//! body; the rebalancer enters the same lock (after the cache lock) for
//! each of its critical sections.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::arena::Arena;
use crate::automove;
use crate::classes::{self, SMALLEST_ID, SlabClass};
use crate::config::SlabConfig;
use crate::error::{AllocError, ConfigError, LimitChangeError, ReassignError};
use crate::hooks::ItemStore;
use crate::item::ItemRef;
use crate::rebalance::{self, RebalanceJob, RebalanceSignal, RebalanceState};
use crate::stats::{ClassStats, RebalanceCounters, StatsSnapshot};

/// Destination of a page reassignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReassignDest {
    /// Graft the page onto another class.
    Class(usize),
    /// Release the page back to the arena (shrink).
    Reclaim,
}

/// Join handles for the two maintenance workers.
pub struct Maintenance {
    rebalancer: JoinHandle<()>,
    automover: JoinHandle<()>,
}

/// State guarded by the allocator lock.
pub(crate) struct SlabInner {
    pub(crate) cfg: SlabConfig,
    pub(crate) classes: Vec<SlabClass>,
    pub(crate) largest: usize,
    pub(crate) arena: Arena,
    /// Current memory limit in bytes (0 = unlimited). Mutable through
    /// `shrink_expand`, unlike the configured starting value.
    pub(crate) limit: u64,
    /// Bytes spent on the classes' page arrays, counted against the limit.
    pub(crate) meta_bytes: u64,
}

/// Slab-based memory allocator with an on-line page rebalancer.
///
/// One value owns everything: the class table, the arena, the rebalance
/// state machine, and the automover policy. Create it with
/// [`SlabAllocator::new`] and share it with `Arc` to run the maintenance
/// workers.
pub struct SlabAllocator {
    pub(crate) cfg: SlabConfig,
    /// Highest populated class index; fixed after construction.
    largest: usize,
    inner: Mutex<SlabInner>,
    pub(crate) rebalance: Mutex<RebalanceState>,
    pub(crate) rebalance_cond: Condvar,
    /// Pacing for the automover's periodic tick.
    pub(crate) tick: Mutex<()>,
    pub(crate) tick_cond: Condvar,
    pub(crate) stop: AtomicBool,
    pub(crate) counters: RebalanceCounters,
}

impl SlabAllocator {
    /// Build the class table and the arena from `cfg`.
    ///
    /// Environment overrides are applied here: `MEMCACHED_SLAB_BULK_CHECK`
    /// replaces `bulk_check` and `T_MEMD_INITIAL_MALLOC` seeds the arena's
    /// byte accounting (test harnesses use it).
    ///
    /// # Panics
    /// Panics when `cfg.prealloc` is set and a page cannot be preallocated
    /// for every class: that is a fatal configuration error.
    pub fn new(cfg: SlabConfig) -> Result<Self, ConfigError> {
        let cfg = cfg.from_env();
        cfg.validate()?;
        let seed = std::env::var("T_MEMD_INITIAL_MALLOC")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0);

        let (table, largest) = classes::build_class_table(&cfg);
        let arena = Arena::new(cfg.limit_bytes, cfg.prealloc, cfg.chunk_align, seed);
        log::info!(
            "slab classes initialized: {} classes, chunk sizes {}..{} bytes, page size {} bytes",
            largest,
            table[SMALLEST_ID].size,
            table[largest].size,
            cfg.max_item_bytes,
        );

        let me = Self {
            cfg,
            largest,
            inner: Mutex::new(SlabInner {
                cfg,
                classes: table,
                largest,
                arena,
                limit: cfg.limit_bytes as u64,
                meta_bytes: 0,
            }),
            rebalance: Mutex::new(RebalanceState::new()),
            rebalance_cond: Condvar::new(),
            tick: Mutex::new(()),
            tick_cond: Condvar::new(),
            stop: AtomicBool::new(false),
            counters: RebalanceCounters::default(),
        };

        if cfg.prealloc {
            let mut inner = me.lock_inner();
            for id in SMALLEST_ID..=largest {
                if inner.newpage(id).is_err() {
                    panic!(
                        "slab preallocation failed for class {id}: the configured memory limit cannot hold one page per class"
                    );
                }
            }
        }
        Ok(me)
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, SlabInner> {
        // A poisoned lock means a thread died mid-mutation and the class
        // table can no longer be trusted.
        self.inner.lock().expect("allocator lock poisoned")
    }

    /// Highest populated class index.
    pub fn largest_class(&self) -> usize {
        self.largest
    }

    /// Chunk size of one class, if it exists.
    pub fn chunk_size(&self, class: usize) -> Option<usize> {
        let inner = self.lock_inner();
        (SMALLEST_ID..=inner.largest)
            .contains(&class)
            .then(|| inner.classes[class].size)
    }

    /// Smallest class whose chunks hold `n` bytes, or 0 when no class can.
    pub fn classify(&self, n: usize) -> usize {
        let inner = self.lock_inner();
        classes::classify(&inner.classes, inner.largest, n)
    }

    /// Hand out one chunk of `class`, recording `n` requested bytes.
    ///
    /// The chunk's header has `SLABBED` cleared and `class_id == 0`; the
    /// caller stamps its own class id once the item is initialized.
    pub fn alloc(&self, n: usize, class: usize) -> Result<NonNull<u8>, AllocError> {
        let mut inner = self.lock_inner();
        if !(SMALLEST_ID..=inner.largest).contains(&class) {
            return Err(AllocError::OutOfMemory);
        }
        debug_assert!(n <= inner.classes[class].size);
        if inner.classes[class].free_count == 0 {
            inner.newpage(class)?;
        }
        let it = inner.classes[class]
            .pop_free()
            .ok_or(AllocError::OutOfMemory)?;
        inner.classes[class].requested_bytes += n as u64;
        Ok(it.as_chunk())
    }

    /// Return a chunk to its class's freelist.
    ///
    /// # Panics
    /// Panics when the header's class id is nonzero: the item subsystem
    /// must clear it before freeing.
    ///
    /// # Safety
    /// `ptr` must be a chunk of `class` previously returned by
    /// [`Self::alloc`] and not currently on a freelist, and `n` must be the
    /// size recorded when it was handed out.
    pub unsafe fn free(&self, ptr: NonNull<u8>, n: usize, class: usize) {
        let mut inner = self.lock_inner();
        assert!(
            (SMALLEST_ID..=inner.largest).contains(&class),
            "free: invalid class id {class}"
        );
        // SAFETY: ptr is a chunk per the caller contract.
        let it = unsafe { ItemRef::from_chunk(ptr) };
        assert_eq!(
            it.class_id(),
            0,
            "free: header class id must be cleared by the caller"
        );
        inner.classes[class].push_free(it);
        inner.classes[class].requested_bytes -= n as u64;
    }

    /// Re-account an item that was resized in place.
    ///
    /// # Panics
    /// Panics on an out-of-range class id.
    pub fn adjust_requested(&self, class: usize, old: usize, new: usize) {
        let mut inner = self.lock_inner();
        assert!(
            (SMALLEST_ID..=inner.largest).contains(&class),
            "adjust_requested: invalid class id {class}"
        );
        let c = &mut inner.classes[class];
        c.requested_bytes -= old as u64;
        c.requested_bytes += new as u64;
    }

    /// Take a consistent statistics snapshot.
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock_inner();
        let mut bytes = 0;
        let mut records = Vec::new();
        for id in SMALLEST_ID..=inner.largest {
            let c = &inner.classes[id];
            bytes += c.requested_bytes;
            if c.pages.is_empty() {
                continue;
            }
            records.push(ClassStats {
                id,
                chunk_size: c.size,
                chunks_per_page: c.perslab,
                total_pages: c.pages.len(),
                total_chunks: c.total_chunks(),
                used_chunks: c.total_chunks() - c.free_count,
                free_chunks: c.free_count,
                mem_requested: c.requested_bytes,
            });
        }
        StatsSnapshot {
            bytes,
            total_malloced: inner.arena.malloced(),
            limit_bytes: inner.limit,
            slabs_moved: self.counters.slabs_moved.load(Ordering::Relaxed),
            slabs_shrunk: self.counters.slabs_shrunk.load(Ordering::Relaxed),
            busy_items: self.counters.busy_items.load(Ordering::Relaxed),
            busy_loops: self.counters.busy_loops.load(Ordering::Relaxed),
            busy_deletes: self.counters.busy_deletes.load(Ordering::Relaxed),
            reassign_running: self.counters.running.load(Ordering::Acquire),
            classes: records,
        }
    }

    /// Change the global memory limit.
    ///
    /// Returns the number of pages the automover will have to reclaim to
    /// get back under the new limit (0 for a pure expansion). The shrinks
    /// themselves happen asynchronously.
    pub fn shrink_expand(&self, new_limit: usize) -> Result<usize, LimitChangeError> {
        let pages_to_reclaim;
        {
            let mut inner = self.lock_inner();
            if inner.arena.is_preallocated() {
                return Err(LimitChangeError::Inflexible);
            }
            if new_limit < self.cfg.max_item_bytes {
                return Err(LimitChangeError::TooSmall);
            }
            inner.limit = new_limit as u64;
            let over = inner.arena.malloced().saturating_sub(new_limit as u64);
            pages_to_reclaim = over.div_ceil(self.cfg.max_item_bytes as u64) as usize;
            log::info!(
                "memory limit set to {new_limit} bytes, {pages_to_reclaim} page(s) to reclaim"
            );
        }
        // Wake the automover so a shrink starts on the next tick.
        let _pace = self.tick.lock().expect("automover pacing lock poisoned");
        self.tick_cond.notify_all();
        Ok(pages_to_reclaim)
    }

    /// Ask the rebalancer to move `count` pages out of a source class.
    ///
    /// `src = None` picks any class that can spare a page. The request is
    /// asynchronous: it is admitted here and executed by the rebalance
    /// worker.
    pub fn reassign(
        &self,
        src: Option<usize>,
        dst: ReassignDest,
        count: usize,
    ) -> Result<(), ReassignError> {
        if !self.cfg.slab_reassign {
            return Err(ReassignError::Disabled);
        }
        let Ok(mut rb) = self.rebalance.try_lock() else {
            return Err(ReassignError::Running);
        };
        if rb.signal != RebalanceSignal::Idle {
            return Err(ReassignError::Running);
        }
        if count < 1 {
            return Err(ReassignError::KillFew);
        }

        let (src_id, dst_id) = {
            let inner = self.lock_inner();
            let dst_id = match dst {
                ReassignDest::Class(d) => {
                    if !(SMALLEST_ID..=inner.largest).contains(&d) {
                        return Err(ReassignError::BadClass);
                    }
                    d
                }
                ReassignDest::Reclaim => 0,
            };
            let src_id = match src {
                Some(s) => {
                    if !(SMALLEST_ID..=inner.largest).contains(&s) {
                        return Err(ReassignError::BadClass);
                    }
                    if s == dst_id {
                        return Err(ReassignError::SrcDstSame);
                    }
                    if inner.classes[s].pages.len() < 1 + count {
                        return Err(ReassignError::NoSpare);
                    }
                    s
                }
                None => (SMALLEST_ID..=inner.largest)
                    .find(|&s| s != dst_id && inner.classes[s].pages.len() >= 1 + count)
                    .ok_or(ReassignError::NoSpare)?,
            };
            (src_id, dst_id)
        };

        rb.job = Some(RebalanceJob::new(src_id, dst_id, count));
        rb.signal = RebalanceSignal::Requested;
        self.counters.running.store(true, Ordering::Release);
        self.rebalance_cond.notify_one();
        log::debug!("rebalance admitted: {count} page(s) from class {src_id} to {dst_id}");
        Ok(())
    }

    /// Spawn the rebalance and automove workers.
    ///
    /// # Panics
    /// Panics when a worker thread cannot be spawned; the allocator cannot
    /// honor its rebalancing contract without them.
    pub fn start_maintenance<S: ItemStore + 'static>(
        self: &Arc<Self>,
        store: Arc<S>,
    ) -> Maintenance {
        let core = Arc::clone(self);
        let st = Arc::clone(&store);
        let rebalancer = thread::Builder::new()
            .name("slab-rebalance".into())
            .spawn(move || rebalance::rebalance_worker(&core, &*st))
            .expect("failed to spawn slab-rebalance worker");

        let core = Arc::clone(self);
        let automover = thread::Builder::new()
            .name("slab-automove".into())
            .spawn(move || automove::automove_worker(&core, &*store))
            .expect("failed to spawn slab-automove worker");

        Maintenance {
            rebalancer,
            automover,
        }
    }

    /// Stop and join both workers. An in-flight rebalance finishes its
    /// current page first; no new jobs are accepted afterwards.
    pub fn stop_maintenance(&self, m: Maintenance) {
        self.stop.store(true, Ordering::SeqCst);
        {
            let _rb = self.rebalance.lock().expect("rebalance lock poisoned");
            self.rebalance_cond.notify_all();
        }
        {
            let _pace = self.tick.lock().expect("automover pacing lock poisoned");
            self.tick_cond.notify_all();
        }
        let _ = m.rebalancer.join();
        let _ = m.automover.join();
    }
}

impl SlabInner {
    /// Bytes one page of `class` occupies. Uniform (`max_item_bytes`) when
    /// reassignment is enabled so pages stay movable.
    pub(crate) fn page_len(&self, class: usize) -> usize {
        if self.cfg.slab_reassign {
            self.cfg.max_item_bytes
        } else {
            self.classes[class].size * self.classes[class].perslab
        }
    }

    /// Make room for one more page pointer, doubling the array (minimum
    /// capacity 16) and charging the byte delta against the limit. Growing
    /// never moves the pages themselves, so live page pointers stay valid.
    pub(crate) fn ensure_page_capacity(&mut self, class: usize) {
        let pages = &mut self.classes[class].pages;
        if pages.len() < pages.capacity() {
            return;
        }
        let old_cap = pages.capacity();
        let target = if old_cap == 0 { 16 } else { old_cap * 2 };
        pages.reserve_exact(target - pages.len());
        self.meta_bytes += ((pages.capacity() - old_cap) * size_of::<NonNull<u8>>()) as u64;
    }

    /// Allocate, zero, and split one new page for `class`.
    ///
    /// A class with no pages is always allowed its first page even when
    /// that overshoots the limit; the automover shrinks afterwards.
    pub(crate) fn newpage(&mut self, class: usize) -> Result<(), AllocError> {
        let len = self.page_len(class);
        if self.limit > 0
            && self.arena.malloced() + self.meta_bytes + len as u64 > self.limit
            && !self.classes[class].pages.is_empty()
        {
            return Err(AllocError::OutOfMemory);
        }
        self.ensure_page_capacity(class);
        let Some(page) = self.arena.reserve(len) else {
            return Err(AllocError::OutOfMemory);
        };
        // SAFETY: the arena handed us len writable bytes.
        unsafe { core::ptr::write_bytes(page.as_ptr(), 0, len) };
        self.classes[class].attach_page(page);
        Ok(())
    }
}

// SAFETY: SlabInner's raw pointers are only dereferenced under the
// allocator lock that wraps it.
unsafe impl Send for SlabInner {}

impl Drop for SlabInner {
    fn drop(&mut self) {
        if self.arena.is_preallocated() {
            return; // the arena frees its one region itself
        }
        for id in SMALLEST_ID..self.classes.len() {
            let len = self.page_len(id);
            let pages = core::mem::take(&mut self.classes[id].pages);
            for page in pages {
                self.arena.release(page, len);
            }
        }
    }
}
