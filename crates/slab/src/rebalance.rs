//! The rebalancer: migrates one slab page at a time from a source class to
//! a destination class, or back to the arena.
//!
//! A single worker drives a three-state machine guarded by the rebalance
//! lock. Each critical section enters the cache lock first and the
//! allocator lock second; that order is mandatory. Once a job is admitted
//! it always completes: a page with busy items is rescanned forever, with
//! a short backoff to let the item subsystem drop its references.

use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use std::time::Duration;

use crate::allocator::SlabAllocator;
use crate::hooks::ItemStore;
use crate::item::{DEAD_CLASS_ID, ItemFlags, ItemRef};
use crate::stats::RebalanceCounters;

/// Pause between move passes after a pass saw busy items.
const BUSY_BACKOFF: Duration = Duration::from_micros(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RebalanceSignal {
    Idle,
    Requested,
    Running,
}

/// Outcome of triaging one chunk during a move pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MoveStatus {
    /// Chunk vacated; stamp the dead sentinel.
    Done,
    /// Chunk still referenced somewhere; revisit on the next pass.
    Busy,
    /// Chunk already carries the dead sentinel.
    Skip,
}

/// One admitted reassign/shrink request plus the migration cursor for the
/// page currently being drained.
pub(crate) struct RebalanceJob {
    /// Source class.
    pub(crate) src: usize,
    /// Destination class; 0 means release the page to the arena.
    pub(crate) dst: usize,
    /// Pages still to migrate, including the one in flight.
    pub(crate) remaining: usize,
    page_start: *mut u8,
    page_end: *mut u8,
    cursor: *mut u8,
    busy_seen: usize,
    pub(crate) done: bool,
}

impl RebalanceJob {
    pub(crate) fn new(src: usize, dst: usize, count: usize) -> Self {
        Self {
            src,
            dst,
            remaining: count,
            page_start: core::ptr::null_mut(),
            page_end: core::ptr::null_mut(),
            cursor: core::ptr::null_mut(),
            busy_seen: 0,
            done: false,
        }
    }
}

/// Signal and job, guarded by the rebalance lock. The worker holds that
/// lock across its condvar wait and across every state transition, so a
/// concurrent `reassign` observes `Running` via try-lock failure.
pub(crate) struct RebalanceState {
    pub(crate) signal: RebalanceSignal,
    pub(crate) job: Option<RebalanceJob>,
}

// SAFETY: the job's raw cursors are only dereferenced under the cache and
// allocator locks inside the move/finish critical sections.
unsafe impl Send for RebalanceState {}

impl RebalanceState {
    pub(crate) fn new() -> Self {
        Self {
            signal: RebalanceSignal::Idle,
            job: None,
        }
    }
}

/// Worker loop. Waits for admitted jobs, then drives start → move* →
/// finish for each page until the job is drained.
pub(crate) fn rebalance_worker<S: ItemStore>(core: &SlabAllocator, store: &S) {
    let mut st = core.rebalance.lock().expect("rebalance lock poisoned");
    loop {
        match st.signal {
            RebalanceSignal::Idle => {
                if core.stop.load(Ordering::Acquire) {
                    break;
                }
                st = core
                    .rebalance_cond
                    .wait(st)
                    .expect("rebalance lock poisoned");
            }
            RebalanceSignal::Requested => {
                // No new pages once shutdown has begun.
                if core.stop.load(Ordering::Acquire) {
                    abort_job(core, &mut st);
                    break;
                }
                if start(core, &mut st, store).is_err() {
                    abort_job(core, &mut st);
                }
            }
            RebalanceSignal::Running => {
                let was_busy = move_pass(core, &mut st, store);
                let page_done = st.job.as_ref().is_none_or(|j| j.done);
                if page_done {
                    finish(core, &mut st, store);
                } else if was_busy {
                    // Give item references a chance to drain before the
                    // next pass. The rebalance lock stays held; concurrent
                    // admission attempts keep seeing Running.
                    std::thread::sleep(BUSY_BACKOFF);
                }
            }
        }
    }
}

fn abort_job(core: &SlabAllocator, st: &mut RebalanceState) {
    if let Some(job) = st.job.take() {
        log::warn!(
            "rebalance aborted: class {} can no longer spare a page ({} left undone)",
            job.src,
            job.remaining
        );
    }
    st.signal = RebalanceSignal::Idle;
    core.counters.running.store(false, Ordering::Release);
}

/// Pick the victim page and arm the cursor. Fails when the job's classes
/// are no longer valid or the source cannot spare a page.
fn start<S: ItemStore>(
    core: &SlabAllocator,
    st: &mut RebalanceState,
    store: &S,
) -> Result<(), ()> {
    let prepared = store.with_cache_lock(|| {
        let mut inner = core.lock_inner();
        let largest = inner.largest;
        let job = st.job.as_mut().ok_or(())?;
        if job.src < crate::classes::SMALLEST_ID || job.src > largest {
            return Err(());
        }
        if job.dst != 0 && (job.dst < crate::classes::SMALLEST_ID || job.dst > largest) {
            return Err(());
        }
        // Never drain a class to zero pages.
        if inner.classes[job.src].pages.len() < 2 {
            return Err(());
        }
        if job.dst != 0 {
            // Grow the destination's page array now so finish cannot fail.
            inner.ensure_page_capacity(job.dst);
        }
        let sc = &mut inner.classes[job.src];
        let victim = sc.pages.len() - 1;
        sc.killing = victim + 1;
        let start = sc.pages[victim].as_ptr();
        job.page_start = start;
        // SAFETY: the victim page holds perslab chunks of `size` bytes.
        job.page_end = unsafe { start.add(sc.size * sc.perslab) };
        job.cursor = start;
        job.busy_seen = 0;
        job.done = false;
        job.remaining -= 1;
        Ok(())
    });
    if prepared.is_ok() {
        st.signal = RebalanceSignal::Running;
    }
    prepared
}

/// Advance the cursor by up to `bulk_check` chunks under one lock
/// acquisition. Returns whether any chunk was busy.
fn move_pass<S: ItemStore>(core: &SlabAllocator, st: &mut RebalanceState, store: &S) -> bool {
    store.with_cache_lock(|| {
        let mut inner = core.lock_inner();
        let Some(job) = st.job.as_mut() else {
            return false;
        };
        let size = inner.classes[job.src].size;
        let mut was_busy = false;

        for _ in 0..core.cfg.bulk_check.max(1) {
            if job.cursor >= job.page_end {
                break;
            }
            // SAFETY: cursor points at a chunk of the page being migrated,
            // which stays owned by the source class until finish().
            let it = unsafe { ItemRef::from_chunk(NonNull::new_unchecked(job.cursor)) };
            let status = if it.class_id() == DEAD_CLASS_ID {
                MoveStatus::Skip
            } else {
                let refs = it.refcount_incr();
                let flags = it.flags();
                let status = if refs == 1 && flags.contains(ItemFlags::SLABBED) {
                    // Free chunk: just pull it off the freelist.
                    inner.classes[job.src].unlink_free(it);
                    MoveStatus::Done
                } else if refs == 1 {
                    // Handed out but not yet linked: mid-write.
                    MoveStatus::Busy
                } else if refs == 2 && flags.contains(ItemFlags::LINKED) {
                    // Live item with no other readers: evict it here, under
                    // the cache lock we already hold.
                    // SAFETY: the probe reference pins the item; it carries
                    // a key because it is linked.
                    let hash = store.key_hash(unsafe { it.key() });
                    // SAFETY: linked item, cache lock held, refcount pinned.
                    unsafe { store.unlink_item(it, hash) };
                    RebalanceCounters::bump(&core.counters.busy_deletes);
                    MoveStatus::Done
                } else {
                    MoveStatus::Busy
                };
                if status == MoveStatus::Busy {
                    // Put the probe reference back.
                    it.refcount_decr();
                }
                status
            };

            match status {
                MoveStatus::Done => it.mark_dead(),
                MoveStatus::Busy => {
                    job.busy_seen += 1;
                    RebalanceCounters::bump(&core.counters.busy_items);
                    was_busy = true;
                }
                MoveStatus::Skip => {}
            }
            // SAFETY: cursor stays within one chunk past the page end.
            job.cursor = unsafe { job.cursor.add(size) };
        }

        if job.cursor >= job.page_end {
            if job.busy_seen > 0 {
                job.cursor = job.page_start;
                job.busy_seen = 0;
                RebalanceCounters::bump(&core.counters.busy_loops);
            } else {
                job.done = true;
            }
        }
        was_busy
    })
}

/// Detach the drained page from the source class and either release it to
/// the arena (shrink) or graft it onto the destination class.
fn finish<S: ItemStore>(core: &SlabAllocator, st: &mut RebalanceState, store: &S) {
    store.with_cache_lock(|| {
        let mut inner = core.lock_inner();
        let Some(job) = st.job.as_mut() else {
            return;
        };
        let page_len = inner.page_len(job.src);
        let sc = &mut inner.classes[job.src];
        let kill = sc.killing - 1;
        let page = sc.pages[kill];
        let last = sc.pages.len() - 1;
        sc.pages.swap(kill, last);
        sc.pages.pop();
        sc.killing = 0;

        if job.dst == 0 {
            // In preallocated mode this is a no-op on the arena: the page
            // stays owned there but is unreachable from any class.
            inner.arena.release(page, page_len);
            RebalanceCounters::bump(&core.counters.slabs_shrunk);
            log::debug!("rebalance: released one page of class {}", job.src);
        } else {
            // SAFETY: the page is fully drained; no live pointers into it
            // can pass the dead-sentinel check any more.
            unsafe { core::ptr::write_bytes(page.as_ptr(), 0, page_len) };
            // A concurrent alloc may have spent the slot start() reserved.
            inner.ensure_page_capacity(job.dst);
            inner.classes[job.dst].attach_page(page);
            RebalanceCounters::bump(&core.counters.slabs_moved);
            log::debug!(
                "rebalance: moved one page from class {} to class {}",
                job.src,
                job.dst
            );
        }
    });

    let more = st.job.as_ref().is_some_and(|j| j.remaining > 0);
    if more {
        st.signal = RebalanceSignal::Requested;
    } else {
        st.job = None;
        st.signal = RebalanceSignal::Idle;
        core.counters.running.store(false, Ordering::Release);
    }
}
