//! The automover: a periodic policy loop that watches eviction deltas and
//! page counts, then asks the rebalancer to move or release pages.
//!
//! The decision step is a pure function of one snapshot so it can be unit
//! tested without threads or timers. The worker adds pacing, the stop
//! flag, and dispatch through the normal `reassign` admission path (a busy
//! rebalancer simply makes the tick a no-op).

use core::sync::atomic::Ordering;
use std::time::Duration;

use crate::allocator::{ReassignDest, SlabAllocator};
use crate::classes::{MAX_CLASSES, SMALLEST_ID};
use crate::config::AutomoveMode;
use crate::hooks::ItemStore;

/// Tick period in gentle (and off) mode.
const DECISION_INTERVAL: Duration = Duration::from_secs(10);
/// Tick period in aggressive mode.
const DECISION_INTERVAL_AGGRESSIVE: Duration = Duration::from_secs(1);

/// Ticks a class must sit at zero evictions (with more than two pages)
/// before it becomes a donor.
const SOURCE_STREAK: u32 = 3;
/// Ticks a class must keep the highest eviction delta before it becomes a
/// recipient.
const WINNER_STREAK: u32 = 3;

/// Everything one tick looks at, captured under the allocator lock (plus
/// the item subsystem's eviction counters, read outside it).
pub(crate) struct AutomoveSnapshot {
    pub(crate) evicted: [u64; MAX_CLASSES],
    pub(crate) pages: [usize; MAX_CLASSES],
    pub(crate) largest: usize,
    pub(crate) total_malloced: u64,
    pub(crate) limit: u64,
    pub(crate) page_bytes: usize,
}

/// What a tick decided to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AutomoveDecision {
    Nothing,
    /// Move one page between classes.
    Move { src: usize, dst: usize },
    /// Release pages to get back under the memory limit.
    Shrink { src: usize, count: usize },
}

/// Cross-tick policy state.
pub(crate) struct AutomovePolicy {
    evicted_prev: [u64; MAX_CLASSES],
    zero_streak: [u32; MAX_CLASSES],
    winner: usize,
    winner_streak: u32,
}

impl AutomovePolicy {
    pub(crate) fn new() -> Self {
        Self {
            evicted_prev: [0; MAX_CLASSES],
            zero_streak: [0; MAX_CLASSES],
            winner: 0,
            winner_streak: 0,
        }
    }

    /// One tick of the policy.
    ///
    /// A donor is a class that has gone [`SOURCE_STREAK`] ticks without an
    /// eviction while holding more than two pages. A recipient is a class
    /// that kept the highest positive eviction delta for
    /// [`WINNER_STREAK`] ticks. In aggressive mode (or whenever the
    /// allocator sits over its limit) an emergency donor is kept as a
    /// fallback: the class with the smallest delta among those that can
    /// spare a page, ties broken towards more pages.
    pub(crate) fn decide(&mut self, snap: &AutomoveSnapshot, aggressive: bool) -> AutomoveDecision {
        let shrinking = snap.limit > 0 && snap.total_malloced > snap.limit;

        let mut source = 0usize;
        let mut highest = 0usize;
        let mut highest_delta = 0u64;
        let mut emergency = 0usize;
        let mut emergency_delta = u64::MAX;

        for id in SMALLEST_ID..=snap.largest {
            let delta = snap.evicted[id] - self.evicted_prev[id];
            if delta == 0 && snap.pages[id] > 2 {
                self.zero_streak[id] += 1;
                if source == 0 && self.zero_streak[id] >= SOURCE_STREAK {
                    source = id;
                }
            } else {
                self.zero_streak[id] = 0;
                if delta > 0 && delta > highest_delta {
                    highest_delta = delta;
                    highest = id;
                }
            }
            if (aggressive || shrinking)
                && snap.pages[id] >= 2
                && (delta < emergency_delta
                    || (delta == emergency_delta && snap.pages[id] > snap.pages[emergency]))
            {
                emergency = id;
                emergency_delta = delta;
            }
            self.evicted_prev[id] = snap.evicted[id];
        }

        let mut dest = 0usize;
        if self.winner != 0 && self.winner == highest {
            self.winner_streak += 1;
            if !shrinking && self.winner_streak >= WINNER_STREAK {
                dest = self.winner;
            }
        } else {
            self.winner = highest;
            self.winner_streak = 1;
        }

        if source == 0 && (aggressive || shrinking) {
            source = emergency;
        }

        if shrinking {
            if source == 0 {
                return AutomoveDecision::Nothing;
            }
            let gap_pages = (snap.total_malloced - snap.limit).div_ceil(snap.page_bytes as u64);
            let mut count = if gap_pages <= 1 {
                gap_pages as usize
            } else {
                let active = (SMALLEST_ID..=snap.largest)
                    .filter(|&id| snap.pages[id] > 1)
                    .count()
                    .max(1);
                let mut n = gap_pages as usize / active;
                if n * active < gap_pages as usize {
                    n += 1;
                }
                n
            };
            count = count.min(snap.pages[source].saturating_sub(1));
            if count == 0 {
                return AutomoveDecision::Nothing;
            }
            AutomoveDecision::Shrink { src: source, count }
        } else if source != 0 && dest != 0 && source != dest {
            // Pure moves always go one page at a time.
            AutomoveDecision::Move { src: source, dst: dest }
        } else {
            AutomoveDecision::Nothing
        }
    }
}

/// Capture one tick's inputs.
pub(crate) fn take_snapshot<S: ItemStore>(core: &SlabAllocator, store: &S) -> AutomoveSnapshot {
    let largest = core.largest_class();
    let mut evicted = [0u64; MAX_CLASSES];
    store.evictions_snapshot(&mut evicted[..=largest]);

    let inner = core.lock_inner();
    let mut pages = [0usize; MAX_CLASSES];
    for id in SMALLEST_ID..=largest {
        pages[id] = inner.classes[id].pages.len();
    }
    AutomoveSnapshot {
        evicted,
        pages,
        largest,
        total_malloced: inner.arena.malloced(),
        limit: inner.limit,
        page_bytes: core.cfg.max_item_bytes,
    }
}

/// Worker loop: tick on a condvar-paced timer until stopped. The condvar
/// lets `shrink_expand` and shutdown interrupt the sleep.
pub(crate) fn automove_worker<S: ItemStore>(core: &SlabAllocator, store: &S) {
    let aggressive = core.cfg.automove == AutomoveMode::Aggressive;
    let interval = if aggressive {
        DECISION_INTERVAL_AGGRESSIVE
    } else {
        DECISION_INTERVAL
    };
    let mut policy = AutomovePolicy::new();

    let mut pace = core.tick.lock().expect("automover pacing lock poisoned");
    loop {
        // Checked under the pacing lock, so a stop signalled before the
        // first wait is never missed.
        if core.stop.load(Ordering::Acquire) {
            break;
        }
        let (next, _timeout) = core
            .tick_cond
            .wait_timeout(pace, interval)
            .expect("automover pacing lock poisoned");
        pace = next;
        if core.stop.load(Ordering::Acquire) {
            break;
        }
        if !core.cfg.slab_reassign {
            continue; // pages are not movable; nothing to decide
        }

        let snap = take_snapshot(core, store);
        match policy.decide(&snap, aggressive) {
            // Eviction-driven moves only when the automover is enabled.
            AutomoveDecision::Move { src, dst } if core.cfg.automove != AutomoveMode::Off => {
                let _ = core.reassign(Some(src), ReassignDest::Class(dst), 1);
            }
            // Limit-gap shrinks run in every mode so shrink_expand always
            // converges.
            AutomoveDecision::Shrink { src, count } => {
                let _ = core.reassign(Some(src), ReassignDest::Reclaim, count);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(largest: usize, page_bytes: usize) -> AutomoveSnapshot {
        AutomoveSnapshot {
            evicted: [0; MAX_CLASSES],
            pages: [0; MAX_CLASSES],
            largest,
            total_malloced: 0,
            limit: 0,
            page_bytes,
        }
    }

    /// Tests: a class with sustained evictions becomes the recipient and a
    /// quiet class with spare pages becomes the donor, each after three
    /// ticks.
    #[test]
    fn move_after_streaks() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 5; // quiet donor candidate
        snap.pages[2] = 3; // hot class

        let mut evictions = 0;
        for tick in 1..=3 {
            evictions += 10;
            snap.evicted[2] = evictions;
            let decision = policy.decide(&snap, false);
            if tick < 3 {
                assert_eq!(decision, AutomoveDecision::Nothing, "tick {tick}");
            } else {
                assert_eq!(decision, AutomoveDecision::Move { src: 1, dst: 2 });
            }
        }
    }

    /// Tests: a donor needs more than two pages.
    #[test]
    fn small_classes_never_donate() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 2; // too small to donate
        snap.pages[2] = 3;

        for tick in 1..=5 {
            snap.evicted[2] = tick * 10;
            assert_eq!(policy.decide(&snap, false), AutomoveDecision::Nothing);
        }
    }

    /// Tests: losing the lead resets the recipient streak.
    #[test]
    fn winner_streak_resets() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 5;
        snap.pages[2] = 3;
        snap.pages[3] = 3;

        snap.evicted[2] = 10;
        assert_eq!(policy.decide(&snap, false), AutomoveDecision::Nothing);
        snap.evicted[2] = 20;
        assert_eq!(policy.decide(&snap, false), AutomoveDecision::Nothing);
        // Class 3 takes the lead; class 2's streak is void.
        snap.evicted[3] = 100;
        assert_eq!(policy.decide(&snap, false), AutomoveDecision::Nothing);
        snap.evicted[3] = 200;
        assert_eq!(policy.decide(&snap, false), AutomoveDecision::Nothing);
        snap.evicted[3] = 300;
        assert_eq!(
            policy.decide(&snap, false),
            AutomoveDecision::Move { src: 1, dst: 3 }
        );
    }

    /// Tests: aggressive mode falls back to the emergency donor (fewest
    /// evictions, ties to the larger class) when no class is fully quiet.
    #[test]
    fn aggressive_emergency_source() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 4; // one eviction per tick: never a streak donor
        snap.pages[2] = 6; // same delta, more pages: preferred emergency
        snap.pages[3] = 3;

        for tick in 1..=3u64 {
            snap.evicted[1] = tick;
            snap.evicted[2] = tick;
            snap.evicted[3] = tick * 50;
            let decision = policy.decide(&snap, true);
            if tick == 3 {
                assert_eq!(decision, AutomoveDecision::Move { src: 2, dst: 3 });
            } else {
                assert_eq!(decision, AutomoveDecision::Nothing);
            }
        }
    }

    /// Tests: over the limit, the gap is spread across active classes and
    /// capped so the donor keeps one page.
    #[test]
    fn shrink_spreads_gap() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 6;
        snap.pages[2] = 3;
        snap.limit = 2 << 20;
        snap.total_malloced = 9 << 20; // 7 pages over

        // Two active classes, gap of 7 pages: ceil(7/2) = 4, capped at
        // pages[src] - 1 = 5 for the emergency donor (class 1, quietest
        // with the most pages).
        assert_eq!(
            policy.decide(&snap, false),
            AutomoveDecision::Shrink { src: 1, count: 4 }
        );
    }

    /// Tests: a one-page gap asks for exactly one page.
    #[test]
    fn shrink_single_page_gap() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 3;
        snap.limit = 4 << 20;
        snap.total_malloced = (4 << 20) + 1;

        assert_eq!(
            policy.decide(&snap, false),
            AutomoveDecision::Shrink { src: 1, count: 1 }
        );
    }

    /// Tests: the cap keeps the donor's last page.
    #[test]
    fn shrink_capped_by_donor() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 3; // only donor, but the gap wants more
        snap.limit = 1 << 20;
        snap.total_malloced = 8 << 20;

        assert_eq!(
            policy.decide(&snap, false),
            AutomoveDecision::Shrink { src: 1, count: 2 }
        );
    }

    /// Tests: nothing shrinks when no class can spare a page.
    #[test]
    fn shrink_needs_a_donor() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 1;
        snap.pages[2] = 1;
        snap.limit = 1 << 20;
        snap.total_malloced = 2 << 20;

        assert_eq!(policy.decide(&snap, false), AutomoveDecision::Nothing);
    }

    /// Tests: while over the limit no eviction-driven move is emitted, even
    /// with a streaking winner.
    #[test]
    fn no_moves_while_shrinking() {
        let mut policy = AutomovePolicy::new();
        let mut snap = snapshot(4, 1 << 20);
        snap.pages[1] = 5;
        snap.pages[2] = 3;
        snap.limit = 1 << 20;
        snap.total_malloced = 9 << 20;

        for tick in 1..=4u64 {
            snap.evicted[2] = tick * 10;
            match policy.decide(&snap, false) {
                AutomoveDecision::Shrink { .. } => {}
                other => panic!("expected a shrink, got {other:?}"),
            }
        }
    }
}
