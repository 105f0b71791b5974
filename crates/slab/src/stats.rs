//! Statistics surface of the allocator.
//!
//! A [`StatsSnapshot`] is a consistent view taken under the allocator lock;
//! [`StatsSnapshot::write_stat_lines`] renders it in the text protocol's
//! `STAT key value` form.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Lifetime counters maintained by the rebalancer, readable without the
/// allocator lock.
#[derive(Default)]
pub(crate) struct RebalanceCounters {
    pub(crate) slabs_moved: AtomicU64,
    pub(crate) slabs_shrunk: AtomicU64,
    pub(crate) busy_items: AtomicU64,
    pub(crate) busy_loops: AtomicU64,
    pub(crate) busy_deletes: AtomicU64,
    pub(crate) running: AtomicBool,
}

impl RebalanceCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-class statistics record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassStats {
    /// Class index.
    pub id: usize,
    /// Chunk size in bytes.
    pub chunk_size: usize,
    /// Chunks per page.
    pub chunks_per_page: usize,
    /// Pages owned by the class.
    pub total_pages: usize,
    /// Chunks owned by the class.
    pub total_chunks: usize,
    /// Chunks currently handed out.
    pub used_chunks: usize,
    /// Chunks on the freelist.
    pub free_chunks: usize,
    /// Bytes actually requested from this class's chunks.
    pub mem_requested: u64,
}

/// Consistent snapshot of the allocator's statistics.
#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    /// Sum of requested bytes across all classes.
    pub bytes: u64,
    /// Bytes the arena has handed out.
    pub total_malloced: u64,
    /// Current memory limit (0 = unlimited).
    pub limit_bytes: u64,
    /// Pages moved between classes over the allocator's lifetime.
    pub slabs_moved: u64,
    /// Pages released back to the arena over the allocator's lifetime.
    pub slabs_shrunk: u64,
    /// Chunks the rebalancer found busy.
    pub busy_items: u64,
    /// Full page rescans forced by busy chunks.
    pub busy_loops: u64,
    /// Linked items the rebalancer forcibly unlinked.
    pub busy_deletes: u64,
    /// A rebalance job is currently admitted or running.
    pub reassign_running: bool,
    /// Records for every class that owns at least one page.
    pub classes: Vec<ClassStats>,
}

impl StatsSnapshot {
    /// Render the snapshot as `STAT key value` lines: per-class fields
    /// first (`STAT <id>:<field> <value>`), then the global fields.
    pub fn write_stat_lines<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        for c in &self.classes {
            writeln!(w, "STAT {}:chunk_size {}", c.id, c.chunk_size)?;
            writeln!(w, "STAT {}:chunks_per_page {}", c.id, c.chunks_per_page)?;
            writeln!(w, "STAT {}:total_pages {}", c.id, c.total_pages)?;
            writeln!(w, "STAT {}:total_chunks {}", c.id, c.total_chunks)?;
            writeln!(w, "STAT {}:used_chunks {}", c.id, c.used_chunks)?;
            writeln!(w, "STAT {}:free_chunks {}", c.id, c.free_chunks)?;
            writeln!(w, "STAT {}:mem_requested {}", c.id, c.mem_requested)?;
        }
        writeln!(w, "STAT bytes {}", self.bytes)?;
        writeln!(w, "STAT total_malloced {}", self.total_malloced)?;
        writeln!(w, "STAT limit_maxbytes {}", self.limit_bytes)?;
        writeln!(w, "STAT slabs_moved {}", self.slabs_moved)?;
        writeln!(w, "STAT slabs_shrunk {}", self.slabs_shrunk)?;
        writeln!(w, "STAT slab_reassign_busy_items {}", self.busy_items)?;
        writeln!(w, "STAT slab_reassign_busy_loops {}", self.busy_loops)?;
        writeln!(w, "STAT slab_reassign_busy_deletes {}", self.busy_deletes)?;
        writeln!(
            w,
            "STAT slab_reassign_running {}",
            u8::from(self.reassign_running)
        )?;
        Ok(())
    }

    /// Find the record for one class, if it owns pages.
    pub fn class(&self, id: usize) -> Option<&ClassStats> {
        self.classes.iter().find(|c| c.id == id)
    }

    /// Pages owned by one class (0 when it has none).
    pub fn pages(&self, id: usize) -> usize {
        self.class(id).map_or(0, |c| c.total_pages)
    }
}
