//! Allocator configuration.

use crate::error::ConfigError;
use crate::item::ItemHeader;

/// How aggressively the automover reacts to eviction statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum AutomoveMode {
    /// No eviction-driven page moves. Limit-gap shrinks still run.
    #[default]
    Off,
    /// Move a page only after a sustained eviction imbalance.
    Gentle,
    /// Short decision interval and an emergency source pick.
    Aggressive,
}

/// Configuration for one [`crate::SlabAllocator`].
#[derive(Clone, Copy, Debug)]
pub struct SlabConfig {
    /// Global memory cap in bytes. 0 means unlimited.
    pub limit_bytes: usize,
    /// Ratio between consecutive chunk sizes.
    pub growth_factor: f64,
    /// Reserve the whole limit up front and sub-allocate pages from it.
    pub prealloc: bool,
    /// Largest storable item, which is also the slab page size.
    pub max_item_bytes: usize,
    /// Alignment of every chunk start.
    pub chunk_align: usize,
    /// Size pages uniformly so they can be migrated between classes.
    /// When false, pages are trimmed to `size * perslab` and the
    /// rebalancer is effectively disabled.
    pub slab_reassign: bool,
    /// Automover policy.
    pub automove: AutomoveMode,
    /// Chunks the rebalancer inspects per lock acquisition.
    pub bulk_check: usize,
    /// Bytes reserved past the item header when sizing the smallest class.
    pub chunk_extra: usize,
    /// Per-item header overhead. Defaults to the in-crate header size; the
    /// item subsystem may grow it (e.g. for CAS ids).
    pub item_overhead: usize,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            limit_bytes: 64 << 20,
            growth_factor: 1.25,
            prealloc: false,
            max_item_bytes: 1 << 20,
            chunk_align: 8,
            slab_reassign: true,
            automove: AutomoveMode::Off,
            bulk_check: 1,
            chunk_extra: 48,
            item_overhead: size_of::<ItemHeader>(),
        }
    }
}

impl SlabConfig {
    /// Apply environment overrides. `MEMCACHED_SLAB_BULK_CHECK` replaces
    /// `bulk_check` when it parses to a positive integer.
    pub fn from_env(mut self) -> Self {
        if let Ok(raw) = std::env::var("MEMCACHED_SLAB_BULK_CHECK") {
            match raw.parse::<usize>() {
                Ok(n) if n >= 1 => self.bulk_check = n,
                _ => log::warn!("ignoring unparsable MEMCACHED_SLAB_BULK_CHECK={raw:?}"),
            }
        }
        self
    }

    /// Reject configurations the class-table construction cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.chunk_align.is_power_of_two() || self.chunk_align < align_of::<ItemHeader>() {
            return Err(ConfigError::BadAlign);
        }
        if !(self.growth_factor > 1.0) {
            return Err(ConfigError::BadGrowthFactor);
        }
        let smallest = crate::classes::align_up(self.item_overhead + self.chunk_extra, self.chunk_align);
        if self.max_item_bytes < smallest || self.max_item_bytes % self.chunk_align != 0 {
            return Err(ConfigError::BadPageSize);
        }
        Ok(())
    }
}
