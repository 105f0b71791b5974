//! Error types returned at the allocator's API boundary.
//!
//! Contract violations by the item subsystem (freeing a chunk whose header
//! still carries a class id, adjusting accounting for a class that does not
//! exist) are not errors: they panic, because the shared header protocol
//! can no longer be trusted.

use thiserror::Error;

/// Failure of [`crate::SlabAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The request cannot be satisfied without exceeding the memory limit,
    /// or the backing arena is exhausted.
    #[error("out of memory")]
    OutOfMemory,
}

/// Failure of [`crate::SlabAllocator::reassign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReassignError {
    /// A class index is outside the populated class table.
    #[error("no such slab class")]
    BadClass,
    /// Source and destination are the same class.
    #[error("source and destination classes are the same")]
    SrcDstSame,
    /// The source class cannot spare the requested number of pages.
    #[error("source class has no spare pages")]
    NoSpare,
    /// Fewer than one page was requested.
    #[error("at least one page must be moved")]
    KillFew,
    /// A rebalance is already in progress.
    #[error("a slab rebalance is already running")]
    Running,
    /// Page reassignment was disabled at configuration time, so pages are
    /// not uniformly sized and cannot be migrated.
    #[error("slab reassignment is disabled")]
    Disabled,
}

/// Failure of [`crate::SlabAllocator::shrink_expand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitChangeError {
    /// The arena was preallocated in one piece; its size is fixed.
    #[error("memory limit is fixed for a preallocated arena")]
    Inflexible,
    /// The requested limit is smaller than a single slab page.
    #[error("new memory limit is smaller than one slab page")]
    TooSmall,
}

/// Rejected configuration, reported by [`crate::SlabAllocator::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `chunk_align` is not a power of two, or too small to align an item
    /// header.
    #[error("chunk alignment must be a power of two no smaller than the item header alignment")]
    BadAlign,
    /// `growth_factor` must be greater than 1.0 for the size ladder to
    /// terminate.
    #[error("growth factor must be greater than 1.0")]
    BadGrowthFactor,
    /// `max_item_bytes` cannot hold even the smallest chunk, or is not a
    /// multiple of the chunk alignment.
    #[error("maximum item size cannot hold a single chunk")]
    BadPageSize,
}
