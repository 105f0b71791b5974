//! Slab memory allocator and on-line slab rebalancer for the Moray cache
//! server.
//!
//! The allocator owns a bounded region of process memory and hands out
//! fixed-size chunks grouped into geometrically sized slab classes. Two
//! background workers keep the layout matched to the workload: the
//! rebalancer migrates whole pages between classes (or releases them), and
//! the automover picks sources and destinations from eviction statistics.
//! The global memory limit can be raised or lowered at runtime; lowering
//! it makes the automover release pages until the allocator fits again.
//!
//! One [`SlabAllocator`] value owns everything. There are no process-wide
//! globals: tests and embedders can run any number of independent
//! allocators. The item subsystem plugs in through the [`ItemStore`]
//! trait, which the rebalancer uses to evict live items out of pages it is
//! draining.
//!
//! ```
//! use moray_slab::{SlabAllocator, SlabConfig};
//!
//! let core = SlabAllocator::new(SlabConfig::default())?;
//! let class = core.classify(1000);
//! let chunk = core.alloc(1000, class)?;
//! // SAFETY: `chunk` came from `alloc` with this size and class.
//! unsafe { core.free(chunk, 1000, class) };
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod allocator;
mod arena;
mod automove;
mod classes;
pub mod config;
pub mod error;
pub mod hooks;
pub mod item;
mod rebalance;
pub mod stats;

pub use allocator::{Maintenance, ReassignDest, SlabAllocator};
pub use classes::{MAX_CLASSES, SMALLEST_ID};
pub use config::{AutomoveMode, SlabConfig};
pub use error::{AllocError, ConfigError, LimitChangeError, ReassignError};
pub use hooks::{ItemStore, NullStore};
pub use item::{DEAD_CLASS_ID, ITEM_HEADER_SIZE, ItemFlags, ItemHeader, ItemRef};
pub use stats::{ClassStats, StatsSnapshot};
