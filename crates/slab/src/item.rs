//! Item-header layout shared with the item subsystem.
//!
//! Every chunk handed out by the allocator starts with an [`ItemHeader`].
//! While the chunk sits on a freelist the header doubles as an intrusive
//! list node; once allocated, the item subsystem owns the header and the
//! bytes that follow it.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Flag bits stored in an item header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ItemFlags: u8 {
        /// Item is linked into the hash table and LRU.
        const LINKED  = 1 << 0;
        /// Chunk sits on a slab-class freelist.
        const SLABBED = 1 << 1;
        /// Item has been read since it was linked.
        const FETCHED = 1 << 2;
    }
}

/// Class id written into a chunk reclaimed by the rebalancer.
///
/// A thread that observes this value holds a stale pointer to memory that
/// has been (or is about to be) re-homed and must abort its operation.
pub const DEAD_CLASS_ID: u8 = 0xFF;

/// Header at the start of every chunk.
///
/// `prev`/`next` are valid only while `SLABBED` is set and are only touched
/// under the allocator lock. The atomic fields may be probed by threads
/// holding a stale pointer, which is what makes the dead-sentinel handshake
/// with the rebalancer well-defined.
///
/// The key bytes follow the header; `nkey` is their length.
#[repr(C)]
pub struct ItemHeader {
    pub(crate) next: *mut ItemHeader,
    pub(crate) prev: *mut ItemHeader,
    refcount: AtomicU32,
    flags: AtomicU8,
    class_id: AtomicU8,
    nkey: u8,
}

/// Byte offset from the start of a chunk to its key.
pub const ITEM_HEADER_SIZE: usize = size_of::<ItemHeader>();

/// Copyable handle to the header of one chunk.
///
/// All accessors go through raw pointers so that no long-lived reference to
/// the header ever exists; concurrent access is mediated by the atomic
/// fields and the allocator lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemRef(NonNull<ItemHeader>);

// SAFETY: an ItemRef is just an address; the protocol around the atomic
// fields and the allocator lock governs actual access.
unsafe impl Send for ItemRef {}
unsafe impl Sync for ItemRef {}

impl ItemRef {
    /// Reinterpret the start of a chunk as an item header.
    ///
    /// # Safety
    /// `chunk` must point at the first byte of a chunk owned by some slab
    /// class, and the chunk must stay mapped for as long as the handle is
    /// used.
    pub unsafe fn from_chunk(chunk: NonNull<u8>) -> Self {
        Self(chunk.cast())
    }

    /// The chunk address this handle was created from.
    pub fn as_chunk(self) -> NonNull<u8> {
        self.0.cast()
    }

    pub(crate) fn as_ptr(self) -> *mut ItemHeader {
        self.0.as_ptr()
    }

    pub fn class_id(self) -> u8 {
        // SAFETY: the chunk is mapped per the from_chunk contract.
        unsafe { (*self.as_ptr()).class_id.load(Ordering::Acquire) }
    }

    pub fn set_class_id(self, id: u8) {
        // SAFETY: as above.
        unsafe { (*self.as_ptr()).class_id.store(id, Ordering::Release) }
    }

    pub fn flags(self) -> ItemFlags {
        // SAFETY: as above.
        let raw = unsafe { (*self.as_ptr()).flags.load(Ordering::Acquire) };
        ItemFlags::from_bits_truncate(raw)
    }

    /// Overwrite the whole flag byte.
    pub fn set_flags(self, flags: ItemFlags) {
        // SAFETY: as above.
        unsafe { (*self.as_ptr()).flags.store(flags.bits(), Ordering::Release) }
    }

    pub fn insert_flags(self, flags: ItemFlags) {
        // SAFETY: as above.
        unsafe {
            (*self.as_ptr()).flags.fetch_or(flags.bits(), Ordering::AcqRel);
        }
    }

    pub fn remove_flags(self, flags: ItemFlags) {
        // SAFETY: as above.
        unsafe {
            (*self.as_ptr()).flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
    }

    pub fn refcount(self) -> u32 {
        // SAFETY: as above.
        unsafe { (*self.as_ptr()).refcount.load(Ordering::Acquire) }
    }

    pub fn set_refcount(self, n: u32) {
        // SAFETY: as above.
        unsafe { (*self.as_ptr()).refcount.store(n, Ordering::Release) }
    }

    /// Take a reference; returns the new count.
    pub fn refcount_incr(self) -> u32 {
        // SAFETY: as above.
        unsafe { (*self.as_ptr()).refcount.fetch_add(1, Ordering::AcqRel) + 1 }
    }

    /// Drop a reference; returns the new count.
    pub fn refcount_decr(self) -> u32 {
        // SAFETY: as above.
        unsafe { (*self.as_ptr()).refcount.fetch_sub(1, Ordering::AcqRel) - 1 }
    }

    pub fn nkey(self) -> u8 {
        // SAFETY: nkey is only written under the item subsystem's protocol;
        // reading a torn value is impossible for a single byte.
        unsafe { (*self.as_ptr()).nkey }
    }

    /// The key bytes stored after the header.
    ///
    /// # Safety
    /// The item must currently carry a key (it was written by the item
    /// subsystem and the chunk has not been reclaimed since).
    pub unsafe fn key<'a>(self) -> &'a [u8] {
        let base = self.as_chunk().as_ptr().add(ITEM_HEADER_SIZE);
        core::slice::from_raw_parts(base, self.nkey() as usize)
    }

    /// Store a key after the header.
    ///
    /// # Safety
    /// The chunk must be large enough to hold the header plus `key`, and the
    /// caller must own the chunk (freshly allocated, not yet linked).
    pub unsafe fn write_key(self, key: &[u8]) {
        debug_assert!(key.len() <= u8::MAX as usize);
        let base = self.as_chunk().as_ptr().add(ITEM_HEADER_SIZE);
        core::ptr::copy_nonoverlapping(key.as_ptr(), base, key.len());
        (*self.as_ptr()).nkey = key.len() as u8;
    }

    /// Stamp the chunk with the dead sentinel after the rebalancer has
    /// reclaimed it. The sentinel is published last so that a stale reader
    /// seeing `DEAD_CLASS_ID` can rely on flags and refcount being cleared.
    pub(crate) fn mark_dead(self) {
        self.set_flags(ItemFlags::empty());
        self.set_refcount(0);
        self.set_class_id(DEAD_CLASS_ID);
    }
}
