//! Slab-class descriptors and the geometric size table.
//!
//! Each class owns a set of uniformly sized pages and an intrusive
//! doubly-linked freelist threaded through the item headers of its free
//! chunks. The freelist may span pages.

use core::ptr::NonNull;

use crate::config::SlabConfig;
use crate::item::{ItemFlags, ItemHeader, ItemRef};

/// Index of the first real slab class. Index 0 is reserved so `classify`
/// can return 0 for unsatisfiable sizes.
pub const SMALLEST_ID: usize = 1;

/// Upper bound on populated class-table entries, including the reserved
/// index 0.
pub const MAX_CLASSES: usize = 64;

/// Round `n` up to a multiple of `align` (a power of two).
pub(crate) const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// One slab class: a chunk size, the pages that hold its chunks, and the
/// freelist over those chunks.
pub(crate) struct SlabClass {
    /// Chunk size in bytes.
    pub(crate) size: usize,
    /// Chunks per page.
    pub(crate) perslab: usize,
    /// Pages owned by this class. Grown by doubling (minimum capacity 16)
    /// through `SlabInner::ensure_page_capacity` so the byte delta is
    /// accounted against the memory limit.
    pub(crate) pages: Vec<NonNull<u8>>,
    /// Head of the intrusive freelist.
    free_head: *mut ItemHeader,
    /// Length of the freelist.
    pub(crate) free_count: usize,
    /// 0 when idle, else 1 + index of the page being migrated away.
    pub(crate) killing: usize,
    /// Sum of byte sizes requested from this class, for accounting.
    pub(crate) requested_bytes: u64,
}

// SAFETY: classes are only touched under the allocator lock.
unsafe impl Send for SlabClass {}

impl SlabClass {
    fn new(size: usize, perslab: usize) -> Self {
        Self {
            size,
            perslab,
            pages: Vec::new(),
            free_head: core::ptr::null_mut(),
            free_count: 0,
            killing: 0,
            requested_bytes: 0,
        }
    }

    pub(crate) fn total_chunks(&self) -> usize {
        self.pages.len() * self.perslab
    }

    /// Link a chunk at the head of the freelist and mark it `SLABBED`.
    /// The header's class id must already be cleared by the caller.
    pub(crate) fn push_free(&mut self, it: ItemRef) {
        debug_assert_eq!(it.class_id(), 0);
        it.set_flags(ItemFlags::SLABBED);
        let ptr = it.as_ptr();
        // SAFETY: the chunk belongs to one of our pages and nothing else
        // aliases its header while the allocator lock is held.
        unsafe {
            (*ptr).prev = core::ptr::null_mut();
            (*ptr).next = self.free_head;
            if let Some(head) = NonNull::new(self.free_head) {
                (*head.as_ptr()).prev = ptr;
            }
        }
        self.free_head = ptr;
        self.free_count += 1;
    }

    /// Pop the head of the freelist, clearing its `SLABBED` flag.
    pub(crate) fn pop_free(&mut self) -> Option<ItemRef> {
        let head = NonNull::new(self.free_head)?;
        // SAFETY: freelist nodes live in our pages; allocator lock held.
        unsafe {
            self.free_head = (*head.as_ptr()).next;
            if let Some(next) = NonNull::new(self.free_head) {
                (*next.as_ptr()).prev = core::ptr::null_mut();
            }
            (*head.as_ptr()).next = core::ptr::null_mut();
        }
        self.free_count -= 1;
        // SAFETY: head is the start of a chunk owned by this class.
        let it = unsafe { ItemRef::from_chunk(head.cast()) };
        it.remove_flags(ItemFlags::SLABBED);
        Some(it)
    }

    /// Remove a specific chunk from the freelist. Used by the rebalancer
    /// when it vacates a free chunk that may sit anywhere in the list.
    pub(crate) fn unlink_free(&mut self, it: ItemRef) {
        debug_assert!(it.flags().contains(ItemFlags::SLABBED));
        let ptr = it.as_ptr();
        // SAFETY: the chunk is on this class's freelist; allocator lock held.
        unsafe {
            let prev = (*ptr).prev;
            let next = (*ptr).next;
            if prev.is_null() {
                debug_assert_eq!(self.free_head, ptr);
                self.free_head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*ptr).prev = core::ptr::null_mut();
            (*ptr).next = core::ptr::null_mut();
        }
        self.free_count -= 1;
        it.remove_flags(ItemFlags::SLABBED);
    }

    /// Append a zeroed page and split it into free chunks. The pages vector
    /// must have spare capacity (see `SlabInner::ensure_page_capacity`) so
    /// existing page pointers are never invalidated here.
    pub(crate) fn attach_page(&mut self, page: NonNull<u8>) {
        debug_assert!(self.pages.len() < self.pages.capacity());
        self.pages.push(page);
        for idx in 0..self.perslab {
            // SAFETY: idx * size stays inside the page; a zeroed header is a
            // valid free header (null links, empty flags, class id 0).
            let chunk = unsafe { NonNull::new_unchecked(page.as_ptr().add(idx * self.size)) };
            // SAFETY: chunk is the start of a chunk of this class.
            let it = unsafe { ItemRef::from_chunk(chunk) };
            self.push_free(it);
        }
    }
}

/// Build the class table from the configuration: a geometric ladder of
/// chunk sizes capped by a final class of exactly `max_item_bytes` with one
/// chunk per page. Returns the table and the largest populated index.
pub(crate) fn build_class_table(cfg: &SlabConfig) -> (Vec<SlabClass>, usize) {
    let mut classes = Vec::with_capacity(MAX_CLASSES);
    classes.push(SlabClass::new(0, 0)); // reserved index 0

    let mut size = align_up(cfg.item_overhead + cfg.chunk_extra, cfg.chunk_align);
    while classes.len() < MAX_CLASSES - 1
        && size as f64 <= cfg.max_item_bytes as f64 / cfg.growth_factor
    {
        classes.push(SlabClass::new(size, cfg.max_item_bytes / size));
        size = align_up((size as f64 * cfg.growth_factor) as usize, cfg.chunk_align);
    }
    classes.push(SlabClass::new(cfg.max_item_bytes, 1));
    let largest = classes.len() - 1;
    (classes, largest)
}

/// Smallest class whose chunks hold `n` bytes, or 0 when `n` is zero or
/// larger than the biggest chunk.
pub(crate) fn classify(classes: &[SlabClass], largest: usize, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let mut id = SMALLEST_ID;
    while n > classes[id].size {
        id += 1;
        if id > largest {
            return 0;
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table() -> (Vec<SlabClass>, usize) {
        build_class_table(&SlabConfig::default())
    }

    /// Tests: sizes strictly increase, stay aligned, and the last class is
    /// pinned to the page size with one chunk per page.
    #[test]
    fn ladder_shape() {
        let cfg = SlabConfig::default();
        let (classes, largest) = table();

        assert!(largest < MAX_CLASSES);
        for id in SMALLEST_ID..=largest {
            assert_eq!(classes[id].size % cfg.chunk_align, 0);
            if id > SMALLEST_ID {
                assert!(classes[id].size > classes[id - 1].size);
            }
            assert_eq!(classes[id].perslab, cfg.max_item_bytes / classes[id].size);
        }
        assert_eq!(classes[largest].size, cfg.max_item_bytes);
        assert_eq!(classes[largest].perslab, 1);
    }

    /// Tests: classify boundaries at zero, the maximum, and one past it.
    #[test]
    fn classify_boundaries() {
        let cfg = SlabConfig::default();
        let (classes, largest) = table();

        assert_eq!(classify(&classes, largest, 0), 0);
        assert_eq!(classify(&classes, largest, 1), SMALLEST_ID);
        assert_eq!(classify(&classes, largest, cfg.max_item_bytes), largest);
        assert_eq!(classify(&classes, largest, cfg.max_item_bytes + 1), 0);
    }

    /// Tests: classify returns the smallest class that fits.
    #[test]
    fn classify_is_tight() {
        let (classes, largest) = table();
        for id in SMALLEST_ID..=largest {
            assert_eq!(classify(&classes, largest, classes[id].size), id);
            if id < largest {
                assert_eq!(classify(&classes, largest, classes[id].size + 1), id + 1);
            }
        }
    }

    /// u64 storage keeps chunk headers aligned for their atomic fields.
    fn aligned_page(bytes: usize) -> Box<[u64]> {
        vec![0u64; bytes.div_ceil(8)].into_boxed_slice()
    }

    /// Tests: freelist push/pop is LIFO and keeps the count.
    #[test]
    fn freelist_lifo() {
        let mut class = SlabClass::new(64, 4);
        let mut page = aligned_page(64 * 4);
        let page_ptr = page.as_mut_ptr() as *mut u8;
        class.pages.reserve_exact(16);
        class.attach_page(NonNull::new(page_ptr).expect("non-null"));

        assert_eq!(class.free_count, 4);
        let last = class.pop_free().expect("four free chunks");
        // attach_page pushes chunks in order, so the head is the last chunk.
        assert_eq!(last.as_chunk().as_ptr() as usize, page_ptr as usize + 3 * 64);
        assert!(!last.flags().contains(ItemFlags::SLABBED));
        assert_eq!(class.free_count, 3);

        last.set_class_id(0);
        class.push_free(last);
        assert_eq!(class.free_count, 4);
        assert_eq!(class.pop_free().expect("head"), last);
    }

    /// Tests: unlink_free removes head, middle, and tail nodes.
    #[test]
    fn freelist_unlink_anywhere() {
        let mut class = SlabClass::new(64, 4);
        let mut page = aligned_page(64 * 4);
        let page_ptr = page.as_mut_ptr() as *mut u8;
        class.pages.reserve_exact(16);
        class.attach_page(NonNull::new(page_ptr).expect("non-null"));

        let chunk = |idx: usize| {
            let ptr = NonNull::new(unsafe { page_ptr.add(idx * 64) }).expect("non-null");
            // SAFETY: points at a chunk of `class`.
            unsafe { ItemRef::from_chunk(ptr) }
        };

        class.unlink_free(chunk(2)); // middle
        class.unlink_free(chunk(3)); // head
        class.unlink_free(chunk(0)); // tail
        assert_eq!(class.free_count, 1);
        assert_eq!(class.pop_free().expect("one left"), chunk(1));
        assert!(class.pop_free().is_none());
    }

    proptest! {
        /// Tests: classify is monotone over sizes it can satisfy.
        #[test]
        fn classify_monotone(a in 1usize..=1 << 20, b in 1usize..=1 << 20) {
            let (classes, largest) = table();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let (c_lo, c_hi) = (classify(&classes, largest, lo), classify(&classes, largest, hi));
            prop_assert_ne!(c_lo, 0);
            prop_assert_ne!(c_hi, 0);
            prop_assert!(c_lo <= c_hi);
        }
    }
}
