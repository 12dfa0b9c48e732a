//! Large objects: page granular, best fit, growing from the region tail.
//!
//! An object bigger than the small object threshold reserves whole pages,
//! marked in the heap bitmap. Freed runs of pages stay heap property: they
//! are kept on an address ordered free run list threaded through their
//! headers and are reused by later heap allocations, the way slab pages stay
//! with their cache.

use crate::*;

/// Header prefixed to every heap allocation and to every free run.
///
/// For an allocated object `size` is the caller's request and the links are
/// null; for a run on the free list `size` is the run length in bytes, a
/// page multiple, and `prev`/`next` maintain the address ordered list.
#[repr(C)]
pub(crate) struct HeapHeader {
    pub(crate) size: usize,
    pub(crate) prev: Offset,
    pub(crate) next: Offset,
}

pub(crate) const HEAP_HEADER_SIZE: usize = mem::size_of::<HeapHeader>();

const_assert!(HEAP_HEADER_SIZE % 8 == 0);

impl Region {
    #[inline(always)]
    fn run_ptr(&self, run: Offset) -> *const HeapHeader {
        self.ptr_at(run) as *const HeapHeader
    }

    #[inline(always)]
    fn run_mut(&mut self, run: Offset) -> *mut HeapHeader {
        self.ptr_at_mut(run) as *mut HeapHeader
    }

    /// Allocates an object larger than the small object threshold.
    ///
    /// Picks the best fitting free run; without one, whole pages are carved
    /// from the region tail. The returned offset points past the header and
    /// is 8 byte aligned.
    pub(crate) fn heap_alloc(&mut self, size: usize) -> Option<Offset> {
        debug_assert!(size > SMALL_OBJECT_MAX);

        let need = (HEAP_HEADER_SIZE + size + BASE_PAGE_SIZE - 1) & PAGE_MASK;

        let mut best = Offset::NULL;
        let mut best_size = usize::max_value();
        let mut cursor = self.heap.free_runs;
        while !cursor.is_null() {
            let run = unsafe { &*self.run_ptr(cursor) };
            if run.size >= need && run.size < best_size {
                best = cursor;
                best_size = run.size;
                if run.size == need {
                    break;
                }
            }
            cursor = run.next;
        }

        let object = if !best.is_null() {
            if best_size == need {
                self.unlink_run(best);
                best
            } else {
                // shrink in place and allocate from the run's high end, the
                // remainder keeps its header
                unsafe { (*self.run_mut(best)).size = best_size - need };
                Offset::new(best.value() + (best_size - need))
            }
        } else {
            let start = self.carve_tail(need / BASE_PAGE_SIZE)?;
            Offset::new(start * BASE_PAGE_SIZE)
        };

        unsafe {
            *self.run_mut(object) = HeapHeader { size, prev: Offset::NULL, next: Offset::NULL };
        }
        Some(Offset::new(object.value() + HEAP_HEADER_SIZE))
    }

    /// Returns a heap object to the free run list, coalescing with adjacent
    /// runs.
    pub(crate) fn heap_free(&mut self, object: Offset) {
        if object.value() < HEAP_HEADER_SIZE {
            return;
        }
        let run = Offset::new(object.value() - HEAP_HEADER_SIZE);
        // the header sits at the start of the run's first page
        if run.value() & !PAGE_MASK != 0 {
            debug_assert!(false, "heap free of misplaced offset {:?}", object);
            return;
        }

        let size = unsafe { (*self.run_ptr(run)).size };
        let bytes = (HEAP_HEADER_SIZE + size + BASE_PAGE_SIZE - 1) & PAGE_MASK;
        self.insert_run(run, bytes);
    }

    /// Links a freed run into the address ordered free run list and merges
    /// it with its neighbors where they touch.
    fn insert_run(&mut self, run: Offset, bytes: usize) {
        debug_assert_eq!(bytes & !PAGE_MASK, 0);

        let mut prev = Offset::NULL;
        let mut next = self.heap.free_runs;
        while !next.is_null() && next < run {
            prev = next;
            next = unsafe { (*self.run_ptr(next)).next };
        }
        debug_assert!(
            next.is_null() || run.value() + bytes <= next.value(),
            "freed run {:?} overlaps a free run",
            run
        );
        debug_assert!(
            prev.is_null() || prev.value() + unsafe { (*self.run_ptr(prev)).size } <= run.value(),
            "freed run {:?} overlaps a free run",
            run
        );

        unsafe {
            *self.run_mut(run) = HeapHeader { size: bytes, prev, next };
            if prev.is_null() {
                self.heap.free_runs = run;
            } else {
                (*self.run_mut(prev)).next = run;
            }
            if !next.is_null() {
                (*self.run_mut(next)).prev = run;
            }

            // merge with the following run
            if !next.is_null() && run.value() + bytes == next.value() {
                let merged = (*self.run_ptr(next)).size;
                let after = (*self.run_ptr(next)).next;
                (*self.run_mut(run)).size = bytes + merged;
                (*self.run_mut(run)).next = after;
                if !after.is_null() {
                    (*self.run_mut(after)).prev = run;
                }
            }

            // merge with the preceding run
            if !prev.is_null() && prev.value() + (*self.run_ptr(prev)).size == run.value() {
                let merged = (*self.run_ptr(run)).size;
                let after = (*self.run_ptr(run)).next;
                (*self.run_mut(prev)).size += merged;
                (*self.run_mut(prev)).next = after;
                if !after.is_null() {
                    (*self.run_mut(after)).prev = prev;
                }
            }
        }
    }

    fn unlink_run(&mut self, run: Offset) {
        unsafe {
            let (prev, next) = {
                let header = self.run_ptr(run);
                ((*header).prev, (*header).next)
            };
            if prev.is_null() {
                self.heap.free_runs = next;
            } else {
                (*self.run_mut(prev)).next = next;
            }
            if !next.is_null() {
                (*self.run_mut(next)).prev = prev;
            }
        }
    }

    /// Carves `count` contiguous free pages from as close to the region tail
    /// as possible and marks them as heap pages.
    fn carve_tail(&mut self, count: usize) -> Option<usize> {
        debug_assert!(count > 0);
        let first = self.first_data_page();
        let limit = self.data_page_limit();

        let mut run = 0;
        let mut page = limit;
        let start = loop {
            if page == first {
                return None;
            }
            page -= 1;
            let (heap_bits, cache_bits) = self.bitmaps();
            if heap_bits.is_set(page) || cache_bits.is_set(page) {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    break page;
                }
            }
        };

        for page in start..start + count {
            self.mark_page(PageKind::Heap, page);
        }
        trace!("carved {} heap pages at {:#x}", count, start * BASE_PAGE_SIZE);

        // the free page hint may have pointed into the carved range
        if !self.free_page.is_null() {
            let hint = self.free_page.value() / BASE_PAGE_SIZE;
            if hint >= start && hint < start + count {
                self.refresh_free_page();
            }
        }

        Some(start)
    }
}
