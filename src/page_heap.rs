//! Page Heap (back-end): manages spans of contiguous pages, up to
//! [`crate::MAX_PAGES`] pages long.
//!
//! Responsibilities:
//! - Allocate spans of N pages (searching free lists, splitting larger spans)
//! - Deallocate spans (coalescing with adjacent free spans)
//! - Grow the heap by requesting memory from the OS, exactly
//!   [`crate::MAX_PAGES`] pages at a time
//! - Register/unregister spans in the page map
//!
//! Requests larger than `MAX_PAGES` pages never reach this type — the
//! allocator routes them straight to the OS (see `allocator.rs`), so the
//! free lists here never need to hold a span larger than `MAX_PAGES`.
//! Coalescing two free neighbors that would together exceed `MAX_PAGES` is
//! skipped for the same reason: there would be nowhere to bucket the
//! result.

use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{self, Span, SpanList, SpanState};
use crate::MAX_PAGES;
use core::ptr;

pub struct PageHeap {
    /// free_lists[k] holds free spans of exactly k pages (index 0 unused).
    free_lists: [SpanList; MAX_PAGES + 1],
    /// Reference to the global page map.
    pagemap: &'static PageMap,
}

// SAFETY: PageHeap is only accessed through a SpinMutex. Raw pointers within
// point to OS-allocated memory that outlives any thread.
unsafe impl Send for PageHeap {}

impl PageHeap {
    pub const fn new(pagemap: &'static PageMap) -> Self {
        Self {
            free_lists: [const { SpanList::new() }; MAX_PAGES + 1],
            pagemap,
        }
    }

    /// Allocate a span of at least `num_pages` pages (at most `MAX_PAGES`).
    /// Returns a pointer to the Span, or null on failure.
    ///
    /// # Safety
    ///
    /// Caller must hold exclusive access (via the enclosing `SpinMutex`).
    pub unsafe fn allocate_span(&mut self, num_pages: usize) -> *mut Span {
        assert!(num_pages > 0 && num_pages <= MAX_PAGES);

        loop {
            for n in num_pages..=MAX_PAGES {
                if !self.free_lists[n].is_empty() {
                    let s = unsafe { self.free_lists[n].pop() };
                    return unsafe { self.carve_span(s, num_pages) };
                }
            }

            // Nothing in free lists of sufficient size. Grow the heap by
            // exactly MAX_PAGES pages from the OS and try again.
            if unsafe { !self.grow_heap() } {
                return ptr::null_mut();
            }
        }
    }

    /// Deallocate a span, returning it to the free lists.
    /// Attempts to coalesce with adjacent free spans.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, in-use span previously returned by `allocate_span`.
    pub unsafe fn deallocate_span(&mut self, span: *mut Span) {
        unsafe {
            (*span).state = SpanState::Free;
            (*span).size_class = crate::span::NO_SIZE_CLASS;
            (*span).obj_size = 0;
            (*span).freelist = ptr::null_mut();
            (*span).allocated_count = 0;
            (*span).total_count = 0;
        }

        let span = unsafe { self.coalesce_left(span) };
        let span = unsafe { self.coalesce_right(span) };

        // Register endpoints of the free span in the pagemap.
        // Free spans only need first+last pages registered (for coalescing).
        unsafe { self.pagemap.register_span_endpoints(span) };

        unsafe { self.insert_free(span) };
    }

    /// Split a span: use the first `num_pages` pages, return the remainder
    /// to the free lists. Returns the (now in-use) span.
    unsafe fn carve_span(&mut self, span: *mut Span, num_pages: usize) -> *mut Span {
        let total = unsafe { (*span).num_pages };
        assert!(total >= num_pages);

        if total > num_pages {
            let remainder = span::alloc_span();
            if remainder.is_null() {
                // Can't allocate span metadata - return the whole thing
                unsafe {
                    (*span).state = SpanState::InUse;
                    self.pagemap.register_span(span);
                }
                return span;
            }

            unsafe {
                (*remainder).start_page = (*span).start_page + num_pages;
                (*remainder).num_pages = total - num_pages;
                (*remainder).state = SpanState::Free;

                // Update original span
                (*span).num_pages = num_pages;

                // Free spans only need first+last pages for coalescing
                self.pagemap.register_span_endpoints(remainder);
                self.insert_free(remainder);
            }

            #[cfg(feature = "log")]
            log::trace!(
                "split span: took {num_pages} pages, {} remain free",
                total - num_pages
            );
        }

        unsafe {
            (*span).state = SpanState::InUse;
            self.pagemap.register_span(span);
        }

        span
    }

    /// Insert a free span into the appropriate free list.
    unsafe fn insert_free(&mut self, span: *mut Span) {
        let n = unsafe { (*span).num_pages };
        debug_assert!(n <= MAX_PAGES, "page heap span exceeds MAX_PAGES");
        unsafe { self.free_lists[n].push(span) };
    }

    /// Request exactly `MAX_PAGES` pages from the OS and add them as a new
    /// free span. Returns false if the OS allocation failed.
    unsafe fn grow_heap(&mut self) -> bool {
        let alloc_size = MAX_PAGES * platform::page_size();

        let ptr = unsafe { platform::page_alloc(alloc_size) };
        if ptr.is_null() {
            return false;
        }

        let start_page = (ptr as usize) >> platform::page_shift();

        let s = span::alloc_span();
        if s.is_null() {
            unsafe { platform::page_dealloc(ptr, alloc_size) };
            return false;
        }

        unsafe {
            (*s).start_page = start_page;
            (*s).num_pages = MAX_PAGES;
            (*s).state = SpanState::Free;
            self.pagemap.register_span_endpoints(s);
            self.insert_free(s);
        }

        #[cfg(feature = "log")]
        log::trace!("grew page heap by {MAX_PAGES} pages at page {start_page}");

        true
    }

    /// Try to merge with the free span immediately before `span`.
    unsafe fn coalesce_left(&mut self, span: *mut Span) -> *mut Span {
        let start = unsafe { (*span).start_page };
        if start == 0 {
            return span;
        }

        let left = self.pagemap.get(start - 1);
        if left.is_null() {
            return span;
        }

        unsafe {
            if (*left).state != SpanState::Free {
                return span;
            }
            // Verify the left span actually ends right before us
            if (*left).start_page + (*left).num_pages != start {
                return span;
            }
            if (*left).num_pages + (*span).num_pages > MAX_PAGES {
                return span;
            }

            // Remove left from its free list
            self.free_lists[(*left).num_pages].remove(left);

            // Merge: extend left span to include our pages
            (*left).num_pages += (*span).num_pages;

            // Free the now-redundant span struct
            span::dealloc_span(span);

            #[cfg(feature = "log")]
            log::trace!("coalesced left: span now {} pages", (*left).num_pages);

            left
        }
    }

    /// Try to merge with the free span immediately after `span`.
    unsafe fn coalesce_right(&mut self, span: *mut Span) -> *mut Span {
        let end_page = unsafe { (*span).end_page() };

        let right = self.pagemap.get(end_page);
        if right.is_null() {
            return span;
        }

        unsafe {
            if (*right).state != SpanState::Free {
                return span;
            }
            // Verify the right span actually starts right after us
            if (*right).start_page != end_page {
                return span;
            }
            if (*right).num_pages + (*span).num_pages > MAX_PAGES {
                return span;
            }

            // Remove right from its free list
            self.free_lists[(*right).num_pages].remove(right);

            // Merge: extend our span to include right's pages
            (*span).num_pages += (*right).num_pages;

            // Free the now-redundant span struct
            span::dealloc_span(right);

            #[cfg(feature = "log")]
            log::trace!("coalesced right: span now {} pages", (*span).num_pages);

            span
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagemap::PageMap;
    use std::boxed::Box;
    use std::vec::Vec;

    // Each test creates its own PageMap to avoid interference
    fn make_heap() -> (&'static PageMap, PageHeap) {
        // Leak a PageMap so we get a &'static reference
        let pm = Box::leak(Box::new(PageMap::new()));
        let heap = PageHeap::new(pm);
        (pm, heap)
    }

    #[test]
    fn test_allocate_single_page() {
        let (pm, mut heap) = make_heap();
        unsafe {
            let span = heap.allocate_span(1);
            assert!(!span.is_null());
            assert!((*span).num_pages >= 1);
            assert_eq!((*span).state, SpanState::InUse);

            // Should be registered in pagemap
            let found = pm.get((*span).start_page);
            assert_eq!(found, span);

            heap.deallocate_span(span);
        }
    }

    #[test]
    fn test_allocate_multiple_pages() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let span = heap.allocate_span(10);
            assert!(!span.is_null());
            assert!((*span).num_pages >= 10);

            heap.deallocate_span(span);
        }
    }

    #[test]
    fn test_reuse_freed_span() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            let s1 = heap.allocate_span(1);
            assert!(!s1.is_null());
            let _page1 = (*s1).start_page;
            heap.deallocate_span(s1);

            // Allocate again - should reuse from free list
            let s2 = heap.allocate_span(1);
            assert!(!s2.is_null());

            heap.deallocate_span(s2);
        }
    }

    #[test]
    fn test_splitting() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            // Allocate a large span first to populate free lists
            let big = heap.allocate_span(MAX_PAGES);
            assert!(!big.is_null());
            heap.deallocate_span(big);

            // Now allocate a small span - should split from the free span
            let small = heap.allocate_span(5);
            assert!(!small.is_null());
            assert_eq!((*small).num_pages, 5);

            heap.deallocate_span(small);
        }
    }

    #[test]
    fn test_many_allocations() {
        let (_pm, mut heap) = make_heap();
        let mut spans = Vec::new();
        unsafe {
            for _ in 0..100 {
                let s = heap.allocate_span(1);
                assert!(!s.is_null());
                spans.push(s);
            }
            for s in spans {
                heap.deallocate_span(s);
            }
        }
    }

    #[test]
    fn test_coalesce_skipped_past_max_pages() {
        let (_pm, mut heap) = make_heap();
        unsafe {
            // Two full-size spans freed adjacently would exceed MAX_PAGES if
            // merged; the heap must leave them as two separate free spans.
            let a = heap.allocate_span(MAX_PAGES);
            let b = heap.allocate_span(MAX_PAGES);
            assert!(!a.is_null() && !b.is_null());
            heap.deallocate_span(a);
            heap.deallocate_span(b);

            let s = heap.allocate_span(MAX_PAGES);
            assert!(!s.is_null());
            assert_eq!((*s).num_pages, MAX_PAGES);
            heap.deallocate_span(s);
        }
    }
}
