//! Top-level allocator: ties all tiers together and implements GlobalAlloc.
//!
//! Static state lives here. `SegCache` is zero-sized; all mutable state is
//! in module-level statics protected by spinlocks or atomics.
//!
//! Cache strategy:
//! - `std` feature: one `ThreadCache` per OS thread via `std::thread_local!`,
//!   drained into the central cache when the thread exits.
//! - without `std`: every allocation goes straight to the central cache
//!   (locked, but still size-class segregated — a valid, if slower, mode
//!   for `no_std` targets that have no thread-local storage to give us).

use crate::central_free_list::{self, CentralCache};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::platform;
use crate::size_class;
use crate::span::{self, NO_SIZE_CLASS};
use crate::sync::SpinMutex;
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

#[cfg(feature = "std")]
use crate::span::FreeObject;
#[cfg(feature = "std")]
use crate::thread_cache::ThreadCache;

pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_HEAP: SpinMutex<PageHeap> = SpinMutex::new(PageHeap::new(&PAGE_MAP));
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

#[cfg(feature = "std")]
struct ThreadCacheCell(core::cell::UnsafeCell<ThreadCache>);

// SAFETY: only ever accessed from the owning thread, through `TC_CELL`.
#[cfg(feature = "std")]
unsafe impl Sync for ThreadCacheCell {}

#[cfg(feature = "std")]
impl Drop for ThreadCacheCell {
    fn drop(&mut self) {
        // Drain this thread's cached objects back to the central cache
        // rather than leaking them — a thread exiting is not a free lunch.
        unsafe { (*self.0.get()).drain(&CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
    }
}

#[cfg(feature = "std")]
std::thread_local! {
    static TC_CELL: ThreadCacheCell = ThreadCacheCell(core::cell::UnsafeCell::new(ThreadCache::new()));
}

/// A thread-caching, segregated-fit allocator in the TCMalloc tradition.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: segcache::SegCache = segcache::SegCache;
/// ```
pub struct SegCache;

unsafe impl GlobalAlloc for SegCache {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);

        let align = layout.align();

        if align <= 8 {
            if let Some(class) = size_class::size_to_class(size) {
                return unsafe { self.alloc_small(class) };
            }
        } else {
            let effective_size = size.max(align);
            if let Some(class) = size_class::size_to_class(effective_size) {
                let class_size = size_class::class_to_size(class);
                if align <= platform::page_size() && class_size.is_multiple_of(align) {
                    return unsafe { self.alloc_small(class) };
                }
            }
        }

        unsafe { self.alloc_large(size) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        stat_inc!(dealloc_count);

        // The span's own size class is authoritative, not the caller's
        // Layout — this is what lets a large/huge pointer be freed even
        // though the caller only knows the size it originally asked for.
        let page_id = (ptr as usize) >> platform::page_shift();
        let span = PAGE_MAP.get(page_id);
        if span.is_null() {
            return;
        }

        let sc = unsafe { (*span).size_class };
        if sc != NO_SIZE_CLASS {
            unsafe { self.dealloc_small(ptr, sc as usize) };
        } else {
            unsafe { self.dealloc_large(span) };
        }
    }
}

impl SegCache {
    #[cfg(feature = "std")]
    #[inline(always)]
    unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
        match TC_CELL.try_with(|cell| unsafe {
            let tc = &mut *cell.0.get();
            tc.allocate(class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP)
        }) {
            Ok(ptr) => ptr,
            Err(_) => unsafe { self.alloc_from_central(class) },
        }
    }

    #[cfg(feature = "std")]
    #[inline(always)]
    unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
        if TC_CELL
            .try_with(|cell| unsafe {
                let tc = &mut *cell.0.get();
                tc.deallocate(ptr, class, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP);
            })
            .is_err()
        {
            unsafe { self.dealloc_to_central(ptr, class) };
        }
    }

    #[cfg(not(feature = "std"))]
    #[inline(always)]
    unsafe fn alloc_small(&self, class: usize) -> *mut u8 {
        unsafe { self.alloc_from_central(class) }
    }

    #[cfg(not(feature = "std"))]
    #[inline(always)]
    unsafe fn dealloc_small(&self, ptr: *mut u8, class: usize) {
        unsafe { self.dealloc_to_central(ptr, class) };
    }

    unsafe fn alloc_from_central(&self, size_class: usize) -> *mut u8 {
        stat_inc!(central_cache_hits);
        // Goes through the lock-dropping variant, not `CentralFreeList::
        // remove_range` directly — the bucket lock must not be held across
        // the page heap call `remove_range` may need to make (§5).
        let (count, head) = unsafe {
            central_free_list::remove_range_dropping_lock(
                CENTRAL_CACHE.get(size_class),
                size_class,
                1,
                &PAGE_HEAP,
                &PAGE_MAP,
            )
        };
        if count == 0 || head.is_null() {
            ptr::null_mut()
        } else {
            head as *mut u8
        }
    }

    #[cfg(feature = "std")]
    unsafe fn dealloc_to_central(&self, ptr: *mut u8, size_class: usize) {
        let obj = ptr as *mut FreeObject;
        unsafe { (*obj).next = ptr::null_mut() };
        // Same reasoning as `alloc_from_central`: the lock-dropping variant
        // keeps the bucket lock from being held across `deallocate_span`.
        unsafe {
            central_free_list::insert_range_dropping_lock(
                CENTRAL_CACHE.get(size_class),
                obj,
                1,
                &PAGE_HEAP,
                &PAGE_MAP,
            )
        };
    }

    #[cfg(not(feature = "std"))]
    unsafe fn dealloc_to_central(&self, ptr: *mut u8, size_class: usize) {
        use crate::span::FreeObject;
        let obj = ptr as *mut FreeObject;
        unsafe { (*obj).next = ptr::null_mut() };
        unsafe {
            central_free_list::insert_range_dropping_lock(
                CENTRAL_CACHE.get(size_class),
                obj,
                1,
                &PAGE_HEAP,
                &PAGE_MAP,
            )
        };
    }

    /// Serve a request above [`size_class::MAX_SMALL_SIZE`]: one object per
    /// span, no size-class carving.
    ///
    /// Requests up to [`crate::MAX_PAGES`] pages still go through the page
    /// heap (so they can be reused via its free lists and coalescing).
    /// Anything larger bypasses the page heap and talks to the OS directly —
    /// such a span would only ever be coalesced with itself.
    unsafe fn alloc_large(&self, size: usize) -> *mut u8 {
        let page_size = platform::page_size();
        let size_pages = size.div_ceil(page_size);

        if size_pages <= crate::MAX_PAGES {
            stat_inc!(page_heap_allocs);
            let span = unsafe { PAGE_HEAP.lock().allocate_span(size_pages) };
            if span.is_null() {
                return ptr::null_mut();
            }
            unsafe {
                (*span).obj_size = size;
                PAGE_MAP.register_span(span);
            }
            return unsafe { (*span).start_addr() };
        }

        stat_inc!(huge_allocs);
        let alloc_size = size_pages * page_size;
        let raw = unsafe { platform::page_alloc(alloc_size) };
        if raw.is_null() {
            return ptr::null_mut();
        }

        let s = span::alloc_span();
        if s.is_null() {
            unsafe { platform::page_dealloc(raw, alloc_size) };
            return ptr::null_mut();
        }

        unsafe {
            (*s).start_page = (raw as usize) >> platform::page_shift();
            (*s).num_pages = size_pages;
            (*s).state = crate::span::SpanState::InUse;
            // Recording the exact requested size (not just the page count)
            // here is what lets accounting and `realloc` tell a huge
            // allocation's real size apart from the page-rounded capacity.
            (*s).obj_size = size;
            PAGE_MAP.register_span(s);
        }

        raw
    }

    /// Return a large or huge span. Large spans (<=MAX_PAGES) go back to the
    /// page heap's free lists; huge spans are released straight to the OS.
    unsafe fn dealloc_large(&self, span: *mut crate::span::Span) {
        let num_pages = unsafe { (*span).num_pages };
        if num_pages <= crate::MAX_PAGES {
            unsafe { PAGE_HEAP.lock().deallocate_span(span) };
            return;
        }

        let start_addr = unsafe { (*span).start_addr() };
        let byte_size = unsafe { (*span).byte_size() };
        unsafe {
            PAGE_MAP.unregister_span(span);
            span::dealloc_span(span);
            platform::page_dealloc(start_addr, byte_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_dealloc_small() {
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = SegCache.alloc(layout);
            assert!(!ptr.is_null());
            *ptr = 0x42;
            assert_eq!(*ptr, 0x42);
            SegCache.dealloc(ptr, layout);
        }
    }

    #[test]
    fn test_alloc_dealloc_large_through_page_heap() {
        unsafe {
            let layout = Layout::from_size_align(300_000, 8).unwrap();
            let ptr = SegCache.alloc(layout);
            assert!(!ptr.is_null());
            *ptr = 0x7;
            *ptr.add(layout.size() - 1) = 0x9;
            SegCache.dealloc(ptr, layout);
        }
    }

    #[test]
    fn test_alloc_dealloc_huge_direct_os() {
        unsafe {
            let size = (crate::MAX_PAGES + 1) * platform::page_size();
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = SegCache.alloc(layout);
            assert!(!ptr.is_null());
            *ptr = 0xAA;
            *ptr.add(size - 1) = 0xBB;
            SegCache.dealloc(ptr, layout);
        }
    }

    #[test]
    fn test_huge_span_records_exact_size() {
        unsafe {
            let size = (crate::MAX_PAGES + 1) * platform::page_size() + 17;
            let layout = Layout::from_size_align(size, 8).unwrap();
            let ptr = SegCache.alloc(layout);
            assert!(!ptr.is_null());

            let page_id = (ptr as usize) >> platform::page_shift();
            let span = PAGE_MAP.get(page_id);
            assert!(!span.is_null());
            assert_eq!((*span).obj_size, size);

            SegCache.dealloc(ptr, layout);
        }
    }

    #[test]
    fn test_zero_size_alloc() {
        unsafe {
            let layout = Layout::from_size_align(0, 1).unwrap();
            let ptr = SegCache.alloc(layout);
            assert!(!ptr.is_null());
            SegCache.dealloc(ptr, layout);
        }
    }

    #[test]
    fn test_many_small_allocations() {
        unsafe {
            let layout = Layout::from_size_align(48, 8).unwrap();
            let mut ptrs = std::vec::Vec::new();
            for i in 0..2000 {
                let ptr = SegCache.alloc(layout);
                assert!(!ptr.is_null());
                *ptr = (i % 256) as u8;
                ptrs.push(ptr);
            }
            for (i, ptr) in ptrs.into_iter().enumerate() {
                assert_eq!(*ptr, (i % 256) as u8);
                SegCache.dealloc(ptr, layout);
            }
        }
    }

    #[test]
    fn test_alloc_zeroed_default_is_zero() {
        unsafe {
            let layout = Layout::from_size_align(128, 8).unwrap();
            let ptr = SegCache.alloc_zeroed(layout);
            assert!(!ptr.is_null());
            for i in 0..128 {
                assert_eq!(*ptr.add(i), 0);
            }
            SegCache.dealloc(ptr, layout);
        }
    }
}
