//! Thread Cache (front-end): per-thread free lists for lock-free allocation.
//!
//! `allocator.rs` keeps one `ThreadCache` per OS thread in a `std::thread_local!`
//! and drains it into the central cache when the thread exits. The fast path
//! (thread cache hit) requires zero synchronization. When a size class's free
//! list empties or grows past its current high-water mark, this type batches
//! a transfer to/from the central free list.

use crate::central_free_list::{self, CentralCache};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::span::FreeObject;
use crate::sync::SpinMutex;
use core::ptr;

/// Per-size-class free list within the thread cache.
struct FreeList {
    /// Head of the singly-linked intrusive free list.
    head: *mut FreeObject,
    /// Number of objects currently in this list.
    length: u32,
    /// How many objects a refill is currently allowed to take in one batch.
    /// Starts at 1 and grows by 1 each time a refill takes the full
    /// `max_length` (meaning the central cache had at least that many to
    /// give — a sign this size class is in active use on this thread).
    max_length: u32,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            length: 0,
            max_length: 1,
        }
    }

    #[inline]
    fn pop(&mut self) -> *mut FreeObject {
        let obj = self.head;
        if !obj.is_null() {
            self.head = unsafe { (*obj).next };
            self.length -= 1;
        }
        obj
    }

    #[inline]
    fn push(&mut self, obj: *mut FreeObject) {
        unsafe { (*obj).next = self.head };
        self.head = obj;
        self.length += 1;
    }

    /// Push a linked list of `count` objects, already chained via `next`.
    fn push_batch(&mut self, head: *mut FreeObject, count: u32) {
        if head.is_null() || count == 0 {
            return;
        }
        let mut tail = head;
        for _ in 1..count {
            let next = unsafe { (*tail).next };
            if next.is_null() {
                break;
            }
            tail = next;
        }
        unsafe { (*tail).next = self.head };
        self.head = head;
        self.length += count;
    }

    /// Pop up to `count` objects into a linked list. Returns (actual_count, head, tail).
    fn pop_batch(&mut self, count: u32) -> (u32, *mut FreeObject, *mut FreeObject) {
        let mut head: *mut FreeObject = ptr::null_mut();
        let mut tail: *mut FreeObject = ptr::null_mut();
        let mut popped = 0u32;
        while popped < count && !self.head.is_null() {
            let obj = self.head;
            self.head = unsafe { (*obj).next };
            unsafe { (*obj).next = head };
            if tail.is_null() {
                tail = obj; // First popped becomes tail after reversal
            }
            head = obj;
            self.length -= 1;
            popped += 1;
        }
        (popped, head, tail)
    }
}

/// Per-thread cache holding free lists for each size class.
pub struct ThreadCache {
    lists: [FreeList; NUM_SIZE_CLASSES],
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
        }
    }

    /// Allocate an object of the given size class.
    /// Returns null if allocation fails.
    ///
    /// # Safety
    ///
    /// `size_class` must be a valid index in `0..NUM_SIZE_CLASSES`.
    #[inline]
    pub unsafe fn allocate(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let list = &mut self.lists[size_class];
        let obj = list.pop();
        if !obj.is_null() {
            return obj as *mut u8;
        }
        unsafe { self.fetch_from_central(size_class, central, page_heap, pagemap) }
    }

    /// Deallocate an object of the given size class.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a prior `allocate` call for `size_class`.
    #[inline]
    pub unsafe fn deallocate(
        &mut self,
        ptr: *mut u8,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let list = &mut self.lists[size_class];
        list.push(ptr as *mut FreeObject);

        if list.length > list.max_length {
            unsafe { self.release_to_central(size_class, central, page_heap, pagemap) };
        }
    }

    /// Drain every size class's free list back to the central cache. Called
    /// once, when the owning thread is exiting.
    ///
    /// # Safety
    ///
    /// Must only be called once per thread cache lifetime.
    pub unsafe fn drain(
        &mut self,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        for cls in 0..NUM_SIZE_CLASSES {
            let list = &mut self.lists[cls];
            if list.length == 0 {
                continue;
            }
            let (count, head, _tail) = list.pop_batch(list.length);
            if count > 0 {
                unsafe {
                    central_free_list::insert_range_dropping_lock(
                        central.get(cls),
                        head,
                        count as usize,
                        page_heap,
                        pagemap,
                    )
                };
            }
        }
    }

    /// Slow path: fetch a batch of objects from the central free list.
    ///
    /// Fetches `max_length` objects. If the central cache had that many to
    /// give (the transfer wasn't cut short), grow `max_length` by one so the
    /// next refill asks for a bigger batch — simple, unconditional
    /// slow-start, capped at the size class's own batch count.
    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let list = &mut self.lists[size_class];
        let requested = list.max_length;

        let (count, head) = unsafe {
            central_free_list::remove_range_dropping_lock(
                central.get(size_class),
                size_class,
                requested as usize,
                page_heap,
                pagemap,
            )
        };

        if count == 0 || head.is_null() {
            return ptr::null_mut();
        }

        let result = head;
        let remaining_head = unsafe { (*head).next };
        let remaining_count = count as u32 - 1;

        if remaining_count > 0 {
            list.push_batch(remaining_head, remaining_count);
        }

        if count as u32 >= requested {
            let cap = size_class::class_info(size_class).batch_count as u32;
            list.max_length = (list.max_length + 1).min(cap);
        }

        result as *mut u8
    }

    /// Release a batch of objects back to the central cache once this size
    /// class's free list outgrows `max_length`. Releases `max_length`
    /// objects (not the size class's `batch_count`), so batches flow out at
    /// the same cadence they flow in.
    unsafe fn release_to_central(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let list = &mut self.lists[size_class];
        let to_release = list.max_length.min(list.length);
        if to_release == 0 {
            return;
        }

        let (count, head, _tail) = list.pop_batch(to_release);
        unsafe {
            central_free_list::insert_range_dropping_lock(
                central.get(size_class),
                head,
                count as usize,
                page_heap,
                pagemap,
            )
        };
    }
}
