//! OS platform abstraction: virtual memory and the runtime page size.
//!
//! Provides `page_alloc`/`page_dealloc` wrapping `mmap`/`VirtualAlloc`, and
//! `page_shift`/`page_size`, which query the host's real page size once and
//! cache it rather than assuming a compile-time constant. The design requires
//! the page-size constant to be established before any allocation call can
//! observe it; a single `AtomicUsize`, lazily populated, satisfies that
//! without a lock (querying twice under a race is harmless — both threads
//! compute the same answer).

use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(windows)]
mod windows;

#[cfg(unix)]
mod unix;

static PAGE_SHIFT: AtomicUsize = AtomicUsize::new(0);

/// `log2` of the OS page size, computed on first use.
#[inline]
pub fn page_shift() -> usize {
    let cached = PAGE_SHIFT.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = query_os_page_size();
    let shift = size.trailing_zeros() as usize;
    PAGE_SHIFT.store(shift, Ordering::Relaxed);
    shift
}

/// The OS page size in bytes, computed on first use.
#[inline]
pub fn page_size() -> usize {
    1usize << page_shift()
}

#[cfg(unix)]
fn query_os_page_size() -> usize {
    unix::query_page_size()
}

#[cfg(windows)]
fn query_os_page_size() -> usize {
    windows::query_page_size()
}

/// Allocate `size` bytes of virtual memory, page-aligned.
/// Returns null on failure. Memory is zero-initialized by the OS.
/// `size` is rounded up to the platform allocation granularity.
///
/// # Safety
/// Caller must eventually call `page_dealloc` with the returned pointer and the
/// same `size` (before rounding).
#[inline]
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    #[cfg(windows)]
    {
        unsafe { windows::page_alloc(size) }
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_alloc(size) }
    }
}

/// Free virtual memory previously allocated by `page_alloc`.
///
/// # Safety
/// `ptr` must have been returned by `page_alloc`, and `size` must match
/// the original allocation size.
#[inline]
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::page_dealloc(ptr) };
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_dealloc(ptr, size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_shift_matches_size() {
        let shift = page_shift();
        let size = page_size();
        assert_eq!(1usize << shift, size);
        assert!(size >= 4096, "unexpectedly small page size: {size}");
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_page_shift_stable_across_calls() {
        assert_eq!(page_shift(), page_shift());
        assert_eq!(page_size(), page_size());
    }

    #[test]
    fn test_alloc_and_dealloc() {
        unsafe {
            let size = page_size();
            let ptr = page_alloc(size);
            assert!(!ptr.is_null());
            for i in 0..size {
                assert_eq!(*ptr.add(i), 0);
            }
            for i in 0..size {
                *ptr.add(i) = (i & 0xFF) as u8;
            }
            for i in 0..size {
                assert_eq!(*ptr.add(i), (i & 0xFF) as u8);
            }
            page_dealloc(ptr, size);
        }
    }

    #[test]
    fn test_alloc_multiple_pages() {
        unsafe {
            let size = page_size() * 8;
            let ptr = page_alloc(size);
            assert!(!ptr.is_null());
            *ptr = 0xAA;
            *ptr.add(size - 1) = 0xBB;
            assert_eq!(*ptr, 0xAA);
            assert_eq!(*ptr.add(size - 1), 0xBB);
            page_dealloc(ptr, size);
        }
    }

    #[test]
    fn test_alloc_large() {
        unsafe {
            let size = 1024 * 1024;
            let ptr = page_alloc(size);
            assert!(!ptr.is_null());
            page_dealloc(ptr, size);
        }
    }
}
