//! Two-level radix tree mapping page IDs to Span pointers.
//!
//! The leaf level is fixed at 15 bits (32768 entries, 256 KiB per leaf node)
//! and allocated lazily from the OS as addresses are touched. The root level
//! is sized to cover the rest of a platform's virtual address space assuming
//! the smallest page size that platform can plausibly report (4 KiB on a
//! 64-bit target, giving a 48-bit address space 21 root bits — a single
//! leaf covers the low 15 + page-shift bits of that space). A host that
//! actually uses a larger page size (common on ARM macOS, some embedded
//! targets) only ever touches a subset of the root table's entries, so this
//! sizing is always sufficient, never short.
//!
//! The root is statically allocated (zero-initialized, so it costs no space
//! in the binary — only in `.bss`). Leaf nodes are lazily allocated from the
//! OS on first touch. Reads are lock-free (AtomicPtr with Acquire). Writes
//! must happen under external synchronization (the page heap lock).

use crate::platform;
use crate::span::Span;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const LEAF_BITS: usize = 15;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const LEAF_MASK: usize = LEAF_LEN - 1;

#[cfg(target_pointer_width = "64")]
const ASSUMED_VA_BITS: usize = 48;
#[cfg(target_pointer_width = "32")]
const ASSUMED_VA_BITS: usize = 32;

const ASSUMED_MIN_PAGE_SHIFT: usize = 12;

const ROOT_BITS: usize = ASSUMED_VA_BITS - ASSUMED_MIN_PAGE_SHIFT - LEAF_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

/// Two-level radix tree for page_id -> *mut Span lookup.
pub struct PageMap {
    root: [AtomicPtr<LeafNode>; ROOT_LEN],
}

// AtomicPtr is Send+Sync, and we only expose safe operations.
unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap {
    /// Create a new empty page map. All root entries are null.
    pub const fn new() -> Self {
        Self {
            root: [const { AtomicPtr::new(ptr::null_mut()) }; ROOT_LEN],
        }
    }

    /// Look up the span for a given page ID. Returns null if not set.
    /// This is lock-free.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let root_idx = page_id >> LEAF_BITS;
        let leaf_idx = page_id & LEAF_MASK;

        if root_idx >= ROOT_LEN {
            return ptr::null_mut();
        }

        let leaf = self.root[root_idx].load(Ordering::Acquire);
        if leaf.is_null() {
            return ptr::null_mut();
        }

        unsafe { (*leaf).spans[leaf_idx].load(Ordering::Acquire) }
    }

    /// Set the span for a given page ID.
    ///
    /// # Safety
    /// Must be called under external synchronization (the page heap lock).
    /// The span pointer must be valid or null.
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let root_idx = page_id >> LEAF_BITS;
        let leaf_idx = page_id & LEAF_MASK;

        assert!(root_idx < ROOT_LEN, "page_id out of range for page map");

        let mut leaf = self.root[root_idx].load(Ordering::Acquire);
        if leaf.is_null() {
            leaf = unsafe { Self::alloc_leaf_node() };
            assert!(!leaf.is_null(), "failed to allocate leaf node for page map");
            self.root[root_idx].store(leaf, Ordering::Release);
        }

        unsafe { (*leaf).spans[leaf_idx].store(span, Ordering::Release) };
    }

    /// Register a span for all pages it covers.
    ///
    /// # Safety
    /// Must be called under external synchronization.
    pub unsafe fn register_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        for page_id in start..start + count {
            unsafe { self.set(page_id, span) };
        }
    }

    /// Register only the first and last pages of a free span.
    ///
    /// Free spans only need endpoints in the pagemap because coalescing
    /// only looks at adjacent pages (start-1 and end). This is O(1) vs
    /// O(n) for `register_span`. Only valid for free spans — in-use spans
    /// must use `register_span` since dealloc can look up any interior page.
    ///
    /// # Safety
    /// Must be called under external synchronization.
    pub unsafe fn register_span_endpoints(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        unsafe { self.set(start, span) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span) };
        }
    }

    /// Unregister a span (set all its pages to null).
    ///
    /// # Safety
    /// Must be called under external synchronization.
    pub unsafe fn unregister_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        for page_id in start..start + count {
            unsafe { self.set(page_id, ptr::null_mut()) };
        }
    }

    unsafe fn alloc_leaf_node() -> *mut LeafNode {
        let size = core::mem::size_of::<LeafNode>();
        // page_alloc returns zeroed memory, valid for AtomicPtr (all null).
        let ptr = unsafe { platform::page_alloc(size) };
        ptr.cast::<LeafNode>()
    }
}
