#![no_std]

//! segcache: a thread-caching, segregated-fit allocator in the TCMalloc
//! tradition.
//!
//! Three tiers, leaves first:
//! - Thread Cache: per-thread segregated free lists, no locking.
//! - Central Cache: 208 per-size-class locked span lists.
//! - Page Cache: a global page-granularity span pool that talks to the OS.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: segcache::SegCache = segcache::SegCache;
//! ```

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod central_free_list;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod page_heap;
pub mod pagemap;
pub mod platform;
pub mod size_class;
pub mod span;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;
#[cfg(feature = "std")]
pub mod thread_cache;

pub(crate) mod macros;

pub use allocator::SegCache;

/// Number of pages a span may grow to before it is routed directly to/from
/// the OS instead of through the page cache's bucketed free lists.
pub const MAX_PAGES: usize = 128;
