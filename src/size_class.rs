//! Size class table and lookup functions.
//!
//! Requests up to 256 KiB are bucketed into 208 size classes across five
//! stepped-alignment ranges, capping internal fragmentation near 10%:
//!
//! | Range (bytes)    | Align | Count | Indices |
//! |-------------------|-------|-------|---------|
//! | 1 – 128           | 8     | 16    | 0…15    |
//! | 129 – 1024        | 16    | 56    | 16…71   |
//! | 1025 – 8192       | 128   | 56    | 72…127  |
//! | 8193 – 65536      | 1024  | 56    | 128…183 |
//! | 65537 – 262144    | 8192  | 24    | 184…207 |
//!
//! Requests above 262144 bytes bypass size classes entirely and are served
//! directly by the page heap.

use crate::platform;

/// Total number of size classes.
pub const NUM_SIZE_CLASSES: usize = 208;

/// Largest size served through a size class; above this, allocations bypass
/// the thread/central cache and go straight to the page heap.
pub const MAX_SMALL_SIZE: usize = 262_144;

struct Range {
    /// Upper bound (inclusive) of the *previous* range; 0 for the first.
    base: usize,
    align_shift: u32,
    count: usize,
    /// First class index in this range.
    offset: usize,
}

const RANGES: [Range; 5] = [
    Range { base: 0, align_shift: 3, count: 16, offset: 0 },
    Range { base: 128, align_shift: 4, count: 56, offset: 16 },
    Range { base: 1024, align_shift: 7, count: 56, offset: 72 },
    Range { base: 8192, align_shift: 10, count: 56, offset: 128 },
    Range { base: 65536, align_shift: 13, count: 24, offset: 184 },
];

/// Per-class static data that does not depend on the runtime page size.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Allocation size for this class, in bytes. All allocations in this
    /// class are rounded up to this size.
    pub size: usize,
    /// Number of objects to transfer between thread cache and central cache
    /// in one batch: `clamp(MAX_SMALL_SIZE / size, 2, 512)`.
    pub batch_count: usize,
}

const fn batch_count_for(size: usize) -> usize {
    let raw = MAX_SMALL_SIZE / size;
    if raw < 2 {
        2
    } else if raw > 512 {
        512
    } else {
        raw
    }
}

const fn build_table() -> [SizeClassInfo; NUM_SIZE_CLASSES] {
    let mut table = [SizeClassInfo { size: 0, batch_count: 0 }; NUM_SIZE_CLASSES];
    let mut r = 0;
    while r < RANGES.len() {
        let range = &RANGES[r];
        let align = 1usize << range.align_shift;
        let mut local = 0;
        while local < range.count {
            let size = range.base + (local + 1) * align;
            table[range.offset + local] = SizeClassInfo {
                size,
                batch_count: batch_count_for(size),
            };
            local += 1;
        }
        r += 1;
    }
    table
}

/// The size class table, indexed 0..NUM_SIZE_CLASSES.
pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = build_table();

/// Map a request size to its size class index.
///
/// Returns `None` for `size == 0` (callers should treat a zero-size request
/// as a minimum-size allocation, per the entry point's "must not crash"
/// contract) or for sizes above [`MAX_SMALL_SIZE`] (callers route these to
/// the page heap directly).
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_SMALL_SIZE {
        return None;
    }
    let mut r = 0;
    while r < RANGES.len() {
        let range = &RANGES[r];
        let range_hi = range.base + (range.count << range.align_shift);
        if size <= range_hi {
            let local = (size - range.base - 1) >> range.align_shift;
            return Some(range.offset + local);
        }
        r += 1;
    }
    None
}

/// The allocation size for a given class index.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Static info (size, batch count) for a class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}

/// Number of pages the page heap hands the central cache when it must grow
/// a size class: `ceil(batch_count(size) * size / page_size())`.
///
/// Computed on demand (not cached in the static table) because it depends on
/// the runtime page size; this is off the allocator's hot path (only called
/// when the central free list must populate a fresh span).
#[inline]
pub fn page_count(cls: usize) -> usize {
    let info = class_info(cls);
    (info.batch_count * info.size).div_ceil(platform::page_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_sizes() {
        assert_eq!(size_to_class(1), Some(0));
        assert_eq!(class_to_size(0), 8);

        assert_eq!(size_to_class(128), Some(15));
        assert_eq!(class_to_size(15), 128);

        assert_eq!(size_to_class(129), Some(16));
        assert_eq!(class_to_size(16), 144);

        assert_eq!(size_to_class(MAX_SMALL_SIZE), Some(207));
        assert_eq!(class_to_size(207), MAX_SMALL_SIZE);

        assert_eq!(size_to_class(MAX_SMALL_SIZE + 1), None);
    }

    #[test]
    fn test_zero_size() {
        assert_eq!(size_to_class(0), None);
    }

    #[test]
    fn test_round_trip_all_classes() {
        for cls in 0..NUM_SIZE_CLASSES {
            let size = class_to_size(cls);
            assert!(size > 0, "class {cls} has zero size");
            assert_eq!(
                size_to_class(size),
                Some(cls),
                "round-trip failed for class {cls} (size {size})"
            );
        }
    }

    #[test]
    fn test_classes_monotonically_increasing() {
        for i in 1..NUM_SIZE_CLASSES {
            assert!(
                SIZE_CLASSES[i].size > SIZE_CLASSES[i - 1].size,
                "class {} size {} not greater than class {} size {}",
                i,
                SIZE_CLASSES[i].size,
                i - 1,
                SIZE_CLASSES[i - 1].size
            );
        }
    }

    #[test]
    fn test_rounds_up_to_class() {
        assert_eq!(class_to_size(size_to_class(1).unwrap()), 8);
        assert_eq!(class_to_size(size_to_class(7).unwrap()), 8);
        assert_eq!(class_to_size(size_to_class(9).unwrap()), 16);
        assert_eq!(class_to_size(size_to_class(1025).unwrap()), 1025 + 127);
    }

    #[test]
    fn test_batch_count_bounds() {
        for cls in 0..NUM_SIZE_CLASSES {
            let info = class_info(cls);
            assert!(info.batch_count >= 2);
            assert!(info.batch_count <= 512);
        }
    }

    #[test]
    fn test_class_counts_per_range() {
        // 16 + 56 + 56 + 56 + 24 == 208
        assert_eq!(NUM_SIZE_CLASSES, 208);
    }

    #[test]
    fn test_page_count_covers_batch() {
        for cls in 0..NUM_SIZE_CLASSES {
            let info = class_info(cls);
            let pages = page_count(cls);
            assert!(
                pages * platform::page_size() >= info.batch_count * info.size,
                "class {cls}: {pages} pages too small for batch"
            );
        }
    }
}
