//! Size class table and lookup functions.
//!
//! Objects are bucketed into size classes to bound internal fragmentation
//! while keeping free-list bookkeeping cheap. Five bands partition
//! `[1, MAX_BYTES]`, each with its own alignment:
//!
//! | range              | alignment |
//! |--------------------|-----------|
//! | 1        ..= 128   | 8         |
//! | 128+1    ..= 1 KiB  | 16        |
//! | 1 KiB+1  ..= 8 KiB  | 128       |
//! | 8 KiB+1  ..= 64 KiB | 1 KiB     |
//! | 64 KiB+1 ..= 256 KiB| 8 KiB     |
//!
//! This yields exactly 208 classes (16 + 56 + 56 + 56 + 24), plus index 0
//! as an unused sentinel — `NUM_SIZE_CLASSES = 209`.

use crate::config::MAX_BYTES;
use crate::config::{MAX_BATCH_SIZE, MIN_BATCH_SIZE, PAGE_SHIFT, PAGE_SIZE};

/// Per-band `(upper_bound, alignment)`. Upper bounds are cumulative and
/// each is an exact multiple of its own alignment, so class counts divide
/// evenly.
const BANDS: [(usize, usize); 5] = [
    (128, 8),
    (1024, 16),
    (8192, 128),
    (65536, 1024),
    (262144, 8192),
];

/// Number of classes contributed by each band.
const fn band_count(band: usize) -> usize {
    let (hi, align) = BANDS[band];
    let prev_hi = if band == 0 { 0 } else { BANDS[band - 1].0 };
    (hi - prev_hi) / align
}

/// Cumulative class-index offset of each band (class indices are 1-based;
/// index 0 is the sentinel).
const fn band_offset(band: usize) -> usize {
    let mut off = 1; // skip the sentinel
    let mut i = 0;
    while i < band {
        off += band_count(i);
        i += 1;
    }
    off
}

/// Total number of real size classes.
pub const NUM_CLASSES: usize = band_offset(5) - 1;
/// Number of entries in `SIZE_CLASSES` (classes + sentinel at index 0).
pub const NUM_SIZE_CLASSES: usize = NUM_CLASSES + 1;

/// Information about a single size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes). All requests in this class
    /// are rounded up to this size.
    pub size: usize,
    /// Number of pages the central cache carves a span into for this class.
    pub pages: usize,
    /// Target number of objects moved between the thread cache and the
    /// central cache in one batch.
    pub batch_size: usize,
}

const fn clamp(v: usize, lo: usize, hi: usize) -> usize {
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}

/// `NumMoveSize(s) = clamp(MAX_BYTES / RoundUp(s), MIN_BATCH_SIZE, MAX_BATCH_SIZE)`.
const fn num_move_size(class_size: usize) -> usize {
    clamp(MAX_BYTES / class_size, MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// `NumMovePage(s) = max(1, (NumMoveSize(s) * RoundUp(s)) >> PAGE_SHIFT)`.
const fn num_move_page(class_size: usize) -> usize {
    let pages = (num_move_size(class_size) * class_size) >> PAGE_SHIFT;
    if pages == 0 { 1 } else { pages }
}

/// The size class table, built at compile time from `BANDS`. Index 0 is the
/// sentinel (size 0, unused).
pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = const {
    let mut table = [SizeClassInfo {
        size: 0,
        pages: 0,
        batch_size: 0,
    }; NUM_SIZE_CLASSES];

    let mut band = 0;
    let mut idx = 1;
    while band < BANDS.len() {
        let (hi, align) = BANDS[band];
        let prev_hi = if band == 0 { 0 } else { BANDS[band - 1].0 };
        let count = band_count(band);
        let mut i = 1;
        while i <= count {
            let size = prev_hi + i * align;
            table[idx] = SizeClassInfo {
                size,
                pages: num_move_page(size),
                batch_size: num_move_size(size),
            };
            idx += 1;
            i += 1;
        }
        band += 1;
    }
    table
};

/// Small-size fast lookup: index = `(size + 7) / 8`, covers `0..=1024` in
/// 8-byte steps. Built at compile time by scanning `SIZE_CLASSES`.
const SMALL_LOOKUP_LEN: usize = 1024 / 8 + 1;

static SMALL_LOOKUP: [u16; SMALL_LOOKUP_LEN] = const {
    let mut table = [0u16; SMALL_LOOKUP_LEN];
    let mut i = 0;
    while i < SMALL_LOOKUP_LEN {
        let size = if i == 0 { 1 } else { i * 8 };
        let mut cls = 1;
        while cls < NUM_SIZE_CLASSES {
            if SIZE_CLASSES[cls].size >= size {
                break;
            }
            cls += 1;
        }
        table[i] = cls as u16;
        i += 1;
    }
    table
};

/// Map an allocation size to its size class index.
///
/// `size == 0` is treated as the minimum allocation (the reference
/// behavior spec.md calls out as implementation-defined). Sizes beyond
/// `MAX_BYTES` return 0, signaling a large allocation.
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size == 0 {
        return 1;
    }
    if size > MAX_BYTES {
        return 0;
    }
    if size <= 1024 {
        let idx = (size + 7) / 8;
        return SMALL_LOOKUP[idx] as usize;
    }
    // Binary search over the remaining ~150 classes.
    let mut lo = SMALL_LOOKUP[SMALL_LOOKUP_LEN - 1] as usize;
    let mut hi = NUM_SIZE_CLASSES - 1;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if SIZE_CLASSES[mid].size >= size {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

/// Get the rounded-up allocation size for a given size class index.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

/// Get the size class metadata for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}

/// `RoundUp(s)`: the class size a request of `s` bytes is rounded up to.
/// Only meaningful for `s in [1, MAX_BYTES]`.
#[inline]
pub fn round_up(size: usize) -> usize {
    class_to_size(size_to_class(size))
}

/// `Index(s)`: alias for [`size_to_class`], named to match spec terminology.
#[inline]
pub fn index(size: usize) -> usize {
    size_to_class(size)
}
