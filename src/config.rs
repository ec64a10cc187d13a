//! Compile-time tuning constants.
//!
//! Everything here is a `pub(crate) const`. There is deliberately no
//! build-time code generation and no environment variable or TOML file to
//! read: the allocator's shape is fixed at compile time.

/// log2 of the page size. Pages are the unit the page cache hands out.
pub const PAGE_SHIFT: usize = 13;
/// Page size in bytes (8 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest request served through a size class; anything bigger is a
/// direct page-cache allocation.
pub const MAX_BYTES: usize = 256 * 1024;

/// `free_lists[k]` in the page cache holds spans of exactly `k` pages for
/// `k` in `1..NPAGES`. Spans with `k >= NPAGES` are large allocations: the
/// page cache never caches or coalesces them, always requesting them fresh
/// from the OS and returning them immediately on free.
pub const NPAGES: usize = 129;

/// Lower bound on `NumMoveSize`: even a size class with a huge `RoundUp`
/// value moves at least this many objects per thread-cache/central-cache
/// batch.
pub const MIN_BATCH_SIZE: usize = 2;
/// Upper bound on `NumMoveSize`.
pub const MAX_BATCH_SIZE: usize = 512;
