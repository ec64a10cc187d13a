//! Page ID -> Span pointer map.
//!
//! On 64-bit targets this is a 3-level radix tree. For 48-bit virtual
//! addresses with a 13-bit page shift, we have 35 bits of page ID, split as
//! root 12 bits, mid 12 bits, leaf 11 bits. The root is statically allocated
//! (32 KiB); mid and leaf nodes are lazily allocated from the OS.
//!
//! On 32-bit targets the whole address space only yields 19 bits of page
//! ID, small enough that a single flat array of pointers (2 MiB) covers it
//! without any lazy node allocation.
//!
//! Reads are lock-free (AtomicPtr with Acquire). Writes must happen under
//! external synchronization (the page heap lock).

use crate::span::Span;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(target_pointer_width = "32"))]
use crate::config::PAGE_SIZE;
#[cfg(not(target_pointer_width = "32"))]
use crate::platform;

#[cfg(not(target_pointer_width = "32"))]
const ROOT_BITS: usize = 12;
#[cfg(not(target_pointer_width = "32"))]
const MID_BITS: usize = 12;
#[cfg(not(target_pointer_width = "32"))]
const LEAF_BITS: usize = 11;

#[cfg(not(target_pointer_width = "32"))]
const ROOT_LEN: usize = 1 << ROOT_BITS; // 4096
#[cfg(not(target_pointer_width = "32"))]
const MID_LEN: usize = 1 << MID_BITS; // 4096
#[cfg(not(target_pointer_width = "32"))]
const LEAF_LEN: usize = 1 << LEAF_BITS; // 2048

#[cfg(not(target_pointer_width = "32"))]
const MID_SHIFT: usize = LEAF_BITS; // 11
#[cfg(not(target_pointer_width = "32"))]
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS; // 23

#[cfg(not(target_pointer_width = "32"))]
const MID_MASK: usize = (1 << MID_BITS) - 1;
#[cfg(not(target_pointer_width = "32"))]
const LEAF_MASK: usize = (1 << LEAF_BITS) - 1;

#[cfg(not(target_pointer_width = "32"))]
#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[cfg(not(target_pointer_width = "32"))]
#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEAF_LEN],
}

/// 3-level radix tree for page_id -> *mut Span lookup (64-bit targets).
#[cfg(not(target_pointer_width = "32"))]
pub struct PageMap {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
}

// AtomicPtr is Send+Sync, and we only expose safe operations
#[cfg(not(target_pointer_width = "32"))]
unsafe impl Send for PageMap {}
#[cfg(not(target_pointer_width = "32"))]
unsafe impl Sync for PageMap {}

/// Helper to create a const-initialized array of null AtomicPtrs.
/// We use a macro since const generics with AtomicPtr arrays require this.
macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        // SAFETY: AtomicPtr<T>::new(null_mut()) is just a null pointer,
        // which has the same bit pattern as zeroed memory.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

#[cfg(not(target_pointer_width = "32"))]
impl PageMap {
    /// Create a new empty page map. All root entries are null.
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            root: null_atomic_array!(ROOT_LEN, MidNode),
        }
    }

    /// Look up the span for a given page ID. Returns null if not set.
    /// This is lock-free.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let root_idx = page_id >> ROOT_SHIFT;
        let mid_idx = (page_id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page_id & LEAF_MASK;

        if root_idx >= ROOT_LEN {
            return ptr::null_mut();
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }

        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
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
        let root_idx = page_id >> ROOT_SHIFT;
        let mid_idx = (page_id >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page_id & LEAF_MASK;

        assert!(root_idx < ROOT_LEN, "page_id out of range for page map");

        // Ensure mid node exists
        let mut mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            mid = unsafe { Self::alloc_mid_node() };
            assert!(!mid.is_null(), "failed to allocate mid node for page map");
            // Store with Release so readers see the initialized node
            self.root[root_idx].store(mid, Ordering::Release);
        }

        // Ensure leaf node exists
        let mut leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            leaf = unsafe { Self::alloc_leaf_node() };
            assert!(!leaf.is_null(), "failed to allocate leaf node for page map");
            unsafe { (*mid).children[mid_idx].store(leaf, Ordering::Release) };
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

    unsafe fn alloc_mid_node() -> *mut MidNode {
        let size = core::mem::size_of::<MidNode>();
        // Round up to page size
        let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let ptr = unsafe { platform::page_alloc(alloc_size) };
        // page_alloc returns zeroed memory, which is valid for AtomicPtr (all null)
        ptr.cast::<MidNode>()
    }

    unsafe fn alloc_leaf_node() -> *mut LeafNode {
        let size = core::mem::size_of::<LeafNode>();
        let alloc_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let ptr = unsafe { platform::page_alloc(alloc_size) };
        ptr.cast::<LeafNode>()
    }
}

/// Flat single-level page map for 32-bit targets.
///
/// A 32-bit address space with a 13-bit page shift only has 19 bits of page
/// ID (524288 entries), small enough to allocate the whole table as a
/// single statically-sized array rather than a lazily-populated tree.
#[cfg(target_pointer_width = "32")]
const FLAT_BITS: usize = 19;
#[cfg(target_pointer_width = "32")]
const FLAT_LEN: usize = 1 << FLAT_BITS;

#[cfg(target_pointer_width = "32")]
pub struct PageMap {
    slots: [AtomicPtr<Span>; FLAT_LEN],
}

#[cfg(target_pointer_width = "32")]
unsafe impl Send for PageMap {}
#[cfg(target_pointer_width = "32")]
unsafe impl Sync for PageMap {}

#[cfg(target_pointer_width = "32")]
macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        // SAFETY: AtomicPtr<T>::new(null_mut()) is just a null pointer,
        // which has the same bit pattern as zeroed memory.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

#[cfg(target_pointer_width = "32")]
impl PageMap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            slots: null_atomic_array!(FLAT_LEN, Span),
        }
    }

    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        if page_id >= FLAT_LEN {
            return ptr::null_mut();
        }
        self.slots[page_id].load(Ordering::Acquire)
    }

    /// # Safety
    /// Must be called under external synchronization (the page heap lock).
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        assert!(page_id < FLAT_LEN, "page_id out of range for page map");
        self.slots[page_id].store(span, Ordering::Release);
    }

    /// # Safety
    /// Must be called under external synchronization.
    pub unsafe fn register_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        for page_id in start..start + count {
            unsafe { self.set(page_id, span) };
        }
    }

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

    /// # Safety
    /// Must be called under external synchronization.
    pub unsafe fn unregister_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        for page_id in start..start + count {
            unsafe { self.set(page_id, ptr::null_mut()) };
        }
    }
}
