//! Thread Cache (front-end): per-thread free lists for lock-free allocation.
//!
//! Each thread gets its own `ThreadCache` via `std::thread_local!`. The fast
//! path (thread cache hit) requires zero synchronization. When the thread
//! cache is empty or overflowing a size class, it batches transfers to/from
//! the central cache directly — there is no intermediate tier.
//!
//! `max_size` per size class only ever grows (slow-start, then capped at the
//! class's batch size): unlike gperftools' `ListTooLong`, there is no
//! overage-triggered shrink and no low-water-mark scavenge. A thread that
//! goes quiet keeps whatever it grew to until it exits, at which point
//! `flush_and_destroy` returns everything to the central cache.

use crate::central_free_list::CentralCache;
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
    /// Maximum length before we return objects to the central cache.
    /// Monotonically non-decreasing over the life of the thread cache.
    max_length: u32,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            length: 0,
            max_length: 1, // Start small, grows adaptively.
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

    /// Push a linked list of `count` objects.
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
                tail = obj; // First popped becomes tail after reversal.
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
    /// Total bytes currently cached across all size classes.
    total_size: usize,
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
            total_size: 0,
        }
    }

    /// Flush all cached objects back to the central cache. Called once, on
    /// thread exit.
    ///
    /// # Safety
    ///
    /// Must only be called once per thread cache lifetime.
    pub unsafe fn flush_and_destroy(
        &mut self,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        for cls in 1..NUM_SIZE_CLASSES {
            let list = &mut self.lists[cls];
            if list.length > 0 {
                let info = size_class::class_info(cls);
                let (count, head, _tail) = list.pop_batch(list.length);
                if count > 0 {
                    self.total_size -= count as usize * info.size;
                    unsafe {
                        crate::central_free_list::insert_range_dropping_lock(
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
    }

    /// Allocate an object of the given size class. Returns null if allocation fails.
    ///
    /// # Safety
    ///
    /// `size_class` must be a valid index in `1..NUM_SIZE_CLASSES`.
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
            let obj_size = size_class::class_to_size(size_class);
            self.total_size -= obj_size;
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
        let obj = ptr as *mut FreeObject;
        list.push(obj);

        let obj_size = size_class::class_to_size(size_class);
        self.total_size += obj_size;

        if list.length > list.max_length {
            unsafe { self.release_to_central(size_class, central, page_heap, pagemap) };
        }
    }

    /// Slow path: fetch a batch of objects from the central cache.
    ///
    /// Slow-start: fetches `min(max_length, batch_size)` objects and grows
    /// `max_length` on each call, never shrinking it.
    #[cold]
    unsafe fn fetch_from_central(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> *mut u8 {
        let info = size_class::class_info(size_class);
        let batch = info.batch_size;
        let list = &mut self.lists[size_class];

        let num_to_move = (list.max_length as usize).min(batch).max(1);

        let (count, head) = unsafe {
            crate::central_free_list::remove_range_dropping_lock(
                central.get(size_class),
                size_class,
                num_to_move,
                page_heap,
                pagemap,
            )
        };

        if count == 0 || head.is_null() {
            return ptr::null_mut();
        }

        let result = head;
        let remaining_head = unsafe { (*head).next };
        let remaining_count = count - 1;

        if remaining_count > 0 {
            list.push_batch(remaining_head, remaining_count as u32);
            self.total_size += remaining_count * info.size;
        }

        Self::grow_max_length(list, batch);

        result as *mut u8
    }

    /// Release the excess objects back to the central cache: detach exactly
    /// `list.max_length` objects, leaving whatever remainder is left over
    /// (normally just the one object that pushed the list past its cap).
    unsafe fn release_to_central(
        &mut self,
        size_class: usize,
        central: &CentralCache,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        let info = size_class::class_info(size_class);
        let list = &mut self.lists[size_class];

        let to_release = list.max_length.min(list.length);
        if to_release == 0 {
            return;
        }

        let (count, head, _tail) = list.pop_batch(to_release);
        self.total_size -= count as usize * info.size;

        unsafe {
            crate::central_free_list::insert_range_dropping_lock(
                central.get(size_class),
                head,
                count as usize,
                page_heap,
                pagemap,
            )
        };

        Self::grow_max_length(list, info.batch_size);
    }

    /// Grow `max_length`: slow-start while below the batch size, then hold
    /// steady at the batch size. Never shrinks.
    #[inline]
    fn grow_max_length(list: &mut FreeList, batch_size: usize) {
        let batch = batch_size as u32;
        if list.max_length < batch {
            list.max_length += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_heap::PageHeap;
    use crate::pagemap::PageMap;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn make_test_env() -> (&'static PageMap, SpinMutex<PageHeap>, CentralCache) {
        let pm = Box::leak(Box::new(PageMap::new()));
        let heap = SpinMutex::new(PageHeap::new(pm));
        let cache = CentralCache::new();
        (pm, heap, cache)
    }

    #[test]
    fn test_allocate_and_deallocate() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let ptr = tc.allocate(1, &central, &heap, pm);
            assert!(!ptr.is_null());
            tc.deallocate(ptr, 1, &central, &heap, pm);
        }
    }

    #[test]
    fn test_allocate_many() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..1000 {
                let ptr = tc.allocate(4, &central, &heap, pm);
                assert!(!ptr.is_null());
                ptrs.push(ptr);
            }
            for ptr in ptrs {
                tc.deallocate(ptr, 4, &central, &heap, pm);
            }
        }
    }

    #[test]
    fn test_mixed_sizes() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let mut allocs: Vec<(usize, *mut u8)> = Vec::new();
            for cls in [1, 4, 8, 12, 16, 20, 24] {
                for _ in 0..50 {
                    let ptr = tc.allocate(cls, &central, &heap, pm);
                    assert!(!ptr.is_null());
                    allocs.push((cls, ptr));
                }
            }
            for (cls, ptr) in allocs {
                tc.deallocate(ptr, cls, &central, &heap, pm);
            }
        }
    }

    #[test]
    fn test_reuse_from_cache() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let ptr1 = tc.allocate(2, &central, &heap, pm);
            assert!(!ptr1.is_null());
            tc.deallocate(ptr1, 2, &central, &heap, pm);

            let ptr2 = tc.allocate(2, &central, &heap, pm);
            assert!(!ptr2.is_null());
            assert_eq!(ptr1, ptr2);

            tc.deallocate(ptr2, 2, &central, &heap, pm);
        }
    }

    #[test]
    fn test_max_length_never_shrinks() {
        let (pm, heap, central) = make_test_env();
        let mut tc = ThreadCache::new();

        unsafe {
            let mut ptrs = Vec::new();
            let mut max_seen = 0u32;
            for _ in 0..5000 {
                let ptr = tc.allocate(1, &central, &heap, pm);
                assert!(!ptr.is_null());
                ptrs.push(ptr);
            }
            for ptr in ptrs {
                tc.deallocate(ptr, 1, &central, &heap, pm);
                let cur = tc.lists[1].max_length;
                assert!(cur >= max_seen, "max_length shrank: {cur} < {max_seen}");
                max_seen = cur;
            }
        }
    }
}
