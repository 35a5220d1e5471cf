//! The per-thread allocation cache.
//!
//! One `LocalCache` exists per thread, exclusively owned by it, holding a
//! magazine of free blocks for each size class. The fast path (magazine hit)
//! touches no shared state. Misses batch-refill from the heap slot the cache
//! leased at construction; overflowing magazines spill half their contents
//! back to it.

use crate::config;
use crate::list::FreeList;
use crate::pool::{self, GlobalPool, HeapLease};
use crate::size_class::{self, NUM_SIZE_CLASSES};

/// Blocks fetched from the pool on a magazine miss.
const REFILL_BATCH: u32 = 16;

/// A thread's private allocation cache, bound to one leased heap slot.
pub struct LocalCache {
    pool: &'static GlobalPool,
    lease: Option<HeapLease>,
    magazines: [FreeList; NUM_SIZE_CLASSES],
    capacity: u32,
}

impl LocalCache {
    /// Build a cache bound to `pool`, leasing a heap slot in the process.
    pub fn new(pool: &'static GlobalPool) -> Self {
        let lease = pool.find_unused_heap();
        Self {
            pool,
            lease: Some(lease),
            magazines: [const { FreeList::new() }; NUM_SIZE_CLASSES],
            capacity: config::magazine_capacity(),
        }
    }

    /// Heap slot this cache is bound to, if it still holds its lease.
    pub fn heap_index(&self) -> Option<usize> {
        self.lease.as_ref().map(HeapLease::heap_index)
    }

    /// Total blocks currently held in magazines.
    pub fn cached_blocks(&self) -> usize {
        self.magazines.iter().map(|m| m.len() as usize).sum()
    }

    /// Allocate `size` bytes. Returns null on exhaustion.
    #[inline]
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        let Some(class) = size_class::class_for_size(size) else {
            return self.pool.malloc(size);
        };
        let block = self.magazines[class].pop();
        if !block.is_null() {
            return block.cast();
        }
        self.refill(class)
    }

    /// Release a block previously returned by this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this pool (any thread's cache or the pool
    /// directly) and must not be used afterwards.
    #[inline]
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: per contract, ptr is a pool payload with a header.
        let class = unsafe { pool::class_of_block(ptr) };
        if class == pool::LARGE_BLOCK_CLASS {
            // SAFETY: forwarded under the same contract.
            unsafe { self.pool.free(ptr) };
            return;
        }
        let class = class as usize;
        // SAFETY: small pool blocks hold a link word in their payload.
        unsafe { self.magazines[class].push(ptr.cast()) };
        if self.magazines[class].len() > self.capacity {
            self.spill(class);
        }
    }

    /// Flush every magazine back to the leased heap.
    pub fn clear(&mut self) {
        let heap = self.bound_heap();
        for class in 0..NUM_SIZE_CLASSES {
            let len = self.magazines[class].len();
            if len == 0 {
                continue;
            }
            let (count, head) = self.magazines[class].pop_batch(len);
            // SAFETY: the chain came from this magazine; blocks are free and
            // of the right class.
            unsafe { self.pool.insert_batch(heap, class, head, count) };
        }
    }

    /// Flush and surrender the heap lease. Idempotent; called exactly once
    /// per thread in practice, from whichever teardown path runs first.
    pub fn retire(&mut self) {
        self.clear();
        if let Some(lease) = self.lease.take() {
            self.pool.release_heap(lease);
        }
    }

    #[cold]
    fn refill(&mut self, class: usize) -> *mut u8 {
        let want = REFILL_BATCH.min(self.capacity.max(1));
        let (count, head) = self.pool.fetch_batch(self.bound_heap(), class, want);
        if count == 0 {
            return std::ptr::null_mut();
        }
        // Hand the first block to the caller, keep the rest.
        // SAFETY: head is a chain of count free blocks from the pool.
        let rest = unsafe { (*head).next };
        if count > 1 {
            unsafe { self.magazines[class].push_batch(rest, count - 1) };
        }
        head.cast()
    }

    #[cold]
    fn spill(&mut self, class: usize) {
        let excess = self.magazines[class].len() / 2;
        let (count, head) = self.magazines[class].pop_batch(excess);
        // SAFETY: the chain came from this magazine.
        unsafe {
            self.pool
                .insert_batch(self.bound_heap(), class, head, count)
        };
    }

    fn bound_heap(&self) -> usize {
        self.lease.as_ref().map_or(0, HeapLease::heap_index)
    }
}
