//! Interposed C allocation surface.
//!
//! Routes `malloc`/`free`/`calloc`/`realloc` through the calling thread's
//! local cache. A thread-local reentry guard falls back to the native libc
//! allocator while the pool is mid-operation (the pool's own bookkeeping
//! allocates through the system allocator); frees are routed by the block
//! header fingerprint, so pointers from either allocator land back where
//! they came from.

use std::cell::Cell;
use std::ffi::c_void;

use polyheap_core::pool::{self, GlobalPool};
use polyheap_core::tlab;

unsafe extern "C" {
    #[link_name = "__libc_malloc"]
    fn native_malloc_sym(size: usize) -> *mut c_void;
    #[link_name = "__libc_free"]
    fn native_free_sym(ptr: *mut c_void);
    #[link_name = "__libc_realloc"]
    fn native_realloc_sym(ptr: *mut c_void, size: usize) -> *mut c_void;
}

thread_local! {
    static REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

struct ReentryGuard;

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        REENTRY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[inline]
fn enter() -> Option<ReentryGuard> {
    REENTRY_DEPTH.with(|depth| {
        if depth.get() > 0 {
            None
        } else {
            depth.set(depth.get() + 1);
            Some(ReentryGuard)
        }
    })
}

/// Interposed `malloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(_guard) = enter() else {
        // SAFETY: direct call to the libc allocator symbol.
        return unsafe { native_malloc_sym(size) };
    };
    let cache = tlab::local_cache();
    // SAFETY: cache is the calling thread's own local cache.
    unsafe { (*cache).malloc(size) }.cast()
}

/// Interposed `free`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: heap pointers from either allocator have readable bytes ahead
    // of the payload.
    if !unsafe { pool::is_pool_block(ptr.cast()) } {
        // SAFETY: not ours; hand it back to the native allocator.
        return unsafe { native_free_sym(ptr) };
    }
    let Some(_guard) = enter() else {
        // Reentrant free of a pool block: bypass the cache.
        // SAFETY: fingerprint above proved this is a pool block.
        return unsafe { GlobalPool::instance().free(ptr.cast()) };
    };
    let cache = tlab::local_cache_if_constructed();
    if cache.is_null() {
        // SAFETY: fingerprint above proved this is a pool block.
        unsafe { GlobalPool::instance().free(ptr.cast()) };
    } else {
        // SAFETY: pool blocks may be freed through any thread's cache.
        unsafe { (*cache).free(ptr.cast()) };
    }
}

/// Interposed `calloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    // SAFETY: same contract as malloc above.
    let ptr = unsafe { malloc(total) };
    if !ptr.is_null() {
        // Recycled pool blocks are not zeroed.
        // SAFETY: ptr spans at least total writable bytes.
        unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, total) };
    }
    ptr
}

/// Interposed `realloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        // SAFETY: same contract as malloc.
        return unsafe { malloc(size) };
    }
    // SAFETY: heap pointers have readable bytes ahead of the payload.
    if !unsafe { pool::is_pool_block(ptr.cast()) } {
        // SAFETY: native pointer stays with the native allocator.
        return unsafe { native_realloc_sym(ptr, size) };
    }
    // SAFETY: fingerprint above proved this is a pool block.
    let old_size = unsafe { pool::block_payload_size(ptr.cast()) };
    // SAFETY: same contract as malloc.
    let fresh = unsafe { malloc(size) };
    if fresh.is_null() {
        return std::ptr::null_mut();
    }
    let copy = old_size.min(size);
    // SAFETY: both regions are live and at least `copy` bytes long.
    unsafe {
        std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), fresh.cast::<u8>(), copy);
        free(ptr);
    }
    fresh
}
