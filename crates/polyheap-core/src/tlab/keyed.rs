//! Keyed TLAB storage: the cache is tracked under a `pthread_key_t`.
//!
//! One process-wide key is created on first use, guarded by a `Once`. The
//! cache object itself is allocated from the global pool and its pointer
//! stored under the key; the registered destructor flushes the cache,
//! releases the heap lease, and returns the storage when a thread
//! terminates by any means, including paths the lifecycle interceptor
//! never sees.
//!
//! Interceptor-driven teardown clears the key's value before retiring the
//! cache, so the runtime destructor finds nothing left to do and cleanup
//! stays exactly-once.

use core::ffi::c_void;
use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::cache::LocalCache;
use crate::diag;
use crate::pool::GlobalPool;

static KEY_ONCE: Once = Once::new();
static HEAP_KEY: AtomicU32 = AtomicU32::new(0);

// Pool blocks are 16-byte aligned; the cache must fit that.
const _: () = assert!(align_of::<LocalCache>() <= 16);

fn heap_key() -> libc::pthread_key_t {
    KEY_ONCE.call_once(|| {
        let mut key: libc::pthread_key_t = 0;
        // SAFETY: key is a valid out-pointer; destroy_cache matches the
        // destructor signature.
        let rc = unsafe { libc::pthread_key_create(&mut key, Some(destroy_cache)) };
        if rc != 0 {
            // Every subsequent allocation depends on this key existing.
            diag::fatal("polyheap: pthread_key_create failed, aborting\n");
        }
        HEAP_KEY.store(key as u32, Ordering::Release);
    });
    HEAP_KEY.load(Ordering::Acquire) as libc::pthread_key_t
}

/// Runtime-invoked destructor for threads that end without interception.
///
/// POSIX clears the key's value before calling this, so a re-entrant lookup
/// during teardown cannot observe the dying cache.
extern "C" fn destroy_cache(raw: *mut c_void) {
    let cache = raw.cast::<LocalCache>();
    if cache.is_null() {
        return;
    }
    // SAFETY: raw was stored by construct() and is no longer reachable
    // through the key.
    unsafe {
        (*cache).retire();
        GlobalPool::instance().free(cache.cast());
    }
}

/// The calling thread's cache, constructed on first call.
#[inline]
pub fn local_cache() -> *mut LocalCache {
    let key = heap_key();
    // SAFETY: key was created by heap_key().
    let existing = unsafe { libc::pthread_getspecific(key) };
    if !existing.is_null() {
        return existing.cast();
    }
    construct(key)
}

/// The calling thread's cache if it already exists, else null.
#[inline]
pub fn local_cache_if_constructed() -> *mut LocalCache {
    if !KEY_ONCE.is_completed() {
        return core::ptr::null_mut();
    }
    // SAFETY: the completed Once guarantees the key exists.
    unsafe { libc::pthread_getspecific(heap_key()).cast() }
}

#[cold]
fn construct(key: libc::pthread_key_t) -> *mut LocalCache {
    let pool = GlobalPool::instance();
    let raw = pool.malloc(size_of::<LocalCache>());
    if raw.is_null() {
        diag::fatal("polyheap: cannot allocate a thread cache, aborting\n");
    }
    let cache = raw.cast::<LocalCache>();
    // SAFETY: raw is a fresh pool block sized and aligned for a LocalCache.
    unsafe { cache.write(LocalCache::new(pool)) };
    // SAFETY: key is valid; cache stays live until teardown.
    let rc = unsafe { libc::pthread_setspecific(key, cache.cast::<c_void>()) };
    if rc != 0 {
        diag::fatal("polyheap: pthread_setspecific failed, aborting\n");
    }
    cache
}

/// Flush the calling thread's cache, release its lease, and return its
/// storage to the pool.
///
/// The key's value is cleared first: a later runtime destructor invocation
/// (or a second call from another termination path) sees null and does
/// nothing.
pub fn teardown_local_cache() {
    if !KEY_ONCE.is_completed() {
        return;
    }
    let key = heap_key();
    // SAFETY: key is valid for this process.
    let existing = unsafe { libc::pthread_getspecific(key) };
    if existing.is_null() {
        return;
    }
    // SAFETY: clearing before retiring keeps teardown exactly-once.
    unsafe {
        libc::pthread_setspecific(key, core::ptr::null());
        let cache = existing.cast::<LocalCache>();
        (*cache).retire();
        GlobalPool::instance().free(cache.cast());
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::lock;
    use crate::pool::GlobalPool;

    #[test]
    fn keyed_lookup_is_idempotent() {
        let _g = lock();
        let handle = std::thread::spawn(|| {
            let first = super::local_cache();
            let second = super::local_cache();
            let same = first == second;
            super::teardown_local_cache();
            same
        });
        assert!(handle.join().unwrap());
    }

    #[test]
    fn runtime_destructor_cleans_up_unintercepted_threads() {
        let _g = lock();
        let before = GlobalPool::instance().stats();
        std::thread::spawn(|| {
            // Construct through the keyed strategy, allocate, and return
            // without any explicit teardown: the pthread runtime must run
            // the registered destructor.
            let cache = super::local_cache();
            // SAFETY: ptr came from this thread's cache.
            unsafe {
                let ptr = (*cache).malloc(256);
                (*cache).free(ptr);
            }
        })
        .join()
        .unwrap();
        let after = GlobalPool::instance().stats();
        assert_eq!(after.leases_granted - before.leases_granted, 1);
        assert_eq!(after.leases_released - before.leases_released, 1);
        assert_eq!(after.bytes_outstanding, before.bytes_outstanding);
    }

    #[test]
    fn explicit_teardown_preempts_the_destructor() {
        let _g = lock();
        let before = GlobalPool::instance().stats();
        std::thread::spawn(|| {
            let _ = super::local_cache();
            super::teardown_local_cache();
            // The runtime destructor will also fire at thread exit; the
            // cleared key value must make it a no-op.
        })
        .join()
        .unwrap();
        let after = GlobalPool::instance().stats();
        assert_eq!(after.leases_granted - before.leases_granted, 1);
        assert_eq!(
            after.leases_released - before.leases_released,
            1,
            "teardown plus destructor must release exactly once"
        );
    }
}
