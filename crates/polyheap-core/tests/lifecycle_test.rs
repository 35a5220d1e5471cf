//! Thread lifecycle properties exercised through real OS threads.
//!
//! These tests drive the TLAB contract the way the lifecycle interceptor
//! does (construct on first use, tear down before the thread ends) and
//! check the pool-level accounting the design guarantees.

use std::sync::Mutex;

use polyheap_core::pool::GlobalPool;
use polyheap_core::tlab;

// All tests below read deltas off the process-wide pool; serialize them so
// the deltas are attributable to the test body.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `body` on a fresh thread with TLAB setup and teardown around it,
/// mirroring what the interceptor's wrapper does.
fn run_wrapped<F: FnOnce() + Send + 'static>(body: F) {
    std::thread::spawn(move || {
        let _ = tlab::local_cache();
        body();
        tlab::teardown_local_cache();
    })
    .join()
    .unwrap();
}

#[test]
fn one_construction_one_teardown_per_thread() {
    let _g = lock();
    let before = GlobalPool::instance().stats();
    run_wrapped(|| {
        let cache = tlab::local_cache();
        // A single allocation forces the lazy path end to end.
        // SAFETY: ptr came from this thread's cache.
        unsafe {
            let ptr = (*cache).malloc(40);
            assert!(!ptr.is_null());
            (*cache).free(ptr);
        }
    });
    let after = GlobalPool::instance().stats();
    assert_eq!(after.leases_granted - before.leases_granted, 1);
    assert_eq!(after.leases_released - before.leases_released, 1);
}

#[test]
fn balanced_churn_leaves_no_outstanding_bytes() {
    let _g = lock();
    let before = GlobalPool::instance().stats();

    let mut handles = Vec::new();
    for _ in 0..6 {
        handles.push(std::thread::spawn(|| {
            let cache = tlab::local_cache();
            for round in 0..100usize {
                let size = [24, 100, 700, 4000][round % 4];
                // SAFETY: ptr came from this thread's cache.
                unsafe {
                    let ptr = (*cache).malloc(size);
                    assert!(!ptr.is_null());
                    (*cache).free(ptr);
                }
            }
            tlab::teardown_local_cache();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let after = GlobalPool::instance().stats();
    assert_eq!(after.bytes_outstanding, before.bytes_outstanding);
    assert_eq!(after.blocks_outstanding, before.blocks_outstanding);
    assert_eq!(after.leases_granted - before.leases_granted, 6);
    assert_eq!(after.leases_released - before.leases_released, 6);
}

#[test]
fn heap_identities_track_concurrency_not_thread_count() {
    let _g = lock();
    // Engage multi-threaded slot scanning, as the interceptor would.
    GlobalPool::instance().note_thread_created();
    let before = GlobalPool::instance().stats();

    // Twelve threads total, never more than three alive at once.
    for _round in 0..4 {
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(std::thread::spawn(|| {
                let cache = tlab::local_cache();
                // SAFETY: ptr came from this thread's cache.
                unsafe {
                    let ptr = (*cache).malloc(64);
                    (*cache).free(ptr);
                }
                tlab::teardown_local_cache();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    let after = GlobalPool::instance().stats();
    assert_eq!(after.leases_granted - before.leases_granted, 12);
    assert!(
        after.heaps_ever_leased - before.heaps_ever_leased <= 3,
        "identities ever leased must track the concurrency high-water mark, \
         grew by {}",
        after.heaps_ever_leased - before.heaps_ever_leased
    );
}

#[test]
fn unbalanced_allocations_stay_outstanding_until_freed() {
    let _g = lock();
    let before = GlobalPool::instance().stats();

    // The thread leaks one block on purpose; teardown flushes the magazines
    // but cannot reclaim what the application still notionally holds.
    let leaked = std::thread::spawn(|| {
        let cache = tlab::local_cache();
        // SAFETY: cache is this thread's own.
        let ptr = unsafe { (*cache).malloc(128) };
        tlab::teardown_local_cache();
        ptr as usize
    })
    .join()
    .unwrap();

    let mid = GlobalPool::instance().stats();
    assert_eq!(
        mid.bytes_outstanding - before.bytes_outstanding,
        128,
        "an unfreed block must remain outstanding after teardown"
    );

    // Returning it directly to the pool settles the account.
    // SAFETY: the block is unreachable by the exited thread.
    unsafe { GlobalPool::instance().free(leaked as *mut u8) };
    let after = GlobalPool::instance().stats();
    assert_eq!(after.bytes_outstanding, before.bytes_outstanding);
}
