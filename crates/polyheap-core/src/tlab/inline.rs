//! Inline TLAB storage: the cache lives in a thread-local buffer.
//!
//! A fixed-size buffer and a constructed-pointer cell sit together in
//! thread-local storage. The fast path is one thread-local read and a null
//! check; construction placement-writes the cache into the buffer. Nothing
//! here registers a runtime destructor (neither slot type has one), so
//! teardown is driven entirely by the lifecycle interceptor. The buffer
//! itself is reclaimed with the rest of the thread's storage.

use core::cell::{Cell, UnsafeCell};
use core::mem::MaybeUninit;
use core::ptr;

use crate::cache::LocalCache;
use crate::pool::GlobalPool;

/// Per-thread slot: the cache buffer and its constructed flag, co-located.
struct TlabSlot {
    constructed: Cell<*mut LocalCache>,
    storage: UnsafeCell<MaybeUninit<LocalCache>>,
}

thread_local! {
    static SLOT: TlabSlot = const {
        TlabSlot {
            constructed: Cell::new(ptr::null_mut()),
            storage: UnsafeCell::new(MaybeUninit::uninit()),
        }
    };
}

/// The calling thread's cache, constructed on first call.
#[inline]
pub fn local_cache() -> *mut LocalCache {
    SLOT.with(|slot| {
        let cache = slot.constructed.get();
        if cache.is_null() {
            construct_in(slot)
        } else {
            cache
        }
    })
}

/// The calling thread's cache if it already exists, else null.
#[inline]
pub fn local_cache_if_constructed() -> *mut LocalCache {
    SLOT.with(|slot| slot.constructed.get())
}

#[cold]
fn construct_in(slot: &TlabSlot) -> *mut LocalCache {
    let storage = slot.storage.get().cast::<LocalCache>();
    // SAFETY: the buffer is sized and aligned for a LocalCache, and the null
    // constructed pointer proves nothing was written there yet.
    unsafe { storage.write(LocalCache::new(GlobalPool::instance())) };
    slot.constructed.set(storage);
    storage
}

/// Flush the calling thread's cache and release its heap lease.
///
/// Clears the constructed pointer first, so invoking this from more than
/// one termination path still tears down only once. No storage is freed;
/// the buffer dies with the thread.
pub fn teardown_local_cache() {
    SLOT.with(|slot| {
        let cache = slot.constructed.get();
        if cache.is_null() {
            return;
        }
        slot.constructed.set(ptr::null_mut());
        // SAFETY: cache points at the cache constructed in this thread's
        // buffer; nulling the pointer above made this the only reference.
        unsafe { (*cache).retire() };
    });
}
