//! Thread lifecycle interception.
//!
//! Same-named replacements for `pthread_create` and `pthread_exit` (plus the
//! Solaris-family `thr_create` / `thr_exit` pair) that wrap every thread
//! body with TLAB setup and teardown. The real implementations are resolved
//! once via `dlsym(RTLD_NEXT, ..)` under a `OnceLock`; a failed resolution
//! aborts, since this module *is* the symbol of that name and has nothing to
//! fall back to.
//!
//! Teardown is one routine invoked from both termination paths: the wrapper
//! after the real entry function returns, and the `pthread_exit` replacement
//! before forwarding. Cleanup is therefore synchronous at the point of termination
//! rather than deferred to runtime-driven timing.

use std::ffi::{c_int, c_void};
use std::sync::OnceLock;

use polyheap_core::diag;
use polyheap_core::pool::GlobalPool;
use polyheap_core::tlab;

/// Signature shared by thread entry functions.
pub type StartRoutine = unsafe extern "C-unwind" fn(*mut c_void) -> *mut c_void;

type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    Option<StartRoutine>,
    *mut c_void,
) -> c_int;

type PthreadExitFn = unsafe extern "C-unwind" fn(*mut c_void) -> !;

/// The caller's entry function and argument, carried across the spawn
/// boundary. Unboxed and dropped by the wrapper before the body runs.
struct LaunchPack {
    start: StartRoutine,
    arg: *mut c_void,
}

/// Resolve the next definition of `symbol` after this one.
///
/// `symbol` must be NUL-terminated. Aborts on failure: our own definition
/// shadows the real one, so there is no address to fall back to.
fn resolve_next(symbol: &'static str) -> *mut c_void {
    debug_assert!(symbol.ends_with('\0'));
    // SAFETY: symbol is a static NUL-terminated string.
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr().cast()) };
    if addr.is_null() {
        diag::fatal("polyheap: cannot resolve a real thread routine, aborting\n");
    }
    addr
}

fn real_pthread_create() -> PthreadCreateFn {
    static REAL: OnceLock<PthreadCreateFn> = OnceLock::new();
    *REAL.get_or_init(|| {
        let addr = resolve_next("pthread_create\0");
        // SAFETY: the resolved symbol has the declared C signature.
        unsafe { std::mem::transmute::<*mut c_void, PthreadCreateFn>(addr) }
    })
}

fn real_pthread_exit() -> PthreadExitFn {
    static REAL: OnceLock<PthreadExitFn> = OnceLock::new();
    *REAL.get_or_init(|| {
        let addr = resolve_next("pthread_exit\0");
        // SAFETY: the resolved symbol has the declared C signature and does
        // not return.
        unsafe { std::mem::transmute::<*mut c_void, PthreadExitFn>(addr) }
    })
}

/// Flush the calling thread's cache and release its heap slot.
///
/// Shared by every termination path; idempotent because the storage
/// strategies clear their per-thread slot before retiring.
fn exit_routine() {
    tlab::teardown_local_cache();
}

/// Injected entry function: establish the TLAB around the real body.
unsafe extern "C-unwind" fn thread_start(raw: *mut c_void) -> *mut c_void {
    // Reconstitute and immediately consume the launch package; its storage
    // is gone before the body runs.
    // SAFETY: raw is the Box our pthread_create leaked for this thread.
    let pack = unsafe { Box::from_raw(raw.cast::<LaunchPack>()) };
    let LaunchPack { start, arg } = *pack;

    // Lease a heap and construct the cache before any user code allocates.
    let _ = tlab::local_cache();

    // SAFETY: start/arg are exactly what the caller handed to
    // pthread_create.
    let result = unsafe { start(arg) };

    exit_routine();
    result
}

/// Replacement `pthread_create`: identical contract to the platform call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_create(
    thread_out: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: Option<StartRoutine>,
    arg: *mut c_void,
) -> c_int {
    let Some(start) = start_routine else {
        return libc::EINVAL;
    };

    // Make sure the creating thread owns a cache before the first child
    // exists, and tell the pool multi-threaded bookkeeping is now required.
    let _ = tlab::local_cache();
    GlobalPool::instance().note_thread_created();

    let pack = Box::into_raw(Box::new(LaunchPack { start, arg }));
    // SAFETY: forwarding the caller's arguments unchanged, with our wrapper
    // substituted as the entry function.
    let rc = unsafe { (real_pthread_create())(thread_out, attr, Some(thread_start), pack.cast()) };
    if rc != 0 {
        // The wrapper will never run; reclaim the package.
        // SAFETY: pack was leaked above and not handed to a live thread.
        drop(unsafe { Box::from_raw(pack) });
    }
    rc
}

/// Replacement `pthread_exit`: tear down, then forward. Never returns.
#[unsafe(no_mangle)]
pub unsafe extern "C-unwind" fn pthread_exit(value: *mut c_void) -> ! {
    exit_routine();
    // SAFETY: forwarding to the real implementation, which does not return.
    unsafe { (real_pthread_exit())(value) }
}

// ---------------------------------------------------------------------------
// Solaris-family native thread API
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
mod native_thr {
    use super::*;

    type ThrId = libc::c_uint;

    type ThrCreateFn = unsafe extern "C" fn(
        *mut c_void,
        libc::size_t,
        Option<StartRoutine>,
        *mut c_void,
        libc::c_long,
        *mut ThrId,
    ) -> c_int;

    type ThrExitFn = unsafe extern "C-unwind" fn(*mut c_void) -> !;

    fn real_thr_create() -> ThrCreateFn {
        static REAL: OnceLock<ThrCreateFn> = OnceLock::new();
        *REAL.get_or_init(|| {
            let addr = resolve_next("thr_create\0");
            // SAFETY: the resolved symbol has the declared C signature.
            unsafe { std::mem::transmute::<*mut c_void, ThrCreateFn>(addr) }
        })
    }

    fn real_thr_exit() -> ThrExitFn {
        static REAL: OnceLock<ThrExitFn> = OnceLock::new();
        *REAL.get_or_init(|| {
            let addr = resolve_next("thr_exit\0");
            // SAFETY: the resolved symbol has the declared C signature and
            // does not return.
            unsafe { std::mem::transmute::<*mut c_void, ThrExitFn>(addr) }
        })
    }

    /// Replacement `thr_create`: shares the wrapper and teardown with the
    /// pthread pair.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn thr_create(
        stack_base: *mut c_void,
        stack_size: libc::size_t,
        start_routine: Option<StartRoutine>,
        arg: *mut c_void,
        flags: libc::c_long,
        new_thread: *mut ThrId,
    ) -> c_int {
        let Some(start) = start_routine else {
            return libc::EINVAL;
        };
        let _ = tlab::local_cache();
        GlobalPool::instance().note_thread_created();
        let pack = Box::into_raw(Box::new(LaunchPack { start, arg }));
        // SAFETY: forwarding with our wrapper substituted.
        let rc = unsafe {
            (real_thr_create())(
                stack_base,
                stack_size,
                Some(thread_start),
                pack.cast(),
                flags,
                new_thread,
            )
        };
        if rc != 0 {
            // SAFETY: pack was leaked above and not handed to a live thread.
            drop(unsafe { Box::from_raw(pack) });
        }
        rc
    }

    /// Replacement `thr_exit`: tear down, then forward. Never returns.
    #[unsafe(no_mangle)]
    pub unsafe extern "C-unwind" fn thr_exit(value: *mut c_void) -> ! {
        exit_routine();
        // SAFETY: forwarding to the real implementation.
        unsafe { (real_thr_exit())(value) }
    }
}
