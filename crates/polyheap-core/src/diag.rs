//! Fatal-error reporting that is safe to call from allocator internals.
//!
//! The allocator cannot use `eprintln!` or any formatting machinery for its
//! own fatal conditions: both may allocate, and the failing subsystem is the
//! allocator itself. Diagnostics are written with a single raw `write(2)` and
//! the process is aborted.

/// Write `msg` to stderr and abort the process.
///
/// Used for the two unrecoverable conditions in this subsystem: TLS key
/// registration failure and failure to resolve a real platform thread
/// routine. Neither has a fallback; continuing would dereference an invalid
/// pointer or strand every subsequent allocation.
pub fn fatal(msg: &str) -> ! {
    // SAFETY: msg points to valid initialized bytes for msg.len(). write(2)
    // does not retain the pointer.
    let _ = unsafe { libc::write(2, msg.as_ptr().cast(), msg.len()) };
    std::process::abort();
}
