//! TLAB storage: where each thread's `LocalCache` lives.
//!
//! Two interchangeable strategies implement the same contract, selected at
//! build time so the fast path compiles to the minimal sequence for the
//! target, never through a runtime branch:
//!
//! - [`inline`] (default): the cache sits in a fixed thread-local buffer
//!   next to a constructed-pointer cell. No dynamic allocation, and no
//!   runtime destructor. Teardown happens only through the lifecycle
//!   interceptor, so it is safe only when every thread-termination path is
//!   intercepted.
//! - [`keyed`] (`tls-keyed` feature): the cache is allocated from the pool
//!   and tracked under a single process-wide `pthread_key_t` whose
//!   registered destructor also cleans up threads that terminate through
//!   paths the interceptor does not see.
//!
//! Contract, either way:
//! - `local_cache()` is idempotent per thread and independent across
//!   threads; the first call on a thread leases a heap slot and constructs
//!   the cache.
//! - `teardown_local_cache()` flushes, releases the lease, and reclaims the
//!   cache's storage exactly once, no matter how many termination paths
//!   end up invoking it.

pub mod inline;
pub mod keyed;

cfg_if::cfg_if! {
    if #[cfg(feature = "tls-keyed")] {
        pub use keyed::{local_cache, local_cache_if_constructed, teardown_local_cache};
    } else {
        pub use inline::{local_cache, local_cache_if_constructed, teardown_local_cache};
    }
}
