//! # polyheap-core
//!
//! Per-thread heap attachment for a multiprocessor memory allocator.
//!
//! Every thread gets a private allocation cache (a thread-local allocation
//! buffer, or TLAB) backed by a shared pool of heaps. The cache is created
//! lazily on the thread's first allocation and torn down exactly once when
//! the thread ends, whichever way it ends.
//!
//! # Architecture
//!
//! ```text
//! caller -> tlab::local_cache() -> LocalCache (per thread)
//!                                      |  batch refill / flush
//!                                      v
//!                               GlobalPool (heap slots, central free lists)
//!                                      |  chunked mmap
//!                                      v
//!                                   kernel
//! ```
//!
//! The TLAB storage strategy is selected at build time: the default inline
//! strategy keeps the cache in a thread-local buffer with no dynamic
//! allocation; the `tls-keyed` feature selects a `pthread_key_t`-backed
//! strategy whose registered destructor also covers threads that terminate
//! through paths the lifecycle interceptor in `polyheap-abi` does not see.

pub mod cache;
pub mod config;
pub mod diag;
pub(crate) mod list;
pub mod pool;
pub mod size_class;
pub mod tlab;

pub use cache::LocalCache;
pub use pool::{GlobalPool, HeapLease, PoolError, PoolStats};
