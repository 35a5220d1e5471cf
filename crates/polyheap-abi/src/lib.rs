// All extern "C" ABI exports accept raw pointers from C callers; contracts
// are inherited from the platform functions they replace.
#![allow(clippy::missing_safety_doc)]
//! # polyheap-abi
//!
//! ABI-compatible boundary layer for polyheap.
//!
//! This crate exports same-named replacements for the platform's thread
//! entry points so that TLAB setup and teardown wrap every thread body
//! transparently:
//!
//! ```text
//! caller -> pthread_create (ours) -> real pthread_create -> thread_start
//!              package entry fn            (dlsym)            |- lease + cache
//!                                                             |- real entry fn
//!                                                             `- flush + release
//! ```
//!
//! The replacements preserve signature, return values, and error semantics;
//! the calling thread observes exactly what the un-intercepted call would
//! have produced.
//!
//! Modules exporting `#[no_mangle]` symbols are gated behind
//! `cfg(not(test))`: in this crate's own unit-test binary they would shadow
//! libc and recurse. Integration tests build the library without `cfg(test)`
//! and exercise the real symbols.

#[cfg(not(test))]
pub mod thread_abi;

#[cfg(all(not(test), feature = "interpose"))]
pub mod malloc_abi;
