//! Environment-driven configuration.
//!
//! Two knobs, both read once per process:
//! - `POLYHEAP_HEAPS`: override the number of heap slots in the global pool
//!   (default `2 x available_parallelism`, clamped to [`pool::MAX_HEAPS`]).
//! - `POLYHEAP_MAGAZINE`: override the per-size-class magazine capacity of
//!   each thread's local cache (default 64, clamped to [1, 4096]).
//!
//! Values are cached in a non-blocking atomic state machine rather than a
//! `OnceLock`: when the allocator is interposed via `LD_PRELOAD`, the
//! `env::var` call inside a `OnceLock::get_or_init` can re-enter the
//! allocator and deadlock on the lock it already holds. A racing second
//! resolver simply recomputes the same value.
//!
//! [`pool::MAX_HEAPS`]: crate::pool::MAX_HEAPS

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default magazine capacity per size class.
pub const DEFAULT_MAGAZINE_CAPACITY: u32 = 64;

/// Upper bound accepted for `POLYHEAP_MAGAZINE`.
const MAX_MAGAZINE_CAPACITY: u32 = 4096;

// Cached values, offset by 1 so 0 means "unresolved".
static CACHED_HEAP_SLOTS: AtomicUsize = AtomicUsize::new(0);
static CACHED_MAGAZINE: AtomicUsize = AtomicUsize::new(0);

fn parse_heap_slots(raw: &str) -> Option<usize> {
    let n: usize = raw.trim().parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(n.min(crate::pool::MAX_HEAPS))
}

fn parse_magazine_capacity(raw: &str) -> Option<u32> {
    let n: u32 = raw.trim().parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(n.min(MAX_MAGAZINE_CAPACITY))
}

fn default_heap_slots() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus * 2).clamp(2, crate::pool::MAX_HEAPS)
}

/// Number of heap slots the pool should be built with.
pub fn heap_slots() -> usize {
    let cached = CACHED_HEAP_SLOTS.load(Ordering::Acquire);
    if cached != 0 {
        return cached - 1;
    }
    let resolved = std::env::var("POLYHEAP_HEAPS")
        .ok()
        .as_deref()
        .and_then(parse_heap_slots)
        .unwrap_or_else(default_heap_slots);
    CACHED_HEAP_SLOTS.store(resolved + 1, Ordering::Release);
    resolved
}

/// Magazine capacity for each size class of a local cache.
pub fn magazine_capacity() -> u32 {
    let cached = CACHED_MAGAZINE.load(Ordering::Acquire);
    if cached != 0 {
        return (cached - 1) as u32;
    }
    let resolved = std::env::var("POLYHEAP_MAGAZINE")
        .ok()
        .as_deref()
        .and_then(parse_magazine_capacity)
        .unwrap_or(DEFAULT_MAGAZINE_CAPACITY);
    CACHED_MAGAZINE.store(resolved as usize + 1, Ordering::Release);
    resolved
}
