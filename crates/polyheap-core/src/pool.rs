//! The global heap pool.
//!
//! A process-wide singleton holding a bounded set of heap slots. Each slot
//! carries per-size-class central free lists; threads lease a slot for the
//! lifetime of their local cache and batch blocks to and from it. Backing
//! memory is carved from anonymous `mmap` chunks; requests above the largest
//! size class are mapped directly.
//!
//! Every block carries a 16-byte header recording its size class (or the
//! large-path payload size) plus a fingerprint word, so `free` can route any
//! pool pointer without external metadata.
//!
//! Accounting is kept at the pool boundary: bytes and blocks are counted as
//! outstanding while they are held outside the central lists, whether by a
//! thread's magazines or by the application. A thread that allocated and
//! freed equal amounts leaves the counters exactly where they started once
//! its cache is flushed.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::config;
use crate::list::{FreeBlock, FreeList};
use crate::size_class::{self, NUM_SIZE_CLASSES};

/// Hard upper bound on heap slots (the ever-leased mask is one word).
pub const MAX_HEAPS: usize = 64;

/// Bytes reserved ahead of every payload.
pub const HEADER_BYTES: usize = 16;

/// Granularity of chunk mappings the small-block carver draws from.
const CHUNK_BYTES: usize = 1 << 20;

/// Page size assumed for large mappings.
const PAGE_BYTES: usize = 4096;

/// Fingerprint word stamped into every block header.
const BLOCK_MAGIC: u32 = 0x504f_4c59;

/// Header class value marking a direct-mapped block.
const LARGE_CLASS: u32 = u32::MAX;

/// Bounded length of the lifecycle event ring.
const EVENT_CAPACITY: usize = 256;

/// Per-block metadata stored immediately before the payload.
#[repr(C)]
struct BlockHeader {
    /// Size class index, or [`LARGE_CLASS`] for direct mappings.
    class: u32,
    /// [`BLOCK_MAGIC`]; lets `free` recognize pool blocks.
    magic: u32,
    /// Payload bytes: the class size for small blocks, the requested size
    /// for large ones.
    size: usize,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == HEADER_BYTES);

/// Errors surfaced by the pool's fallible internals.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Anonymous mapping failed; the allocation path reports null.
    #[error("anonymous mapping of {bytes} bytes failed (errno {errno})")]
    MapFailed { bytes: usize, errno: i32 },
    /// The request overflows when padded with header and page rounding.
    #[error("allocation of {0} bytes overflows when padded")]
    RequestOverflow(usize),
}

/// Lifecycle event kinds recorded by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEventKind {
    /// A thread bound itself to a heap slot.
    Lease,
    /// A thread surrendered its heap slot.
    Release,
    /// A central list was refilled from fresh chunk memory.
    Refill,
    /// Blocks were returned to a central list.
    Flush,
    /// A direct mapping was created.
    LargeAlloc,
    /// A direct mapping was unmapped.
    LargeFree,
}

/// One entry of the bounded lifecycle event ring.
#[derive(Debug, Clone)]
pub struct PoolEventRecord {
    /// Monotonic sequence number.
    pub seq: u64,
    /// What happened.
    pub kind: PoolEventKind,
    /// Heap slot involved (0 for large-path events).
    pub heap: usize,
    /// Blocks moved, where applicable.
    pub blocks: u32,
    /// Payload bytes moved, where applicable.
    pub bytes: usize,
}

struct EventLog {
    next_seq: u64,
    ring: VecDeque<PoolEventRecord>,
}

/// A leased heap identity. Surrender it with [`GlobalPool::release_heap`].
#[must_use = "a leased heap slot must be released back to the pool"]
pub struct HeapLease {
    index: usize,
}

impl HeapLease {
    /// Slot index this lease is bound to.
    pub fn heap_index(&self) -> usize {
        self.index
    }
}

struct HeapBins {
    free: [FreeList; NUM_SIZE_CLASSES],
}

// SAFETY: HeapBins holds raw pointers to blocks owned by the pool's chunk
// mappings, which live for the process lifetime. Access is serialized by the
// enclosing Mutex.
unsafe impl Send for HeapBins {}

struct Heap {
    /// Number of live caches currently bound to this slot.
    owners: AtomicU32,
    bins: Mutex<HeapBins>,
}

struct ChunkSource {
    cursor: *mut u8,
    remaining: usize,
    chunks_mapped: usize,
}

// SAFETY: the cursor points into process-lifetime anonymous mappings and is
// only advanced under the enclosing Mutex.
unsafe impl Send for ChunkSource {}

/// Snapshot of pool-level accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured heap slot count.
    pub heaps: usize,
    /// Payload bytes currently held outside the central lists.
    pub bytes_outstanding: usize,
    /// Blocks currently held outside the central lists.
    pub blocks_outstanding: usize,
    /// Heap leases granted so far.
    pub leases_granted: u64,
    /// Heap leases released so far.
    pub leases_released: u64,
    /// Number of distinct slots ever leased.
    pub heaps_ever_leased: u32,
    /// Whether any thread beyond the main thread has been created.
    pub any_thread_created: bool,
}

/// The shared multiprocessor heap pool.
pub struct GlobalPool {
    heaps: Box<[Heap]>,
    chunks: Mutex<ChunkSource>,
    any_thread_created: AtomicBool,
    bytes_outstanding: AtomicUsize,
    blocks_outstanding: AtomicUsize,
    leases_granted: AtomicU64,
    leases_released: AtomicU64,
    ever_leased: AtomicU64,
    events: Mutex<EventLog>,
}

static POOL: OnceLock<GlobalPool> = OnceLock::new();

impl GlobalPool {
    /// The process-wide pool, built on first use.
    pub fn instance() -> &'static GlobalPool {
        POOL.get_or_init(GlobalPool::new)
    }

    pub(crate) fn new() -> GlobalPool {
        let slots = config::heap_slots();
        let heaps = (0..slots)
            .map(|_| Heap {
                owners: AtomicU32::new(0),
                bins: Mutex::new(HeapBins {
                    free: [const { FreeList::new() }; NUM_SIZE_CLASSES],
                }),
            })
            .collect();
        GlobalPool {
            heaps,
            chunks: Mutex::new(ChunkSource {
                cursor: std::ptr::null_mut(),
                remaining: 0,
                chunks_mapped: 0,
            }),
            any_thread_created: AtomicBool::new(false),
            bytes_outstanding: AtomicUsize::new(0),
            blocks_outstanding: AtomicUsize::new(0),
            leases_granted: AtomicU64::new(0),
            leases_released: AtomicU64::new(0),
            ever_leased: AtomicU64::new(0),
            events: Mutex::new(EventLog {
                next_seq: 1,
                ring: VecDeque::new(),
            }),
        }
    }

    /// Configured heap slot count.
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Record that a thread beyond the main thread now exists.
    ///
    /// Set by the lifecycle interceptor before the first child thread is
    /// launched; until then the pool skips multi-threaded slot scanning.
    pub fn note_thread_created(&self) {
        self.any_thread_created.store(true, Ordering::Release);
    }

    /// Whether multi-threaded bookkeeping is required.
    pub fn is_multithreaded(&self) -> bool {
        self.any_thread_created.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Heap lease protocol
    // -----------------------------------------------------------------------

    /// Lease a heap slot for the calling thread's cache.
    ///
    /// Prefers an unowned slot with the lowest index so that a sequence of
    /// short-lived threads keeps reusing the same identity; when every slot
    /// is owned, the least-loaded slot is shared. Never fails: slots are
    /// shared, not exhausted.
    pub fn find_unused_heap(&self) -> HeapLease {
        let index = self.acquire_slot();
        self.ever_leased.fetch_or(1 << index, Ordering::Relaxed);
        self.leases_granted.fetch_add(1, Ordering::Relaxed);
        self.record_event(PoolEventKind::Lease, index, 0, 0);
        HeapLease { index }
    }

    fn acquire_slot(&self) -> usize {
        // Single-threaded processes always bind slot 0; scanning is deferred
        // until the interceptor reports a second thread.
        if !self.is_multithreaded() {
            self.heaps[0].owners.fetch_add(1, Ordering::AcqRel);
            return 0;
        }
        for (index, heap) in self.heaps.iter().enumerate() {
            if heap
                .owners
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return index;
            }
        }
        // Every slot is owned: share the least-loaded one.
        let mut best = 0;
        let mut best_owners = u32::MAX;
        for (index, heap) in self.heaps.iter().enumerate() {
            let owners = heap.owners.load(Ordering::Relaxed);
            if owners < best_owners {
                best = index;
                best_owners = owners;
            }
        }
        self.heaps[best].owners.fetch_add(1, Ordering::AcqRel);
        best
    }

    /// Return a leased slot so a future thread may reuse it.
    pub fn release_heap(&self, lease: HeapLease) {
        self.heaps[lease.index].owners.fetch_sub(1, Ordering::AcqRel);
        self.leases_released.fetch_add(1, Ordering::Relaxed);
        self.record_event(PoolEventKind::Release, lease.index, 0, 0);
    }

    // -----------------------------------------------------------------------
    // Batch transfer surface (used by LocalCache)
    // -----------------------------------------------------------------------

    /// Fetch up to `want` blocks of `class` from a heap's central list,
    /// carving fresh chunk memory when the list is empty.
    ///
    /// Returns `(count, head)`; `count` is zero only when memory is
    /// exhausted.
    pub(crate) fn fetch_batch(
        &self,
        heap: usize,
        class: usize,
        want: u32,
    ) -> (u32, *mut FreeBlock) {
        let (count, head) = {
            let mut bins = self.heaps[heap].bins.lock();
            bins.free[class].pop_batch(want)
        };
        let (count, head) = if count > 0 {
            (count, head)
        } else {
            self.carve_blocks(heap, class, want)
        };
        if count > 0 {
            let bytes = count as usize * size_class::class_size(class);
            self.bytes_outstanding.fetch_add(bytes, Ordering::Relaxed);
            self.blocks_outstanding
                .fetch_add(count as usize, Ordering::Relaxed);
        }
        (count, head)
    }

    /// Return a chain of `count` blocks of `class` to a heap's central list.
    ///
    /// # Safety
    ///
    /// `head` must be a chain of exactly `count` pool blocks of `class`,
    /// none of them reachable by the application.
    pub(crate) unsafe fn insert_batch(
        &self,
        heap: usize,
        class: usize,
        head: *mut FreeBlock,
        count: u32,
    ) {
        if count == 0 {
            return;
        }
        {
            let mut bins = self.heaps[heap].bins.lock();
            // SAFETY: per contract, head is a valid chain of count blocks.
            unsafe { bins.free[class].push_batch(head, count) };
        }
        let bytes = count as usize * size_class::class_size(class);
        self.bytes_outstanding.fetch_sub(bytes, Ordering::Relaxed);
        self.blocks_outstanding
            .fetch_sub(count as usize, Ordering::Relaxed);
        self.record_event(PoolEventKind::Flush, heap, count, bytes);
    }

    /// Carve `want` fresh blocks of `class` out of chunk memory.
    fn carve_blocks(&self, heap: usize, class: usize, want: u32) -> (u32, *mut FreeBlock) {
        let payload = size_class::class_size(class);
        let block_bytes = HEADER_BYTES + payload;
        let mut head: *mut FreeBlock = std::ptr::null_mut();
        let mut made = 0;

        let mut chunks = self.chunks.lock();
        while made < want {
            if chunks.remaining < block_bytes {
                match map_anonymous(CHUNK_BYTES) {
                    Ok(base) => {
                        chunks.cursor = base;
                        chunks.remaining = CHUNK_BYTES;
                        chunks.chunks_mapped += 1;
                    }
                    Err(_) => break,
                }
            }
            let raw = chunks.cursor;
            // SAFETY: raw..raw+block_bytes lies inside the fresh mapping.
            unsafe {
                raw.cast::<BlockHeader>().write(BlockHeader {
                    class: class as u32,
                    magic: BLOCK_MAGIC,
                    size: payload,
                });
                let block = raw.add(HEADER_BYTES).cast::<FreeBlock>();
                (*block).next = head;
                head = block;
            }
            chunks.cursor = unsafe { chunks.cursor.add(block_bytes) };
            chunks.remaining -= block_bytes;
            made += 1;
        }
        drop(chunks);

        if made > 0 {
            self.record_event(PoolEventKind::Refill, heap, made, made as usize * payload);
        }
        (made, head)
    }

    // -----------------------------------------------------------------------
    // Direct allocation surface
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes directly from the pool.
    ///
    /// Small requests are served from heap slot 0's central lists; requests
    /// above the largest size class are mapped directly. Returns null on
    /// exhaustion.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        match size_class::class_for_size(size) {
            Some(class) => {
                let (count, head) = self.fetch_batch(0, class, 1);
                if count == 0 {
                    return std::ptr::null_mut();
                }
                head.cast()
            }
            None => match self.malloc_large(size) {
                Ok(ptr) => ptr,
                Err(_) => std::ptr::null_mut(),
            },
        }
    }

    fn malloc_large(&self, size: usize) -> Result<*mut u8, PoolError> {
        let total = large_mapping_bytes(size)?;
        let base = map_anonymous(total)?;
        // SAFETY: base is a fresh mapping of at least HEADER_BYTES + size.
        let payload = unsafe {
            base.cast::<BlockHeader>().write(BlockHeader {
                class: LARGE_CLASS,
                magic: BLOCK_MAGIC,
                size,
            });
            base.add(HEADER_BYTES)
        };
        self.bytes_outstanding.fetch_add(size, Ordering::Relaxed);
        self.blocks_outstanding.fetch_add(1, Ordering::Relaxed);
        self.record_event(PoolEventKind::LargeAlloc, 0, 1, size);
        Ok(payload)
    }

    /// Return a block obtained from any pool surface.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this pool (directly or through a
    /// local cache) and must not be used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: per contract, a pool header precedes ptr.
        let header = unsafe { &*header_of(ptr) };
        debug_assert_eq!(header.magic, BLOCK_MAGIC, "freeing a non-pool pointer");
        if header.class == LARGE_CLASS {
            let size = header.size;
            // Reconstruct the mapping extent the same way malloc_large did.
            // A header that fails this recomputation is corrupt; leak rather
            // than unmap a guessed range.
            let Ok(total) = large_mapping_bytes(size) else {
                debug_assert!(false, "corrupt large-block header");
                return;
            };
            // SAFETY: the mapping began HEADER_BYTES before the payload.
            unsafe {
                let base = ptr.sub(HEADER_BYTES);
                libc::munmap(base.cast(), total);
            }
            self.bytes_outstanding.fetch_sub(size, Ordering::Relaxed);
            self.blocks_outstanding.fetch_sub(1, Ordering::Relaxed);
            self.record_event(PoolEventKind::LargeFree, 0, 1, size);
        } else {
            // SAFETY: small pool blocks hold a link word in their payload.
            unsafe { self.insert_batch(0, header.class as usize, ptr.cast(), 1) };
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Current accounting snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            heaps: self.heaps.len(),
            bytes_outstanding: self.bytes_outstanding.load(Ordering::Relaxed),
            blocks_outstanding: self.blocks_outstanding.load(Ordering::Relaxed),
            leases_granted: self.leases_granted.load(Ordering::Relaxed),
            leases_released: self.leases_released.load(Ordering::Relaxed),
            heaps_ever_leased: self.ever_leased.load(Ordering::Relaxed).count_ones(),
            any_thread_created: self.is_multithreaded(),
        }
    }

    /// Most recent lifecycle events, oldest first.
    pub fn recent_events(&self) -> Vec<PoolEventRecord> {
        self.events.lock().ring.iter().cloned().collect()
    }

    fn record_event(&self, kind: PoolEventKind, heap: usize, blocks: u32, bytes: usize) {
        let mut log = self.events.lock();
        let seq = log.next_seq;
        log.next_seq += 1;
        if log.ring.len() == EVENT_CAPACITY {
            log.ring.pop_front();
        }
        log.ring.push_back(PoolEventRecord {
            seq,
            kind,
            heap,
            blocks,
            bytes,
        });
    }
}

// ---------------------------------------------------------------------------
// Header helpers (shared with LocalCache and the interposed C surface)
// ---------------------------------------------------------------------------

#[inline]
fn header_of(payload: *mut u8) -> *mut BlockHeader {
    // Callers guarantee a header precedes the payload.
    payload.wrapping_sub(HEADER_BYTES).cast()
}

/// Size class of a pool block, or [`u32::MAX`] for large blocks.
///
/// # Safety
///
/// `ptr` must be a payload pointer produced by this pool.
#[inline]
pub(crate) unsafe fn class_of_block(ptr: *mut u8) -> u32 {
    // SAFETY: per contract, a header precedes ptr.
    unsafe { (*header_of(ptr)).class }
}

/// Payload size recorded in a pool block's header.
///
/// # Safety
///
/// `ptr` must be a payload pointer produced by this pool.
#[inline]
pub unsafe fn block_payload_size(ptr: *mut u8) -> usize {
    // SAFETY: per contract, a header precedes ptr.
    unsafe { (*header_of(ptr)).size }
}

/// Whether `ptr` carries this pool's header fingerprint.
///
/// Used by the interposed C allocation surface to route frees it did not
/// observe being allocated. The caller must ensure the 16 bytes before `ptr`
/// are readable; for heap pointers from any mainstream allocator they are.
///
/// # Safety
///
/// `ptr` must be non-null and the bytes immediately before it readable.
#[inline]
pub unsafe fn is_pool_block(ptr: *mut u8) -> bool {
    // SAFETY: per contract, the preceding bytes are readable.
    unsafe { (*header_of(ptr)).magic == BLOCK_MAGIC }
}

pub(crate) const LARGE_BLOCK_CLASS: u32 = LARGE_CLASS;

// ---------------------------------------------------------------------------
// Mapping primitives
// ---------------------------------------------------------------------------

fn large_mapping_bytes(size: usize) -> Result<usize, PoolError> {
    size.checked_add(HEADER_BYTES)
        .and_then(|n| n.checked_add(PAGE_BYTES - 1))
        .map(|n| n & !(PAGE_BYTES - 1))
        .ok_or(PoolError::RequestOverflow(size))
}

fn map_anonymous(bytes: usize) -> Result<*mut u8, PoolError> {
    // SAFETY: anonymous private mapping with no fd; parameters are valid.
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(PoolError::MapFailed { bytes, errno });
    }
    Ok(raw.cast())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
