//! Size class bins for small allocations.
//!
//! Small requests are rounded up to a fixed table of class sizes; anything
//! above [`MAX_SMALL_SIZE`] takes the large (direct-map) path. Class sizes
//! are all multiples of 16 so block payloads stay 16-byte aligned.

/// Minimum allocation size (bytes).
pub const MIN_SIZE: usize = 16;

/// Maximum size served from size-class bins. Above this, the pool maps the
/// request directly.
pub const MAX_SMALL_SIZE: usize = 8192;

/// Number of size class bins.
pub const NUM_SIZE_CLASSES: usize = 16;

/// Size class table: 16-byte steps up to 128, then geometric.
const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 96, 128, // fine-grained small
    192, 256, 384, 512, 768, 1024, // mid range
    2048, 3072, 4096, 8192, // large small classes
];

/// Computes the bin index for a given allocation size.
///
/// Rounds `size` up to the nearest class boundary. Returns `None` for sizes
/// above [`MAX_SMALL_SIZE`] to signal the large-allocation path. A zero-size
/// request maps to the smallest class.
#[inline]
pub fn class_for_size(size: usize) -> Option<usize> {
    let size = size.max(MIN_SIZE);
    if size > MAX_SMALL_SIZE {
        return None;
    }
    // Linear scan is fine for 16 entries.
    SIZE_TABLE.iter().position(|&class_size| size <= class_size)
}

/// Returns the allocation size for a bin index.
///
/// # Panics
///
/// Panics on an out-of-range index; callers only hold indices produced by
/// [`class_for_size`].
#[inline]
pub fn class_size(index: usize) -> usize {
    SIZE_TABLE[index]
}
