//! This file contains the size arithmetic shared by both pools.
//! These are functions that don't particularly belong to any concrete pool.


/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This is used to round VMM requests up to [`crate::vmm::VMM_ALIGNMENT`] so that
/// every handed out address is aligned for all data types a kernel may read.
/// Returns `None` if the aligned size doesn't fit in a `usize`.
pub fn align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    debug_assert!(aligment.is_power_of_two());
    Some(to_be_aligned.checked_add(aligment - 1)? & !(aligment - 1))
}

/// Rounds `size` up to the next multiple of `multiple`.
///
/// Unlike [`align`] the multiple doesn't need to be a power of two. Device
/// granularities usually are, but nothing in the native platform promises it.
/// Returns `None` on overflow.
pub fn round_up(size: usize, multiple: usize) -> Option<usize> {
    size.div_ceil(multiple).checked_mul(multiple)
}

/// Formats a byte count as MiB for log lines.
#[inline]
pub(crate) fn mib(bytes: usize) -> usize {
    bytes / 1024 / 1024
}
