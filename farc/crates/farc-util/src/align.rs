//! Alignment Utilities
//!
//! Helper functions for power-of-two alignment. All functions assume
//! `alignment` is a non-zero power of two; the checked variants report
//! overflow instead of wrapping.

/// Align value up to boundary
///
/// # Examples
/// ```
/// use farc_util::align::align_up;
/// assert_eq!(align_up(100, 8), 104);
/// assert_eq!(align_up(64, 8), 64);
/// ```
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Align value up to boundary, returning `None` on overflow
#[inline]
pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    let mask = alignment.checked_sub(1)?;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Align a 64-bit address up to boundary
#[inline]
pub const fn align_up_u64(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Align value down to boundary
#[inline]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// Check if value is aligned
#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Padding needed to reach the next boundary
#[inline]
pub const fn padding(value: usize, alignment: usize) -> usize {
    align_up(value, alignment) - value
}
