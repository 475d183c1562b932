//! General utilities shared by the engine internals.

use crate::MAX_BLOCK_SIZE;

static CONST_ZEROS: [f32; MAX_BLOCK_SIZE] = [0.0; MAX_BLOCK_SIZE];

/// A process-wide block of zeros, at least as long as any processing block.
///
/// Unconnected inputs read from this block, and it is what the const value
/// cache hands out for any value within epsilon of zero.
#[inline]
pub fn const_zeros(n_values: usize) -> &'static [f32] {
    &CONST_ZEROS[..n_values.min(MAX_BLOCK_SIZE)]
}

/// Reuse the allocation of a `Vec` for a `Vec` of a different type with
/// the same size and alignment.
///
/// This trick allows us to build a `Vec` of borrowed slices on every
/// process cycle without allocating any memory.
pub fn recycle_vec<T, U>(mut v: Vec<T>) -> Vec<U> {
    debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<U>());
    debug_assert_eq!(std::mem::align_of::<T>(), std::mem::align_of::<U>());

    v.clear();
    v.into_iter().map(|_| unreachable!()).collect()
}

/// Round up to the next power of two, with a lower bound of `min`.
#[inline]
pub fn upper_power2(number: usize, min: usize) -> usize {
    number.max(min).next_power_of_two()
}

/// Fill a block with a single value.
#[inline]
pub fn block_fill(block: &mut [f32], value: f32) {
    block.iter_mut().for_each(|s| *s = value);
}
