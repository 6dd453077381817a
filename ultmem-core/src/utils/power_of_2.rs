//! An integer guaranteed to be a PowerOf2.

use core::{mem, num, ops};

/// PowerOf2
///
/// An integral guaranteed to be non-zero and a power of 2, used for cache-line rounding and bucket masks.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PowerOf2(num::NonZeroUsize);

impl PowerOf2 {
    /// Creates a new instance of PowerOf2, or nothing if the value is not a power of 2.
    pub const fn new(value: usize) -> Option<PowerOf2> {
        if value.is_power_of_two() {
            //  Safety:
            //  -   Value is a power of 2, as per the if check.
            Some(unsafe { PowerOf2::new_unchecked(value) })
        } else {
            None
        }
    }

    /// Creates a new instance of PowerOf2.
    ///
    /// #   Safety
    ///
    /// Assumes that the value is a power of 2.
    pub const unsafe fn new_unchecked(value: usize) -> PowerOf2 {
        //  Safety:
        //  -   A power of 2 cannot be 0.
        PowerOf2(num::NonZeroUsize::new_unchecked(value))
    }

    /// Creates a PowerOf2 matching the alignment of a type.
    pub const fn align_of<T>() -> PowerOf2 {
        //  Safety:
        //  -   Alignment is always a power of 2, and never 0.
        unsafe { PowerOf2::new_unchecked(mem::align_of::<T>()) }
    }

    /// Returns the inner value.
    pub const fn value(&self) -> usize { self.0.get() }

    /// Rounds the value up to the nearest higher multiple of `self`.
    pub const fn round_up(&self, n: usize) -> usize {
        let mask = self.mask();

        (n + mask) & !mask
    }

    /// Rounds the value up to the nearest higher multiple of `self`, or nothing if it overflows.
    pub const fn checked_round_up(&self, n: usize) -> Option<usize> {
        let mask = self.mask();

        match n.checked_add(mask) {
            Some(n) => Some(n & !mask),
            None => None,
        }
    }

    /// Returns whether `n` is a multiple of `self`.
    pub const fn divides(&self, n: usize) -> bool { n & self.mask() == 0 }

    const fn mask(&self) -> usize { self.value() - 1 }
}

impl ops::Rem<PowerOf2> for usize {
    type Output = usize;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn rem(self, rhs: PowerOf2) -> usize { self & rhs.mask() }
}

// mod tests
