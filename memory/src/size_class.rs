//! Logarithmic size classes with linear subdivisions ("small floats").
//!
//! A class index packs an exponent and a `MANTISSA_BITS`-wide mantissa.
//! Sizes below `MANTISSA_VALUE` are denormalized and map to themselves.

use std::convert::TryFrom;

/// Number of mantissa bits per exponent.
pub const MANTISSA_BITS: u32 = 3;

/// Number of linear subdivisions per exponent.
pub const MANTISSA_VALUE: u32 = 1 << MANTISSA_BITS;

/// Mask selecting the mantissa of a class index.
pub const MANTISSA_MASK: u32 = MANTISSA_VALUE - 1;

/// Class of the smallest bin guaranteed to hold `size`.
///
/// `to_size(round_up(size)) >= size`.
pub fn round_up(size: u32) -> u32 {
    let (exp, mantissa) = if size < MANTISSA_VALUE {
        (0, size)
    } else {
        let highest_set_bit = 31 - size.leading_zeros();
        let mantissa_start_bit = highest_set_bit - MANTISSA_BITS;
        let exp = mantissa_start_bit + 1;
        let mut mantissa = (size >> mantissa_start_bit) & MANTISSA_MASK;

        let low_bits_mask = (1 << mantissa_start_bit) - 1;
        if size & low_bits_mask != 0 {
            mantissa += 1;
        }

        (exp, mantissa)
    };

    // Mantissa overflow carries into the exponent.
    (exp << MANTISSA_BITS) + mantissa
}

/// Class of the largest bin fully covered by `size`.
///
/// `to_size(round_down(size)) <= size`.
pub fn round_down(size: u32) -> u32 {
    let (exp, mantissa) = if size < MANTISSA_VALUE {
        (0, size)
    } else {
        let highest_set_bit = 31 - size.leading_zeros();
        let mantissa_start_bit = highest_set_bit - MANTISSA_BITS;
        let exp = mantissa_start_bit + 1;
        (exp, (size >> mantissa_start_bit) & MANTISSA_MASK)
    };

    (exp << MANTISSA_BITS) | mantissa
}

/// Smallest size represented by class `class`.
pub fn to_size(class: u32) -> u32 {
    let exponent = class >> MANTISSA_BITS;
    let mantissa = class & MANTISSA_MASK;
    if exponent == 0 {
        mantissa
    } else {
        (mantissa | MANTISSA_VALUE) << (exponent - 1)
    }
}

/// Smallest class size holding `size`, if it fits in `u32`.
///
/// A region of exactly this size is filed in the bin `round_up(size)`
/// searches first, so it can always serve a request for `size`.
pub fn fitting_size(size: u32) -> Option<u32> {
    let class = round_up(size);
    let exponent = class >> MANTISSA_BITS;
    let mantissa = u64::from(class & MANTISSA_MASK);
    let size = if exponent == 0 {
        mantissa
    } else {
        (mantissa | u64::from(MANTISSA_VALUE)) << (exponent - 1)
    };
    u32::try_from(size).ok()
}
