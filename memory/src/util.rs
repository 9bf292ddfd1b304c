use crate::size_class;

/// Round `value` up to a multiple of `align`, which must be a power of two.
pub(crate) fn aligned(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    if value == 0 {
        0
    } else {
        1u64 + ((value - 1u64) | (align - 1u64))
    }
}

/// Round `value` up to a multiple of `align`, failing on overflow.
pub(crate) fn checked_aligned(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|value| value & !(align - 1))
}

/// Number of `unit`-sized blocks needed to hold `size` bytes, if it fits in `u32`.
pub(crate) fn units(size: u64, unit: u64) -> Option<u32> {
    let count = size.checked_add(unit - 1)? / unit;
    if count > u64::from(u32::max_value()) {
        None
    } else {
        Some(count as u32)
    }
}

/// Number of `unit`-sized blocks for a page of at least `size` bytes.
/// Rounded up to a whole allocator bin so a fresh page can serve `size` in one piece.
pub(crate) fn page_units(size: u64, unit: u64) -> Option<u32> {
    units(size, unit).and_then(size_class::fitting_size)
}
