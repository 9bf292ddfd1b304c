use std::{
    mem::{align_of, size_of},
    ops::Range,
    ptr::NonNull,
    slice::from_raw_parts,
};

/// Get pointer to `fitting` inside a mapping of `range`.
/// Both ranges are in the same space.
pub(crate) fn mapped_fitting_range(
    ptr: NonNull<u8>,
    range: Range<u64>,
    fitting: Range<u64>,
) -> Option<NonNull<u8>> {
    assert!(
        range.start <= range.end,
        "Memory mapping region must have valid size"
    );

    if fitting.start > fitting.end || fitting.start < range.start || fitting.end > range.end {
        None
    } else {
        Some(unsafe {
            // Mapping never wraps the address space, so neither does a sub-range.
            NonNull::new_unchecked(ptr.as_ptr().add((fitting.start - range.start) as usize))
        })
    }
}

/// Get sub-range of memory mapping.
/// `sub` is relative to the start of `range`.
pub(crate) fn mapped_sub_range(
    ptr: NonNull<u8>,
    range: Range<u64>,
    sub: Range<u64>,
) -> Option<(NonNull<u8>, Range<u64>)> {
    let fitting = sub.start.checked_add(range.start)?..sub.end.checked_add(range.start)?;
    let ptr = mapped_fitting_range(ptr, range, fitting.clone())?;
    Some((ptr, fitting))
}

/// # Safety
///
/// User must ensure that:
/// * returned slice doesn't outlive mapping.
/// * nothing writes to the range while the slice is alive.
pub(crate) unsafe fn mapped_slice<'a, T>(ptr: NonNull<u8>, range: Range<u64>) -> &'a [T] {
    let size = (range.end - range.start) as usize;
    assert_eq!(
        size % size_of::<T>(),
        0,
        "Range length must be multiple of element size"
    );
    let offset = ptr.as_ptr() as usize;
    assert_eq!(
        offset % align_of::<T>(),
        0,
        "Range offset must be multiple of element alignment"
    );
    from_raw_parts(ptr.as_ptr() as *const T, size / size_of::<T>())
}
