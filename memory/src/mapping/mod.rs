mod range;

use {
    crate::error::MappingError,
    std::{marker::PhantomData, mem::size_of_val, ops::Range, ptr::NonNull},
};

use self::range::{mapped_slice, mapped_sub_range};

/// Represents range of the memory mapped to the host.
/// Provides methods for safer host access to the memory.
///
/// Staging memory is host-coherent, so no flushes or invalidations are needed.
#[derive(Debug)]
pub struct MappedRange<'a> {
    /// Pointer to range mapped memory.
    ptr: NonNull<u8>,

    /// Range of mapped memory.
    range: Range<u64>,

    marker: PhantomData<&'a mut [u8]>,
}

impl<'a> MappedRange<'a> {
    /// Construct mapped range from raw mapping
    ///
    /// # Safety
    ///
    /// `range` must be mapped to host memory region pointed by `ptr`
    /// for the whole lifetime `'a`.
    pub unsafe fn from_raw(ptr: NonNull<u8>, range: Range<u64>) -> Self {
        MappedRange {
            ptr,
            range,
            marker: PhantomData,
        }
    }

    /// Get pointer to beginning of memory region.
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Get mapped range.
    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }

    /// Size of the mapped range.
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// Mapped range is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch readable slice of sub-range to be read.
    /// `range` is relative to the mapped range.
    /// `range.end - range.start` must be multiple of `size_of::<T>()`.
    /// `mapping offset + range.start` must be multiple of `align_of::<T>()`.
    ///
    /// # Safety
    ///
    /// * Caller must ensure that device won't write to the memory region until the borrowing ends.
    /// * `T` Must be plain-old-data type with memory layout compatible with data written by the device.
    pub unsafe fn read<'b, T>(&'b mut self, range: Range<u64>) -> Result<&'b [T], MappingError>
    where
        'a: 'b,
        T: Copy,
    {
        let (ptr, range) = self.sub_range(range)?;
        Ok(mapped_slice::<T>(ptr, range))
    }

    /// Copy `data` into the mapping at byte `offset`, relative to the mapped range.
    /// No alignment is required.
    ///
    /// # Safety
    ///
    /// * Caller must ensure that device won't write to or read from the memory region.
    pub unsafe fn write<T>(&mut self, offset: u64, data: &[T]) -> Result<(), MappingError>
    where
        T: Copy,
    {
        let size = size_of_val(data) as u64;
        let end = offset.checked_add(size).ok_or(MappingError::OutOfBounds)?;
        let (ptr, _) = self.sub_range(offset..end)?;
        std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, ptr.as_ptr(), size as usize);
        Ok(())
    }

    fn sub_range(&self, range: Range<u64>) -> Result<(NonNull<u8>, Range<u64>), MappingError> {
        let (ptr, _) = mapped_sub_range(self.ptr, 0..self.len(), range.clone())
            .ok_or(MappingError::OutOfBounds)?;
        Ok((ptr, range))
    }
}
