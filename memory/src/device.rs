use {
    crate::{
        error::{MappingError, OutOfMemoryError},
        usage::MemoryType,
    },
    std::{ops::Range, ptr::NonNull},
};

/// Trait for native memory allocation and mapping.
///
/// Implemented by each backend. Heaps call it only to create,
/// release and map whole pages.
pub trait Device {
    /// Native memory object.
    type Memory;

    /// Allocate memory object.
    ///
    /// # Parameters
    /// `memory_type` - kind of memory to allocate.
    /// `size`        - size of the memory object to allocate.
    ///
    /// # Safety
    ///
    /// Returned memory must be released with `free` of the same device.
    unsafe fn allocate(
        &self,
        memory_type: MemoryType,
        size: u64,
    ) -> Result<Self::Memory, OutOfMemoryError>;

    /// Free memory object.
    ///
    /// # Safety
    ///
    /// Memory must be allocated by this device and not be in use by the GPU.
    /// Mapping, if any, is invalidated.
    unsafe fn free(&self, memory: Self::Memory);

    /// Map memory range.
    /// Only one range for the given memory object can be mapped.
    ///
    /// # Safety
    ///
    /// Memory must be allocated by this device and not be mapped already.
    unsafe fn map(
        &self,
        memory: &Self::Memory,
        range: Range<u64>,
    ) -> Result<NonNull<u8>, MappingError>;

    /// Unmap memory.
    ///
    /// # Safety
    ///
    /// Memory must be mapped. Pointers obtained from `map` become dangling.
    unsafe fn unmap(&self, memory: &Self::Memory);

    /// Device address of the first byte of memory object.
    /// `None` if the backend doesn't expose device addresses.
    fn device_address(&self, _memory: &Self::Memory) -> Option<u64> {
        None
    }
}

/// Monotonic GPU completion counter.
///
/// Backed by a timeline semaphore, a fence pool or a stream event
/// depending on the backend.
pub trait Timeline {
    /// Value that will be signaled by the most recently submitted work.
    fn current_value(&self) -> u64;

    /// Highest value the GPU has signaled.
    fn completed_value(&self) -> u64;

    /// Check whether work up to `value` has finished.
    fn is_complete(&self, value: u64) -> bool {
        self.completed_value() >= value
    }

    /// Device executes all work in submission order on one queue,
    /// so memory released on the host can be reused by later submissions
    /// without waiting.
    fn in_order(&self) -> bool {
        false
    }
}

impl<T> Timeline for &T
where
    T: Timeline + ?Sized,
{
    fn current_value(&self) -> u64 {
        (**self).current_value()
    }

    fn completed_value(&self) -> u64 {
        (**self).completed_value()
    }

    fn is_complete(&self, value: u64) -> bool {
        (**self).is_complete(value)
    }

    fn in_order(&self) -> bool {
        (**self).in_order()
    }
}

impl<T> Timeline for std::sync::Arc<T>
where
    T: Timeline + ?Sized,
{
    fn current_value(&self) -> u64 {
        (**self).current_value()
    }

    fn completed_value(&self) -> u64 {
        (**self).completed_value()
    }

    fn is_complete(&self, value: u64) -> bool {
        (**self).is_complete(value)
    }

    fn in_order(&self) -> bool {
        (**self).in_order()
    }
}

impl<D> Device for std::sync::Arc<D>
where
    D: Device + ?Sized,
{
    type Memory = D::Memory;

    unsafe fn allocate(
        &self,
        memory_type: MemoryType,
        size: u64,
    ) -> Result<Self::Memory, OutOfMemoryError> {
        (**self).allocate(memory_type, size)
    }

    unsafe fn free(&self, memory: Self::Memory) {
        (**self).free(memory)
    }

    unsafe fn map(
        &self,
        memory: &Self::Memory,
        range: Range<u64>,
    ) -> Result<NonNull<u8>, MappingError> {
        (**self).map(memory, range)
    }

    unsafe fn unmap(&self, memory: &Self::Memory) {
        (**self).unmap(memory)
    }

    fn device_address(&self, memory: &Self::Memory) -> Option<u64> {
        (**self).device_address(memory)
    }
}
