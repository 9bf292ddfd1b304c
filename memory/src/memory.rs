use {crate::usage::MemoryType, relevant::Relevant};

/// Memory object wrapper.
/// Contains size and type of the memory.
///
/// Must be returned to the device explicitly,
/// dropping it leaks the native allocation.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Memory<M> {
    #[derivative(Debug = "ignore")]
    raw: M,
    size: u64,
    memory_type: MemoryType,
    relevant: Relevant,
}

impl<M> Memory<M> {
    /// Get memory type.
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Get memory size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get raw memory.
    pub fn raw(&self) -> &M {
        &self.raw
    }

    /// Create memory from raw object.
    ///
    /// # Safety
    ///
    /// `raw` must be a live allocation of at least `size` bytes of `memory_type`.
    pub unsafe fn from_raw(raw: M, size: u64, memory_type: MemoryType) -> Self {
        Memory {
            raw,
            size,
            memory_type,
            relevant: Relevant,
        }
    }

    /// Check if this memory is host-visible and can be mapped.
    pub fn host_visible(&self) -> bool {
        self.memory_type.host_visible()
    }

    /// Take the raw object out, to hand it back to the device.
    pub(crate) fn into_raw(self) -> M {
        self.relevant.dispose();
        self.raw
    }
}
