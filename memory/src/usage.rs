//! Memory types a heap can be created for.

/// Kind of memory backing a heap's pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryType {
    /// Full speed GPU access, no host access.
    /// Optimal for render targets and persistent resources.
    DeviceLocal,

    /// CPU to GPU data flow.
    /// Host-visible and coherent, written by the host and read by the device.
    Upload,

    /// GPU to CPU data flow.
    /// Host-visible, coherent and cached, written by the device and read by the host.
    ReadBack,
}

impl MemoryType {
    /// Memory of this type can be mapped.
    pub fn host_visible(self) -> bool {
        match self {
            MemoryType::DeviceLocal => false,
            MemoryType::Upload | MemoryType::ReadBack => true,
        }
    }

    /// Host reads from memory of this type are cached.
    pub fn host_cached(self) -> bool {
        self == MemoryType::ReadBack
    }
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::DeviceLocal
    }
}
