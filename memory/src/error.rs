use crate::PageId;

/// Typical memory error - out of available memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutOfMemoryError {
    /// Host memory exhausted.
    OutOfHostMemory,

    /// Device memory exhausted.
    OutOfDeviceMemory,
}

impl std::fmt::Display for OutOfMemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutOfMemoryError::OutOfHostMemory => write!(f, "Out of host memory"),
            OutOfMemoryError::OutOfDeviceMemory => write!(f, "Out of device memory"),
        }
    }
}

impl std::error::Error for OutOfMemoryError {}

/// Possible cause of mapping failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingError {
    /// Attempt to map memory that is not host-visible.
    HostInvisible,

    /// Attempt to map memory out of bounds.
    OutOfBounds,

    /// Unable to allocate an appropriately sized contiguous virtual address range.
    MappingFailed,

    /// Out of either host or device memory.
    OutOfMemory(OutOfMemoryError),
}

impl std::fmt::Display for MappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingError::HostInvisible => {
                write!(f, "Memory is not host-visible and can't be mapped")
            }
            MappingError::OutOfBounds => write!(f, "Mapping range is out of bound"),
            MappingError::MappingFailed => write!(f, "Virtual memory allocation failed"),
            MappingError::OutOfMemory(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for MappingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MappingError::OutOfMemory(error) => Some(error),
            _ => None,
        }
    }
}

impl From<OutOfMemoryError> for MappingError {
    fn from(error: OutOfMemoryError) -> Self {
        MappingError::OutOfMemory(error)
    }
}

/// Possible errors returned by `Heap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// Device refused to back a new page.
    OutOfMemory(OutOfMemoryError),

    /// Alignment is zero or not a power of two.
    InvalidAlignment(u64),

    /// Request can't be described in page units.
    TooLarge(u64),

    /// Allocation refers to a page this heap doesn't own.
    UnknownPage(PageId),
}

impl std::fmt::Display for HeapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeapError::OutOfMemory(error) => write!(f, "{}", error),
            HeapError::InvalidAlignment(align) => {
                write!(f, "Alignment {} is not a power of two", align)
            }
            HeapError::TooLarge(size) => write!(f, "Allocation of {} bytes is too large", size),
            HeapError::UnknownPage(id) => write!(f, "Page {} is not owned by this heap", id),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::OutOfMemory(error) => Some(error),
            _ => None,
        }
    }
}

impl From<OutOfMemoryError> for HeapError {
    fn from(error: OutOfMemoryError) -> Self {
        HeapError::OutOfMemory(error)
    }
}

/// Possible errors returned by `StagingHeap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingError {
    /// Device refused to back a new page.
    OutOfMemory(OutOfMemoryError),

    /// Page memory couldn't be mapped.
    Mapping(MappingError),

    /// Request can't be described in page units.
    TooLarge(u64),

    /// Allocation refers to a page this heap doesn't own.
    UnknownPage(PageId),
}

impl std::fmt::Display for StagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingError::OutOfMemory(error) => write!(f, "{}", error),
            StagingError::Mapping(error) => write!(f, "{}", error),
            StagingError::TooLarge(size) => {
                write!(f, "Staging allocation of {} bytes is too large", size)
            }
            StagingError::UnknownPage(id) => write!(f, "Staging page {} doesn't exist", id),
        }
    }
}

impl std::error::Error for StagingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StagingError::OutOfMemory(error) => Some(error),
            StagingError::Mapping(error) => Some(error),
            _ => None,
        }
    }
}

impl From<OutOfMemoryError> for StagingError {
    fn from(error: OutOfMemoryError) -> Self {
        StagingError::OutOfMemory(error)
    }
}

impl From<MappingError> for StagingError {
    fn from(error: MappingError) -> Self {
        match error {
            MappingError::OutOfMemory(error) => StagingError::OutOfMemory(error),
            error => StagingError::Mapping(error),
        }
    }
}

/// Broken bookkeeping found by a consistency walk.
///
/// Only produced after a double free or memory corruption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsistencyError {
    /// Bitmask disagrees with the bin contents.
    BinMask { bin: usize },

    /// Free list of the bin is malformed.
    FreeList { bin: usize },

    /// Free regions don't add up to the recorded free space.
    FreeStorage { counted: u64, recorded: u64 },

    /// Neighbor chain skips or overlaps a range.
    Gap { offset: u64, expected: u64 },

    /// Two free neighbors were left unmerged.
    Uncoalesced { offset: u64 },

    /// Neighbor chain doesn't span the whole range.
    Coverage { covered: u64, size: u64 },

    /// Nodes exist outside the neighbor chain.
    Unreachable { count: usize },

    /// Usage counters disagree with live allocations.
    Usage { page: PageId, counted: u64, recorded: u64 },
}

impl std::fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyError::BinMask { bin } => write!(f, "Bin {} mask mismatch", bin),
            ConsistencyError::FreeList { bin } => write!(f, "Bin {} free list is corrupted", bin),
            ConsistencyError::FreeStorage { counted, recorded } => write!(
                f,
                "Free regions sum to {} but {} recorded",
                counted, recorded
            ),
            ConsistencyError::Gap { offset, expected } => write!(
                f,
                "Region at {} found where {} was expected",
                offset, expected
            ),
            ConsistencyError::Uncoalesced { offset } => {
                write!(f, "Free region at {} wasn't merged with its neighbor", offset)
            }
            ConsistencyError::Coverage { covered, size } => {
                write!(f, "Regions cover {} of {}", covered, size)
            }
            ConsistencyError::Unreachable { count } => {
                write!(f, "{} nodes are unreachable", count)
            }
            ConsistencyError::Usage {
                page,
                counted,
                recorded,
            } => write!(
                f,
                "Page {} has {} bytes allocated but {} recorded",
                page, counted, recorded
            ),
        }
    }
}

impl std::error::Error for ConsistencyError {}
