//! Region allocators used to slice pages.

mod offset;

pub use self::offset::{
    Allocation, OffsetAllocator, StorageRegion, StorageReport, StorageReportFull,
    DEFAULT_MAX_ALLOCS,
};
