//! Device memory allocators for a cross-backend rendering hardware interface.
//!
//! Three layers:
//! * `OffsetAllocator` hands out offsets inside a flat range in constant time.
//! * `Heap` slices tiered device memory pages with it, defers frees until the
//!   GPU is done and caches empty pages.
//! * `StagingHeap` does the same for host-visible upload and readback memory,
//!   with a thread-aware page policy and ref-counted handles.

#![warn(missing_debug_implementations, rust_2018_idioms)]
#![deny(unused_must_use)]

mod allocator;
mod device;
mod error;
mod heap;
mod mapping;
mod memory;
pub mod size_class;
mod staging;
mod usage;
mod util;
mod utilization;

#[cfg(test)]
mod test;

/// Identifier of a page, unique within its heap and never reused.
pub type PageId = u32;

pub use crate::{
    allocator::*,
    device::{Device, Timeline},
    error::*,
    heap::{
        default_page_tiers, Heap, HeapAlloc, HeapAllocDesc, HeapCachingConfig, HeapDesc,
        PageState, PageTier,
    },
    mapping::MappedRange,
    memory::Memory,
    staging::{Handle, MetaData, StagingAllocation, StagingHeap, StagingHeapDesc},
    usage::MemoryType,
    utilization::HeapReport,
};
