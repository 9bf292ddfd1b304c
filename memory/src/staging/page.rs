use {
    crate::{allocator::OffsetAllocator, memory::Memory, PageId},
    parking_lot::Mutex,
    std::{ptr::NonNull, thread::ThreadId},
};

/// Host pointer to the start of a mapped page.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Mapping(pub(crate) NonNull<u8>);

// Pointer is only dereferenced by holders of allocations inside the page.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[derive(Debug)]
pub(crate) struct PageInner {
    pub(crate) allocator: OffsetAllocator,

    /// Bytes handed out.
    pub(crate) used: u64,

    /// Thread the page is reserved for while it has live allocations.
    pub(crate) owner: Option<ThreadId>,

    pub(crate) mapping: Option<Mapping>,

    /// Outstanding `map` calls on a page that isn't kept mapped.
    pub(crate) map_count: u32,
}

/// Host-visible page of a staging heap.
///
/// Allocator units are the heap alignment.
#[derive(Debug)]
pub(crate) struct StagingPage<M> {
    pub(crate) id: PageId,
    pub(crate) memory: Memory<M>,

    /// Mapped for its whole life.
    pub(crate) persistent: bool,

    pub(crate) inner: Mutex<PageInner>,
}

impl<M> StagingPage<M> {
    pub(crate) fn new(
        id: PageId,
        memory: Memory<M>,
        alignment: u64,
        mapping: Option<Mapping>,
    ) -> Self {
        let units = memory.size() / alignment;
        debug_assert!(units <= u64::from(u32::max_value()));

        StagingPage {
            id,
            persistent: mapping.is_some(),
            inner: Mutex::new(PageInner {
                allocator: OffsetAllocator::new(units as u32),
                used: 0,
                owner: None,
                mapping,
                map_count: 0,
            }),
            memory,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.memory.size()
    }
}
