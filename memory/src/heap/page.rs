use crate::{
    allocator::{Allocation, OffsetAllocator, StorageReport},
    memory::Memory,
    PageId,
};

/// Lifecycle of a heap page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Serves live allocations.
    Active,

    /// Empty, kept for reuse.
    Cached,

    /// Backing memory returned to the device.
    Released,
}

/// One device allocation sliced by its own region allocator.
///
/// Allocator units are `alignment` bytes.
#[derive(Debug)]
pub(crate) struct Page<M> {
    id: PageId,
    memory: Memory<M>,
    alignment: u64,
    allocator: OffsetAllocator,
    state: PageState,
    device_address: Option<u64>,
    cached_at: u64,
}

impl<M> Page<M> {
    /// `memory.size()` must be a multiple of `alignment`
    /// and fit into `u32` units.
    pub(crate) fn new(
        id: PageId,
        memory: Memory<M>,
        alignment: u64,
        device_address: Option<u64>,
    ) -> Self {
        let units = memory.size() / alignment;
        debug_assert_eq!(units * alignment, memory.size());
        debug_assert!(units <= u64::from(u32::max_value()));

        Page {
            id,
            alignment,
            allocator: OffsetAllocator::new(units as u32),
            memory,
            state: PageState::Active,
            device_address,
            cached_at: 0,
        }
    }

    pub(crate) fn id(&self) -> PageId {
        self.id
    }

    pub(crate) fn size(&self) -> u64 {
        self.memory.size()
    }

    pub(crate) fn memory(&self) -> &Memory<M> {
        &self.memory
    }

    pub(crate) fn alignment(&self) -> u64 {
        self.alignment
    }

    pub(crate) fn state(&self) -> PageState {
        self.state
    }

    pub(crate) fn cached_at(&self) -> u64 {
        self.cached_at
    }

    pub(crate) fn device_address(&self) -> Option<u64> {
        self.device_address
    }

    pub(crate) fn allocator(&self) -> &OffsetAllocator {
        &self.allocator
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.allocator.current_allocs() == 0
    }

    pub(crate) fn allocations(&self) -> u32 {
        self.allocator.current_allocs()
    }

    /// Bytes handed out, including frees still waiting for the GPU.
    pub(crate) fn used(&self) -> u64 {
        self.size() - u64::from(self.allocator.free_storage()) * self.alignment
    }

    pub(crate) fn storage_report(&self) -> StorageReport {
        self.allocator.storage_report()
    }

    pub(crate) fn allocate(&mut self, units: u32) -> Option<Allocation> {
        let allocation = self.allocator.allocate(units)?;
        self.state = PageState::Active;
        Some(allocation)
    }

    pub(crate) fn free(&mut self, allocation: Allocation) {
        self.allocator.free(allocation);
    }

    pub(crate) fn cache(&mut self, stamp: u64) {
        debug_assert!(self.is_empty());
        self.state = PageState::Cached;
        self.cached_at = stamp;
    }

    pub(crate) fn into_memory(self) -> Memory<M> {
        log::trace!("Page {} of {} bytes released", self.id, self.size());
        self.memory
    }
}
