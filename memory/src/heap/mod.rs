//! Caching page heap for device memory.
//!
//! Requests are served from pages sized by tier, each page sliced by its own
//! `OffsetAllocator`. Frees are deferred until the GPU has finished with the
//! memory, and empty pages are kept around for reuse.

mod config;
mod page;

pub use self::{
    config::{default_page_tiers, HeapAllocDesc, HeapCachingConfig, HeapDesc, PageTier},
    page::PageState,
};

use {
    self::page::Page,
    crate::{
        allocator::Allocation,
        device::{Device, Timeline},
        error::{ConsistencyError, HeapError},
        memory::Memory,
        util::{checked_aligned, page_units, units},
        utilization::HeapReport,
        PageId,
    },
    parking_lot::Mutex,
    smallvec::SmallVec,
    std::collections::{BTreeMap, VecDeque},
};

/// Memory block allocated from `Heap`.
///
/// Must be returned with `Heap::free`.
#[derive(Debug, PartialEq, Eq)]
pub struct HeapAlloc {
    offset: u64,
    size: u64,
    page_id: PageId,
    allocation: Allocation,
    device_address: Option<u64>,
}

impl HeapAlloc {
    /// Offset in bytes from the start of the page memory.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes, rounded up to the alignment.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Page the block lives in.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Device address of the first byte, if the backend exposes them.
    pub fn device_address(&self) -> Option<u64> {
        self.device_address
    }
}

#[derive(Debug)]
struct PendingFree {
    alloc: HeapAlloc,
    value: u64,
}

#[derive(Debug)]
struct HeapState<M> {
    pages: BTreeMap<PageId, Page<M>>,
    next_page_id: PageId,
    cache_clock: u64,
}

impl<M> HeapState<M> {
    fn cached_pages(&self) -> (usize, u64) {
        self.pages
            .values()
            .filter(|page| page.state() == PageState::Cached)
            .fold((0, 0), |(count, bytes), page| (count + 1, bytes + page.size()))
    }

    fn total_mem_usage(&self) -> u64 {
        self.pages.values().map(|page| page.size()).sum()
    }

    fn oldest_cached(&self) -> Option<PageId> {
        self.pages
            .values()
            .filter(|page| page.state() == PageState::Cached)
            .min_by_key(|page| page.cached_at())
            .map(|page| page.id())
    }
}

/// Caching device memory heap.
///
/// All methods take `&self`, the page table and the pending free queue
/// are guarded by separate locks that are never held together.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Heap<D: Device, T> {
    #[derivative(Debug = "ignore")]
    device: D,
    #[derivative(Debug = "ignore")]
    timeline: T,
    desc: HeapDesc,
    #[derivative(Debug = "ignore")]
    state: Mutex<HeapState<D::Memory>>,
    #[derivative(Debug = "ignore")]
    pending: Mutex<VecDeque<PendingFree>>,
}

impl<D, T> Heap<D, T>
where
    D: Device,
    T: Timeline,
{
    /// Create heap allocating pages from `device`
    /// and gating frees on `timeline`.
    ///
    /// Caching settings may be overridden from the environment.
    pub fn new(device: D, timeline: T, mut desc: HeapDesc) -> Self {
        desc.caching = desc.caching.with_env_overrides();
        if !desc.min_alignment.is_power_of_two() {
            log::warn!(
                "Heap '{}' minimal alignment {} is not a power of two, using 1",
                desc.label,
                desc.min_alignment
            );
            desc.min_alignment = 1;
        }
        desc.page_tiers.sort_by_key(|tier| tier.max_allocation);

        log::info!(
            "Heap '{}' created for {:?} memory, caching: {:?}",
            desc.label,
            desc.memory_type,
            desc.caching
        );

        Heap {
            device,
            timeline,
            desc,
            state: Mutex::new(HeapState {
                pages: BTreeMap::new(),
                next_page_id: 1,
                cache_clock: 0,
            }),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Heap configuration.
    pub fn desc(&self) -> &HeapDesc {
        &self.desc
    }

    /// Device the pages are allocated from.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Timeline gating the deferred frees.
    pub fn timeline(&self) -> &T {
        &self.timeline
    }

    /// Allocate block of memory.
    ///
    /// Reclaims frees whose GPU work has finished first.
    /// Requests larger than every page tier get a dedicated page.
    pub fn allocate(&self, desc: HeapAllocDesc) -> Result<HeapAlloc, HeapError> {
        if !desc.alignment.is_power_of_two() {
            return Err(HeapError::InvalidAlignment(desc.alignment));
        }
        let alignment = desc.alignment.max(self.desc.min_alignment);
        let size = checked_aligned(desc.size.max(1), alignment)
            .ok_or(HeapError::TooLarge(desc.size))?;
        let page_size = self
            .page_size(size, alignment)
            .ok_or(HeapError::TooLarge(desc.size))?;
        let count = units(size, alignment).ok_or(HeapError::TooLarge(desc.size))?;

        self.reclaim();

        let mut state = self.state.lock();

        // Pages in use first, cached ones only when nothing else fits.
        for &wanted in &[PageState::Active, PageState::Cached] {
            let found = state.pages.values_mut().find_map(|page| {
                if page.state() != wanted
                    || page.size() != page_size
                    || page.alignment() != alignment
                {
                    return None;
                }
                let allocation = page.allocate(count)?;
                Some((page, allocation))
            });

            if let Some((page, allocation)) = found {
                return Ok(Self::make_alloc(page, allocation, size));
            }
        }

        let memory = match self.allocate_memory(page_size) {
            Ok(memory) => memory,
            Err(error) => {
                log::warn!(
                    "Heap '{}' failed to allocate {} bytes page: {}. Releasing empty pages",
                    self.desc.label,
                    page_size,
                    error
                );
                self.release_empty_pages(&mut state);
                self.allocate_memory(page_size)?
            }
        };

        let id = state.next_page_id;
        state.next_page_id += 1;

        let device_address = self.device.device_address(memory.raw());
        let mut page = Page::new(id, memory, alignment, device_address);
        log::trace!(
            "Heap '{}' created page {} of {} bytes aligned to {}",
            self.desc.label,
            id,
            page_size,
            alignment
        );

        let allocation = match page.allocate(count) {
            Some(allocation) => allocation,
            None => {
                unsafe { self.device.free(page.into_memory().into_raw()) };
                return Err(HeapError::TooLarge(desc.size));
            }
        };

        let alloc = Self::make_alloc(&page, allocation, size);
        state.pages.insert(id, page);
        Ok(alloc)
    }

    /// Return block to the heap.
    ///
    /// The block becomes reusable once all GPU work submitted so far
    /// has completed. Never blocks.
    pub fn free(&self, alloc: HeapAlloc) {
        let value = self.timeline.current_value();
        if self.timeline.in_order() || self.timeline.is_complete(value) {
            let mut state = self.state.lock();
            self.retire(&mut state, alloc);
        } else {
            log::trace!(
                "Free of {} bytes in page {} deferred until {}",
                alloc.size,
                alloc.page_id,
                value
            );
            self.pending.lock().push_back(PendingFree { alloc, value });
        }
    }

    /// Return blocks whose GPU work has completed to their pages.
    pub fn flush(&self) {
        self.reclaim();
    }

    /// Release backing memory of every empty page.
    pub fn remove_empty_pages(&self) {
        let mut state = self.state.lock();
        self.release_empty_pages(&mut state);
    }

    /// Usage snapshot.
    ///
    /// Reclaims frees whose GPU work has finished first.
    pub fn report(&self) -> HeapReport {
        self.reclaim();

        let state = self.state.lock();
        let (total_allocated, num_allocations) = state
            .pages
            .values()
            .fold((0, 0), |(bytes, count), page| {
                (bytes + page.used(), count + u64::from(page.allocations()))
            });

        HeapReport {
            label: self.desc.label.clone(),
            total_allocated,
            num_allocations,
            total_mem_usage: state.total_mem_usage(),
            num_pages: state.pages.len() as u64,
        }
    }

    /// Number of frees waiting for the GPU.
    pub fn pending_frees(&self) -> usize {
        self.pending.lock().len()
    }

    /// State of the page.
    /// Ids are never reused, so any id handed out before and now gone is released.
    pub fn page_state(&self, id: PageId) -> Option<PageState> {
        let state = self.state.lock();
        match state.pages.get(&id) {
            Some(page) => Some(page.state()),
            None if id > 0 && id < state.next_page_id => Some(PageState::Released),
            None => None,
        }
    }

    /// Run `f` with the native memory object backing `page_id`,
    /// e.g. to bind a buffer at `HeapAlloc::offset`.
    ///
    /// The page table stays locked while `f` runs, so `f` must not call into the heap.
    pub fn with_raw_memory<R>(
        &self,
        page_id: PageId,
        f: impl FnOnce(&D::Memory) -> R,
    ) -> Result<R, HeapError> {
        let state = self.state.lock();
        let page = state
            .pages
            .get(&page_id)
            .ok_or(HeapError::UnknownPage(page_id))?;
        Ok(f(page.memory().raw()))
    }

    /// Walk every page and verify its bookkeeping.
    pub fn validate(&self) -> Result<(), ConsistencyError> {
        let state = self.state.lock();
        for page in state.pages.values() {
            page.allocator().check_consistency()?;
            let report = page.storage_report();
            if report.largest_free_region > report.total_free_space {
                return Err(ConsistencyError::FreeStorage {
                    counted: u64::from(report.largest_free_region),
                    recorded: u64::from(report.total_free_space),
                });
            }
        }
        Ok(())
    }

    /// Panic if the bookkeeping is broken. Does nothing in release builds.
    pub fn check_consistency(&self) {
        if cfg!(debug_assertions) {
            if let Err(error) = self.validate() {
                panic!("Heap '{}' is corrupted: {}", self.desc.label, error);
            }
        }
    }

    fn page_size(&self, size: u64, alignment: u64) -> Option<u64> {
        let tier = self
            .desc
            .page_tiers
            .iter()
            .find(|tier| size <= tier.max_allocation)
            .map_or(size, |tier| tier.page_size.max(size));
        let count = page_units(checked_aligned(tier, alignment)?, alignment)?;
        Some(u64::from(count) * alignment)
    }

    fn allocate_memory(&self, size: u64) -> Result<Memory<D::Memory>, HeapError> {
        let raw = unsafe { self.device.allocate(self.desc.memory_type, size)? };
        Ok(unsafe { Memory::from_raw(raw, size, self.desc.memory_type) })
    }

    fn make_alloc(page: &Page<D::Memory>, allocation: Allocation, size: u64) -> HeapAlloc {
        let offset = u64::from(allocation.offset()) * page.alignment();
        HeapAlloc {
            offset,
            size,
            page_id: page.id(),
            allocation,
            device_address: page.device_address().map(|address| address + offset),
        }
    }

    fn reclaim(&self) {
        let ready: SmallVec<[PendingFree; 8]> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }

            // Completion order may differ from free order.
            let mut ready = SmallVec::new();
            let mut waiting = VecDeque::with_capacity(pending.len());
            for free in pending.drain(..) {
                if self.timeline.is_complete(free.value) {
                    ready.push(free);
                } else {
                    waiting.push_back(free);
                }
            }
            *pending = waiting;
            ready
        };

        if ready.is_empty() {
            return;
        }

        log::debug!(
            "Heap '{}' reclaims {} deferred frees",
            self.desc.label,
            ready.len()
        );
        let mut state = self.state.lock();
        for free in ready {
            self.retire(&mut state, free.alloc);
        }
    }

    fn retire(&self, state: &mut HeapState<D::Memory>, alloc: HeapAlloc) {
        let page = match state.pages.get_mut(&alloc.page_id) {
            Some(page) => page,
            None => {
                log::error!("{}", HeapError::UnknownPage(alloc.page_id));
                debug_assert!(false, "Block freed into a foreign heap");
                return;
            }
        };

        page.free(alloc.allocation);
        if !page.is_empty() {
            return;
        }

        if self.desc.caching.enabled {
            state.cache_clock += 1;
            let stamp = state.cache_clock;
            if let Some(page) = state.pages.get_mut(&alloc.page_id) {
                page.cache(stamp);
            }
            self.enforce_cache_limits(state);
        } else {
            self.release_page(state, alloc.page_id);
        }
    }

    fn enforce_cache_limits(&self, state: &mut HeapState<D::Memory>) {
        let caching = self.desc.caching;
        loop {
            let (count, bytes) = state.cached_pages();
            let over_count = caching.max_cached_pages > 0 && count > caching.max_cached_pages;
            let over_memory = caching.max_cached_memory > 0 && bytes > caching.max_cached_memory;
            let over_gc = caching.enable_garbage_collection
                && bytes as f64
                    > f64::from(caching.gc_memory_threshold) * state.total_mem_usage() as f64;

            if !(over_count || over_memory || over_gc) {
                break;
            }

            match state.oldest_cached() {
                Some(id) => self.release_page(state, id),
                None => break,
            }
        }
    }

    fn release_empty_pages(&self, state: &mut HeapState<D::Memory>) {
        let empty: SmallVec<[PageId; 16]> = state
            .pages
            .values()
            .filter(|page| page.is_empty())
            .map(|page| page.id())
            .collect();

        for id in empty {
            self.release_page(state, id);
        }
    }

    fn release_page(&self, state: &mut HeapState<D::Memory>, id: PageId) {
        if let Some(page) = state.pages.remove(&id) {
            debug_assert!(page.is_empty());
            unsafe { self.device.free(page.into_memory().into_raw()) };
        }
    }
}

impl<D, T> Drop for Heap<D, T>
where
    D: Device,
{
    fn drop(&mut self) {
        let pending = self.pending.get_mut().len();
        let state = self.state.get_mut();
        let live: u32 = state.pages.values().map(|page| page.allocations()).sum();
        if live as usize > pending {
            log::error!(
                "Heap '{}' dropped with {} live allocations",
                self.desc.label,
                live as usize - pending
            );
        }

        self.pending.get_mut().clear();
        let pages = std::mem::replace(&mut state.pages, BTreeMap::new());
        for (_, page) in pages {
            unsafe { self.device.free(page.into_memory().into_raw()) };
        }
    }
}
