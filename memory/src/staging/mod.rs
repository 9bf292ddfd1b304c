//! Heap for short-lived host-visible upload and readback memory.
//!
//! Pages are either shared by all threads and kept mapped, or reserved for
//! one thread at a time and mapped on demand. Empty pages are kept until
//! released explicitly.

mod page;

use {
    self::page::{Mapping, StagingPage},
    crate::{
        allocator::Allocation,
        device::Device,
        error::{ConsistencyError, MappingError, StagingError},
        mapping::MappedRange,
        memory::Memory,
        usage::MemoryType,
        util::{aligned, checked_aligned, page_units, units},
        PageId,
    },
    parking_lot::RwLock,
    smallvec::SmallVec,
    std::{
        collections::BTreeMap,
        mem::ManuallyDrop,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread::{self, ThreadId},
    },
};

/// Staging heap configuration.
#[derive(Clone, Copy, Debug, derivative::Derivative)]
#[derivative(Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StagingHeapDesc {
    /// Size of regular pages.
    /// Larger requests get a page of their own.
    #[derivative(Default(value = "16 * 1024 * 1024"))]
    pub page_size: u64,

    /// Every allocation is aligned to this, a power of two.
    #[derivative(Default(value = "1024"))]
    pub alignment: u64,

    /// Kind of memory pages are allocated from.
    #[derivative(Default(value = "MemoryType::Upload"))]
    pub memory_type: MemoryType,

    /// Share pages between threads and keep them mapped.
    /// Otherwise a page is reserved for one thread while it has allocations.
    #[derivative(Default(value = "true"))]
    pub keep_pages_mapped: bool,
}

/// Free-form tag carried by staging allocations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MetaData {
    /// What the allocation is used for, interpreted by the caller.
    pub usage: i32,
}

/// Region of a staging page.
///
/// Must be returned with `StagingHeap::free`, or wrapped in a `Handle`.
#[derive(Debug, PartialEq, Eq)]
pub struct StagingAllocation {
    offset: u64,
    size: u64,
    page_id: PageId,
    allocation: Allocation,
    metadata: MetaData,
}

impl StagingAllocation {
    /// Offset in bytes from the start of the page memory.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes, rounded up to the heap alignment.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Page the region lives in.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Tag given at allocation.
    pub fn metadata(&self) -> MetaData {
        self.metadata
    }
}

/// Staging allocation released when the last clone is dropped.
#[derive(derivative::Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub struct Handle<D: Device> {
    inner: Arc<HandleInner<D>>,
}

#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
struct HandleInner<D: Device> {
    #[derivative(Debug = "ignore")]
    heap: Arc<StagingHeap<D>>,
    allocation: ManuallyDrop<StagingAllocation>,
}

impl<D: Device> Drop for HandleInner<D> {
    fn drop(&mut self) {
        let allocation = unsafe {
            // `self.allocation` cannot be accessed after this function.
            ManuallyDrop::take(&mut self.allocation)
        };
        self.heap.free(allocation);
    }
}

impl<D: Device> Handle<D> {
    /// Wrapped allocation.
    pub fn allocation(&self) -> &StagingAllocation {
        &self.inner.allocation
    }

    /// Heap the allocation came from.
    pub fn heap(&self) -> &Arc<StagingHeap<D>> {
        &self.inner.heap
    }

    /// Number of clones sharing the allocation.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<D: Device> std::ops::Deref for Handle<D> {
    type Target = StagingAllocation;

    fn deref(&self) -> &StagingAllocation {
        self.allocation()
    }
}

/// Host-visible staging heap.
#[derive(derivative::Derivative)]
#[derivative(Debug(bound = ""))]
pub struct StagingHeap<D: Device> {
    #[derivative(Debug = "ignore")]
    device: D,
    page_size: u64,
    alignment: u64,
    memory_type: MemoryType,
    keep_pages_mapped: AtomicBool,
    #[derivative(Debug = "ignore")]
    pages: RwLock<BTreeMap<PageId, StagingPage<D::Memory>>>,
    next_page_id: AtomicU64,
    used: AtomicU64,
}

impl<D> StagingHeap<D>
where
    D: Device,
{
    /// Create staging heap allocating pages from `device`.
    pub fn new(device: D, desc: StagingHeapDesc) -> Self {
        let alignment = if desc.alignment.is_power_of_two() {
            desc.alignment
        } else {
            log::warn!(
                "Staging alignment {} is not a power of two, using 1024",
                desc.alignment
            );
            1024
        };
        let page_size = aligned(desc.page_size.max(1), alignment);
        let page_size =
            page_units(page_size, alignment).map_or(page_size, |count| u64::from(count) * alignment);

        log::info!(
            "Staging heap created for {:?} memory, {} bytes pages, keep mapped: {}",
            desc.memory_type,
            page_size,
            desc.keep_pages_mapped
        );

        StagingHeap {
            device,
            page_size,
            alignment,
            memory_type: desc.memory_type,
            keep_pages_mapped: AtomicBool::new(desc.keep_pages_mapped),
            pages: RwLock::new(BTreeMap::new()),
            next_page_id: AtomicU64::new(1),
            used: AtomicU64::new(0),
        }
    }

    /// Device the pages are allocated from.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Round `size` up to the heap alignment.
    pub fn align_up(&self, size: u64) -> u64 {
        aligned(size, self.alignment)
    }

    /// Allocation alignment.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Size of regular pages.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Number of pages held, empty ones included.
    pub fn num_pages(&self) -> usize {
        self.pages.read().len()
    }

    /// Bytes of memory held by all pages.
    pub fn capacity(&self) -> u64 {
        self.pages.read().values().map(|page| page.size()).sum()
    }

    /// Pages are shared between threads and kept mapped.
    pub fn keep_pages_mapped(&self) -> bool {
        self.keep_pages_mapped.load(Ordering::Acquire)
    }

    /// Switch page policy for subsequent allocations.
    /// Pages created before keep their mapping mode.
    pub fn set_keep_pages_mapped(&self, keep: bool) {
        self.keep_pages_mapped.store(keep, Ordering::Release);
    }

    /// Allocate `size` bytes.
    pub fn alloc(&self, size: u64, metadata: MetaData) -> Result<StagingAllocation, StagingError> {
        let size = checked_aligned(size.max(1), self.alignment).ok_or(StagingError::TooLarge(size))?;
        let count = units(size, self.alignment).ok_or(StagingError::TooLarge(size))?;
        let keep = self.keep_pages_mapped();
        let thread = thread::current().id();

        {
            let pages = self.pages.read();
            if let Some(allocation) = self.alloc_from_pages(&pages, count, keep, thread, metadata) {
                return Ok(allocation);
            }
        }

        let mut pages = self.pages.write();

        // Another thread may have created a page meanwhile.
        if let Some(allocation) = self.alloc_from_pages(&pages, count, keep, thread, metadata) {
            return Ok(allocation);
        }

        let page = self.create_page(size.max(self.page_size), keep)?;
        let allocation = page.inner.lock().allocator.allocate(count);
        let allocation = match allocation {
            Some(allocation) => {
                let mut inner = page.inner.lock();
                self.commit(page.id, &mut inner, allocation, count, keep, thread, metadata)
            }
            None => {
                self.release_page(page);
                return Err(StagingError::TooLarge(size));
            }
        };

        pages.insert(page.id, page);
        Ok(allocation)
    }

    /// Allocate `size` bytes wrapped in a `Handle`.
    pub fn alloc_handle(
        self: &Arc<Self>,
        size: u64,
        metadata: MetaData,
    ) -> Result<Handle<D>, StagingError> {
        let allocation = self.alloc(size, metadata)?;
        Ok(Handle {
            inner: Arc::new(HandleInner {
                heap: Arc::clone(self),
                allocation: ManuallyDrop::new(allocation),
            }),
        })
    }

    /// Return region to its page.
    /// Empty pages are kept for reuse.
    ///
    /// Regions of pages dropped by `release` are ignored with an error logged.
    pub fn free(&self, allocation: StagingAllocation) {
        let pages = self.pages.read();
        let page = match pages.get(&allocation.page_id) {
            Some(page) => page,
            None => {
                log::error!("{}", StagingError::UnknownPage(allocation.page_id));
                return;
            }
        };

        let mut inner = page.inner.lock();
        inner.allocator.free(allocation.allocation);
        inner.used -= allocation.size;
        if inner.used == 0 {
            inner.owner = None;
        }
        self.used.fetch_sub(allocation.size, Ordering::AcqRel);
    }

    /// Map allocation into host memory.
    ///
    /// Every successful `map` must be paired with `unmap`.
    pub fn map(&self, allocation: &StagingAllocation) -> Result<MappedRange<'_>, StagingError> {
        let pages = self.pages.read();
        let page = pages
            .get(&allocation.page_id)
            .ok_or(StagingError::UnknownPage(allocation.page_id))?;
        if !page.memory.host_visible() {
            return Err(MappingError::HostInvisible.into());
        }

        let mut inner = page.inner.lock();
        let Mapping(ptr) = match inner.mapping {
            Some(mapping) => mapping,
            None => {
                let ptr = unsafe { self.device.map(page.memory.raw(), 0..page.size())? };
                inner.mapping = Some(Mapping(ptr));
                Mapping(ptr)
            }
        };
        if !page.persistent {
            inner.map_count += 1;
        }

        let range = allocation.offset..allocation.offset + allocation.size;
        unsafe {
            let ptr = std::ptr::NonNull::new_unchecked(ptr.as_ptr().add(allocation.offset as usize));
            Ok(MappedRange::from_raw(ptr, range))
        }
    }

    /// Undo one `map` of the allocation.
    pub fn unmap(&self, allocation: &StagingAllocation) {
        let pages = self.pages.read();
        let page = match pages.get(&allocation.page_id) {
            Some(page) => page,
            None => {
                log::error!("{}", StagingError::UnknownPage(allocation.page_id));
                return;
            }
        };

        if page.persistent {
            return;
        }

        let mut inner = page.inner.lock();
        debug_assert!(inner.map_count > 0, "Unmap without map");
        inner.map_count = inner.map_count.saturating_sub(1);
        if inner.map_count == 0 && inner.mapping.take().is_some() {
            unsafe { self.device.unmap(page.memory.raw()) };
        }
    }

    /// Run `f` with the native memory object backing `page_id`.
    pub fn with_raw_memory<R>(
        &self,
        page_id: PageId,
        f: impl FnOnce(&D::Memory) -> R,
    ) -> Result<R, StagingError> {
        let pages = self.pages.read();
        let page = pages
            .get(&page_id)
            .ok_or(StagingError::UnknownPage(page_id))?;
        Ok(f(page.memory.raw()))
    }

    /// Release every page without allocations.
    pub fn release_all_free_pages(&self) {
        let mut pages = self.pages.write();
        let empty: SmallVec<[PageId; 16]> = pages
            .values()
            .filter(|page| {
                let inner = page.inner.lock();
                inner.used == 0 && inner.map_count == 0
            })
            .map(|page| page.id)
            .collect();

        for id in empty {
            if let Some(page) = pages.remove(&id) {
                self.release_page(page);
            }
        }
    }

    /// Release every page.
    /// Allocations and handles still alive become dangling: their mappings
    /// must not be used and freeing them does nothing.
    pub fn release(&self) {
        let used = self.used();
        if used != 0 {
            log::error!("Staging heap released with {} bytes still allocated", used);
        }

        let pages = std::mem::replace(&mut *self.pages.write(), BTreeMap::new());
        for (_, page) in pages {
            self.release_page(page);
        }
        self.used.store(0, Ordering::Release);
    }

    /// Walk every page and verify its bookkeeping.
    pub fn validate(&self) -> Result<(), ConsistencyError> {
        let pages = self.pages.read();
        let mut total = 0;
        for page in pages.values() {
            let inner = page.inner.lock();
            inner.allocator.check_consistency()?;

            let counted = page.size() - u64::from(inner.allocator.free_storage()) * self.alignment;
            if counted != inner.used {
                return Err(ConsistencyError::Usage {
                    page: page.id,
                    counted,
                    recorded: inner.used,
                });
            }
            total += counted;
        }

        let recorded = self.used();
        if total != recorded {
            return Err(ConsistencyError::Usage {
                page: 0,
                counted: total,
                recorded,
            });
        }
        Ok(())
    }

    /// Panic if the bookkeeping is broken. Does nothing in release builds.
    pub fn check_consistency(&self) {
        if cfg!(debug_assertions) {
            if let Err(error) = self.validate() {
                panic!("Staging heap is corrupted: {}", error);
            }
        }
    }

    fn alloc_from_pages(
        &self,
        pages: &BTreeMap<PageId, StagingPage<D::Memory>>,
        count: u32,
        keep: bool,
        thread: ThreadId,
        metadata: MetaData,
    ) -> Option<StagingAllocation> {
        pages.values().find_map(|page| {
            let mut inner = page.inner.lock();
            if !keep && inner.owner.map_or(false, |owner| owner != thread) {
                return None;
            }
            let allocation = inner.allocator.allocate(count)?;
            Some(self.commit(page.id, &mut inner, allocation, count, keep, thread, metadata))
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        page_id: PageId,
        inner: &mut page::PageInner,
        allocation: Allocation,
        count: u32,
        keep: bool,
        thread: ThreadId,
        metadata: MetaData,
    ) -> StagingAllocation {
        let size = u64::from(count) * self.alignment;
        inner.used += size;
        if !keep {
            inner.owner = Some(thread);
        }
        self.used.fetch_add(size, Ordering::AcqRel);

        StagingAllocation {
            offset: u64::from(allocation.offset()) * self.alignment,
            size,
            page_id,
            allocation,
            metadata,
        }
    }

    fn create_page(&self, size: u64, keep: bool) -> Result<StagingPage<D::Memory>, StagingError> {
        let count = checked_aligned(size, self.alignment)
            .and_then(|size| page_units(size, self.alignment))
            .ok_or(StagingError::TooLarge(size))?;
        let size = u64::from(count) * self.alignment;

        let raw = unsafe { self.device.allocate(self.memory_type, size)? };
        let memory = unsafe { Memory::from_raw(raw, size, self.memory_type) };

        let mapping = if keep && memory.host_visible() {
            match unsafe { self.device.map(memory.raw(), 0..size) } {
                Ok(ptr) => Some(Mapping(ptr)),
                Err(error) => {
                    unsafe { self.device.free(memory.into_raw()) };
                    return Err(error.into());
                }
            }
        } else {
            None
        };

        let id = self.next_page_id.fetch_add(1, Ordering::AcqRel) as PageId;
        log::trace!("Staging page {} of {} bytes created", id, size);
        Ok(StagingPage::new(id, memory, self.alignment, mapping))
    }

    fn release_page(&self, page: StagingPage<D::Memory>) {
        let StagingPage {
            id, memory, inner, ..
        } = page;
        let inner = inner.into_inner();
        unsafe {
            if inner.mapping.is_some() {
                self.device.unmap(memory.raw());
            }
            self.device.free(memory.into_raw());
        }
        log::trace!("Staging page {} released", id);
    }
}

impl<D> Drop for StagingHeap<D>
where
    D: Device,
{
    fn drop(&mut self) {
        self.release();
    }
}
