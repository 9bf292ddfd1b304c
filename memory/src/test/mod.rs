mod heap;

use {
    crate::{
        device::{Device, Timeline},
        error::{MappingError, OutOfMemoryError},
        usage::MemoryType,
    },
    parking_lot::Mutex,
    std::{
        alloc::Layout,
        collections::HashSet,
        ops::Range,
        ptr::NonNull,
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

const ADDRESS_STRIDE: u64 = 1 << 40;

/// Memory handed out by `MockDevice`.
/// Host-visible memory is backed by a real host allocation.
#[derive(Debug)]
pub(crate) struct MockMemory {
    id: u64,
    size: u64,
    memory_type: MemoryType,
    host: Option<(NonNull<u8>, Layout)>,
}

unsafe impl Send for MockMemory {}
unsafe impl Sync for MockMemory {}

impl MockMemory {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Default)]
struct Inner {
    next: u64,
    live: HashSet<u64>,
    mapped: HashSet<u64>,
    in_use: u64,
    budget: Option<u64>,
    allocations: u64,
    maps: u64,
}

/// Device that keeps books instead of talking to a GPU.
#[derive(Debug, Default)]
pub(crate) struct MockDevice(Mutex<Inner>);

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Device that refuses allocations beyond `budget` bytes in use.
    pub(crate) fn with_budget(budget: u64) -> Self {
        let device = Self::default();
        device.0.lock().budget = Some(budget);
        device
    }

    pub(crate) fn set_budget(&self, budget: Option<u64>) {
        self.0.lock().budget = budget;
    }

    /// Memory objects currently allocated.
    pub(crate) fn live(&self) -> usize {
        self.0.lock().live.len()
    }

    /// Memory objects allocated over the device lifetime.
    pub(crate) fn allocations(&self) -> u64 {
        self.0.lock().allocations
    }

    /// Memory objects currently mapped.
    pub(crate) fn mapped(&self) -> usize {
        self.0.lock().mapped.len()
    }

    /// `map` calls over the device lifetime.
    pub(crate) fn maps(&self) -> u64 {
        self.0.lock().maps
    }
}

impl Device for MockDevice {
    type Memory = MockMemory;

    unsafe fn allocate(
        &self,
        memory_type: MemoryType,
        size: u64,
    ) -> Result<MockMemory, OutOfMemoryError> {
        let mut inner = self.0.lock();
        if let Some(budget) = inner.budget {
            if inner.in_use + size > budget {
                return Err(OutOfMemoryError::OutOfDeviceMemory);
            }
        }

        let host = if memory_type.host_visible() {
            let layout = Layout::from_size_align(size as usize, 4096)
                .map_err(|_| OutOfMemoryError::OutOfHostMemory)?;
            let ptr = NonNull::new(std::alloc::alloc_zeroed(layout))
                .ok_or(OutOfMemoryError::OutOfHostMemory)?;
            Some((ptr, layout))
        } else {
            None
        };

        inner.next += 1;
        let id = inner.next;
        inner.live.insert(id);
        inner.in_use += size;
        inner.allocations += 1;

        Ok(MockMemory {
            id,
            size,
            memory_type,
            host,
        })
    }

    unsafe fn free(&self, memory: MockMemory) {
        let mut inner = self.0.lock();
        assert!(inner.live.remove(&memory.id), "Double-free");
        inner.mapped.remove(&memory.id);
        inner.in_use -= memory.size;
        if let Some((ptr, layout)) = memory.host {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    unsafe fn map(
        &self,
        memory: &MockMemory,
        range: Range<u64>,
    ) -> Result<NonNull<u8>, MappingError> {
        let (ptr, _) = memory.host.ok_or(MappingError::HostInvisible)?;
        if range.start > range.end || range.end > memory.size {
            return Err(MappingError::OutOfBounds);
        }

        let mut inner = self.0.lock();
        assert!(inner.mapped.insert(memory.id), "Memory is mapped already");
        inner.maps += 1;
        Ok(NonNull::new_unchecked(ptr.as_ptr().add(range.start as usize)))
    }

    unsafe fn unmap(&self, memory: &MockMemory) {
        assert!(self.0.lock().mapped.remove(&memory.id), "Memory is not mapped");
    }

    fn device_address(&self, memory: &MockMemory) -> Option<u64> {
        match memory.memory_type {
            MemoryType::DeviceLocal => Some(memory.id * ADDRESS_STRIDE),
            _ => None,
        }
    }
}

/// Timeline driven by hand.
#[derive(Debug, Default)]
pub(crate) struct MockTimeline {
    current: AtomicU64,
    completed: AtomicU64,
    in_order: AtomicBool,
}

impl MockTimeline {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a submission, returns the value it will signal.
    pub(crate) fn submit(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// GPU finished work up to `value`.
    pub(crate) fn signal(&self, value: u64) {
        self.completed.fetch_max(value, Ordering::AcqRel);
    }

    /// GPU finished everything submitted.
    pub(crate) fn wait_idle(&self) {
        self.signal(self.current.load(Ordering::Acquire));
    }

    pub(crate) fn set_in_order(&self, in_order: bool) {
        self.in_order.store(in_order, Ordering::Release);
    }
}

impl Timeline for MockTimeline {
    fn current_value(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    fn in_order(&self) -> bool {
        self.in_order.load(Ordering::Acquire)
    }
}
