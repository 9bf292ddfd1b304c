use crate::usage::MemoryType;

const MIB: u64 = 1024 * 1024;

/// Page size used for allocations up to `max_allocation` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageTier {
    /// Largest request served from pages of this tier.
    pub max_allocation: u64,

    /// Size of the pages of this tier.
    pub page_size: u64,
}

/// Default tiers: small, medium and large pages.
pub fn default_page_tiers() -> Vec<PageTier> {
    vec![
        PageTier {
            max_allocation: MIB,
            page_size: 8 * MIB,
        },
        PageTier {
            max_allocation: 8 * MIB,
            page_size: 64 * MIB,
        },
        PageTier {
            max_allocation: 64 * MIB,
            page_size: 256 * MIB,
        },
    ]
}

/// Policy for pages whose last allocation was freed.
#[derive(Clone, Copy, Debug, derivative::Derivative)]
#[derivative(Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeapCachingConfig {
    /// Keep empty pages for reuse instead of releasing them.
    #[derivative(Default(value = "true"))]
    pub enabled: bool,

    /// Maximum number of cached pages, 0 for unlimited.
    pub max_cached_pages: usize,

    /// Maximum bytes held by cached pages, 0 for unlimited.
    pub max_cached_memory: u64,

    /// Release cached pages when they make up too much of the heap.
    pub enable_garbage_collection: bool,

    /// Fraction of total memory usage cached pages may hold
    /// before garbage collection releases them.
    #[derivative(Default(value = "0.8"))]
    pub gc_memory_threshold: f32,
}

impl HeapCachingConfig {
    /// Apply overrides read from the process environment.
    ///
    /// Recognized variables are `RHI_ALLOCATOR_CACHING`, `RHI_ALLOCATOR_MAX_PAGES`,
    /// `RHI_ALLOCATOR_MAX_MEMORY_MB`, `RHI_ALLOCATOR_GC_ENABLE` and
    /// `RHI_ALLOCATOR_GC_THRESHOLD`.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    /// Malformed values are ignored.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(enabled) = parse_override::<u32>(&lookup, "RHI_ALLOCATOR_CACHING") {
            self.enabled = enabled != 0;
        }
        if let Some(pages) = parse_override(&lookup, "RHI_ALLOCATOR_MAX_PAGES") {
            self.max_cached_pages = pages;
        }
        if let Some(mb) = parse_override::<u64>(&lookup, "RHI_ALLOCATOR_MAX_MEMORY_MB") {
            self.max_cached_memory = mb.saturating_mul(MIB);
        }
        if let Some(enabled) = parse_override::<u32>(&lookup, "RHI_ALLOCATOR_GC_ENABLE") {
            self.enable_garbage_collection = enabled != 0;
        }
        if let Some(threshold) = parse_override::<f32>(&lookup, "RHI_ALLOCATOR_GC_THRESHOLD") {
            if (0.0..=1.0).contains(&threshold) {
                self.gc_memory_threshold = threshold;
            } else {
                log::warn!("Ignoring GC threshold {} outside of 0..=1", threshold);
            }
        }
        self
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let value = lookup(name)?;
    match value.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring malformed {}={:?}", name, value);
            None
        }
    }
}

/// Heap configuration.
#[derive(Clone, Debug, derivative::Derivative)]
#[derivative(Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeapDesc {
    /// Name used in logs and reports.
    #[derivative(Default(value = "\"Unnamed Heap\".into()"))]
    pub label: String,

    /// Kind of memory pages are allocated from.
    pub memory_type: MemoryType,

    /// What to do with empty pages.
    pub caching: HeapCachingConfig,

    /// Page sizes by request size, ascending.
    /// Larger requests get a dedicated page.
    #[derivative(Default(value = "default_page_tiers()"))]
    pub page_tiers: Vec<PageTier>,

    /// Every allocation is aligned to at least this.
    #[derivative(Default(value = "128"))]
    pub min_alignment: u64,
}

/// Allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapAllocDesc {
    /// Size in bytes.
    pub size: u64,

    /// Required alignment, a power of two.
    pub alignment: u64,
}
