use {
    crate::{error::ConsistencyError, size_class},
    slab::Slab,
};

const NUM_TOP_BINS: usize = 32;
const BINS_PER_LEAF: usize = 8;
const TOP_BINS_INDEX_SHIFT: u32 = 3;
const LEAF_BINS_INDEX_MASK: u32 = 0x7;
const NUM_LEAF_BINS: usize = NUM_TOP_BINS * BINS_PER_LEAF;

/// Default limit on the number of nodes (live allocations plus free regions).
pub const DEFAULT_MAX_ALLOCS: u32 = 128 * 1024;

/// Region handed out by `OffsetAllocator`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Allocation {
    offset: u32,
    node: usize,
}

impl Allocation {
    /// Offset value that never names a real region.
    pub const NO_SPACE: u32 = u32::MAX;

    /// Offset of the region in allocator units.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Index of the node that tracks this region.
    pub fn node(&self) -> usize {
        self.node
    }
}

/// Summary of the free space left in an allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageReport {
    /// Sum of all free regions.
    pub total_free_space: u32,

    /// Size class lower bound of the largest free region.
    pub largest_free_region: u32,
}

/// Number of free regions in one size class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageRegion {
    /// Smallest size of the class.
    pub size: u32,

    /// Free regions currently filed under the class.
    pub count: u32,
}

/// Free regions per size class.
#[derive(Clone, Debug)]
pub struct StorageReportFull {
    /// One entry per bin, indexed by size class.
    pub free_regions: Vec<StorageRegion>,
}

#[derive(Clone, Copy, Debug)]
struct Node {
    offset: u32,
    size: u32,
    bin_prev: Option<usize>,
    bin_next: Option<usize>,
    neighbor_prev: Option<usize>,
    neighbor_next: Option<usize>,
    used: bool,
}

fn find_lowest_set_bit_after(mask: u32, start: u32) -> Option<u32> {
    let after = if start >= 32 {
        0
    } else {
        mask & !((1u32 << start) - 1)
    };

    if after == 0 {
        None
    } else {
        Some(after.trailing_zeros())
    }
}

/// Binned free-list allocator over a flat range `0 .. size`.
///
/// Free regions are filed into 256 size-class bins addressed through a
/// two-level bitmask, so both allocation and free run in constant time.
/// Freed regions merge with free neighbors immediately.
///
/// The allocator hands out offsets only, units are up to the caller.
#[derive(Debug)]
pub struct OffsetAllocator {
    size: u32,
    max_allocs: u32,
    free_storage: u32,
    allocations: u32,
    used_bins_top: u32,
    used_bins: [u8; NUM_TOP_BINS],
    bin_indices: Vec<Option<usize>>,
    nodes: Slab<Node>,
}

impl OffsetAllocator {
    /// Create allocator over `size` units.
    pub fn new(size: u32) -> Self {
        Self::with_max_allocs(size, DEFAULT_MAX_ALLOCS)
    }

    /// Create allocator over `size` units that keeps at most `max_allocs` nodes.
    pub fn with_max_allocs(size: u32, max_allocs: u32) -> Self {
        assert!(max_allocs > 0, "Allocator needs at least one node");

        let mut allocator = OffsetAllocator {
            size,
            max_allocs,
            free_storage: 0,
            allocations: 0,
            used_bins_top: 0,
            used_bins: [0; NUM_TOP_BINS],
            bin_indices: vec![None; NUM_LEAF_BINS],
            nodes: Slab::with_capacity(max_allocs.min(1024) as usize),
        };
        allocator.reset();
        allocator
    }

    /// Drop every allocation and start over with one free region.
    pub fn reset(&mut self) {
        self.free_storage = 0;
        self.allocations = 0;
        self.used_bins_top = 0;
        self.used_bins = [0; NUM_TOP_BINS];
        for index in &mut self.bin_indices {
            *index = None;
        }
        self.nodes.clear();

        let size = self.size;
        self.insert_node_into_bin(size, 0);
    }

    /// Total size managed.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Node limit.
    pub fn max_allocs(&self) -> u32 {
        self.max_allocs
    }

    /// Number of live allocations.
    pub fn current_allocs(&self) -> u32 {
        self.allocations
    }

    /// Sum of all free regions.
    pub fn free_storage(&self) -> u32 {
        self.free_storage
    }

    fn out_of_nodes(&self) -> bool {
        self.nodes.len() >= self.max_allocs as usize
    }

    /// Carve a region of `size` units.
    ///
    /// Returns `None` when no free region is large enough
    /// or the node limit is reached.
    pub fn allocate(&mut self, size: u32) -> Option<Allocation> {
        if self.out_of_nodes() {
            return None;
        }

        let min_bin_index = size_class::round_up(size);
        let min_top_bin_index = min_bin_index >> TOP_BINS_INDEX_SHIFT;
        let min_leaf_bin_index = min_bin_index & LEAF_BINS_INDEX_MASK;

        let mut top_bin_index = min_top_bin_index;
        let mut leaf_bin_index = None;

        if self.used_bins_top & (1 << top_bin_index) != 0 {
            leaf_bin_index = find_lowest_set_bit_after(
                u32::from(self.used_bins[top_bin_index as usize]),
                min_leaf_bin_index,
            );
        }

        let leaf_bin_index = match leaf_bin_index {
            Some(leaf) => leaf,
            None => {
                top_bin_index = find_lowest_set_bit_after(self.used_bins_top, min_top_bin_index + 1)?;
                // Any leaf of a larger top bin fits.
                self.used_bins[top_bin_index as usize].trailing_zeros()
            }
        };

        let bin_index = ((top_bin_index << TOP_BINS_INDEX_SHIFT) | leaf_bin_index) as usize;
        let node_index = self.bin_indices[bin_index]?;

        let (offset, node_total_size, neighbor_next, bin_next) = {
            let node = &mut self.nodes[node_index];
            let total = node.size;
            node.size = size;
            node.used = true;
            (node.offset, total, node.neighbor_next, node.bin_next)
        };

        self.bin_indices[bin_index] = bin_next;
        if let Some(next) = bin_next {
            self.nodes[next].bin_prev = None;
        }
        self.free_storage -= node_total_size;

        if bin_next.is_none() {
            self.used_bins[top_bin_index as usize] &= !(1 << leaf_bin_index);
            if self.used_bins[top_bin_index as usize] == 0 {
                self.used_bins_top &= !(1 << top_bin_index);
            }
        }

        let remainder = node_total_size - size;
        if remainder > 0 {
            let new_index = self.insert_node_into_bin(remainder, offset + size);

            if let Some(next) = neighbor_next {
                self.nodes[next].neighbor_prev = Some(new_index);
            }
            self.nodes[new_index].neighbor_prev = Some(node_index);
            self.nodes[new_index].neighbor_next = neighbor_next;
            self.nodes[node_index].neighbor_next = Some(new_index);
        }

        self.allocations += 1;

        Some(Allocation {
            offset,
            node: node_index,
        })
    }

    /// Return region to the free lists, merging it with free neighbors.
    ///
    /// Freeing an allocation twice is a contract violation.
    pub fn free(&mut self, allocation: Allocation) {
        let node_index = allocation.node;
        debug_assert!(
            self.nodes.get(node_index).map_or(false, |node| node.used
                && node.offset == allocation.offset),
            "Allocation {:?} is not live",
            allocation,
        );

        let node = self.nodes[node_index];
        let mut offset = node.offset;
        let mut size = node.size;
        let mut neighbor_prev = node.neighbor_prev;
        let mut neighbor_next = node.neighbor_next;

        if let Some(prev_index) = node.neighbor_prev {
            let prev = self.nodes[prev_index];
            if !prev.used {
                debug_assert_eq!(prev.neighbor_next, Some(node_index));
                offset = prev.offset;
                size += prev.size;
                self.remove_node_from_bin(prev_index);
                neighbor_prev = prev.neighbor_prev;
            }
        }

        if let Some(next_index) = node.neighbor_next {
            let next = self.nodes[next_index];
            if !next.used {
                debug_assert_eq!(next.neighbor_prev, Some(node_index));
                size += next.size;
                self.remove_node_from_bin(next_index);
                neighbor_next = next.neighbor_next;
            }
        }

        self.nodes.remove(node_index);
        self.allocations -= 1;

        let combined = self.insert_node_into_bin(size, offset);
        if let Some(next) = neighbor_next {
            self.nodes[combined].neighbor_next = Some(next);
            self.nodes[next].neighbor_prev = Some(combined);
        }
        if let Some(prev) = neighbor_prev {
            self.nodes[combined].neighbor_prev = Some(prev);
            self.nodes[prev].neighbor_next = Some(combined);
        }
    }

    /// Size of a live allocation, zero if the node is gone.
    pub fn allocation_size(&self, allocation: &Allocation) -> u32 {
        self.nodes
            .get(allocation.node)
            .filter(|node| node.used)
            .map_or(0, |node| node.size)
    }

    /// Free space and largest free region.
    pub fn storage_report(&self) -> StorageReport {
        if self.out_of_nodes() {
            return StorageReport::default();
        }

        let mut largest_free_region = 0;
        if self.used_bins_top != 0 {
            let top_bin_index = 31 - self.used_bins_top.leading_zeros();
            let leaf_bin_index =
                31 - u32::from(self.used_bins[top_bin_index as usize]).leading_zeros();
            largest_free_region = size_class::to_size(
                (top_bin_index << TOP_BINS_INDEX_SHIFT) | leaf_bin_index,
            );
            debug_assert!(self.free_storage >= largest_free_region);
        }

        StorageReport {
            total_free_space: self.free_storage,
            largest_free_region,
        }
    }

    /// Count of free regions filed under every bin.
    pub fn storage_report_full(&self) -> StorageReportFull {
        let free_regions = self
            .bin_indices
            .iter()
            .enumerate()
            .map(|(bin, &head)| {
                let mut count = 0;
                let mut cursor = head;
                while let Some(index) = cursor {
                    count += 1;
                    cursor = self.nodes[index].bin_next;
                }
                StorageRegion {
                    size: size_class::to_size(bin as u32),
                    count,
                }
            })
            .collect();

        StorageReportFull { free_regions }
    }

    /// Walk every structure and verify the bookkeeping agrees.
    pub fn check_consistency(&self) -> Result<(), ConsistencyError> {
        let mut free_total = 0u64;
        let mut filed = 0usize;

        for (bin, &head) in self.bin_indices.iter().enumerate() {
            let top = bin >> TOP_BINS_INDEX_SHIFT;
            let leaf = bin & LEAF_BINS_INDEX_MASK as usize;
            let marked = self.used_bins[top] & (1 << leaf) != 0;
            if marked != head.is_some() {
                return Err(ConsistencyError::BinMask { bin });
            }

            let mut prev = None;
            let mut cursor = head;
            while let Some(index) = cursor {
                let node = self
                    .nodes
                    .get(index)
                    .ok_or(ConsistencyError::FreeList { bin })?;
                if node.used
                    || node.bin_prev != prev
                    || size_class::round_down(node.size) as usize != bin
                {
                    return Err(ConsistencyError::FreeList { bin });
                }
                free_total += u64::from(node.size);
                filed += 1;
                if filed > self.nodes.len() {
                    return Err(ConsistencyError::FreeList { bin });
                }
                prev = cursor;
                cursor = node.bin_next;
            }
        }

        for top in 0..NUM_TOP_BINS {
            if (self.used_bins_top & (1 << top) != 0) != (self.used_bins[top] != 0) {
                return Err(ConsistencyError::BinMask {
                    bin: top * BINS_PER_LEAF,
                });
            }
        }

        if free_total != u64::from(self.free_storage) {
            return Err(ConsistencyError::FreeStorage {
                counted: free_total,
                recorded: u64::from(self.free_storage),
            });
        }

        let mut cursor = self
            .nodes
            .iter()
            .find(|(_, node)| node.neighbor_prev.is_none())
            .map(|(index, _)| index);
        let mut expected_offset = 0u64;
        let mut visited = 0usize;
        let mut used = 0u32;
        let mut prev: Option<usize> = None;

        while let Some(index) = cursor {
            let node = &self.nodes[index];
            if u64::from(node.offset) != expected_offset || node.neighbor_prev != prev {
                return Err(ConsistencyError::Gap {
                    offset: u64::from(node.offset),
                    expected: expected_offset,
                });
            }
            if let Some(prev) = prev {
                if !node.used && !self.nodes[prev].used {
                    return Err(ConsistencyError::Uncoalesced {
                        offset: u64::from(node.offset),
                    });
                }
            }
            if node.used {
                used += 1;
            }

            expected_offset += u64::from(node.size);
            visited += 1;
            if visited > self.nodes.len() {
                break;
            }
            prev = cursor;
            cursor = node.neighbor_next;
        }

        if expected_offset != u64::from(self.size) {
            return Err(ConsistencyError::Coverage {
                covered: expected_offset,
                size: u64::from(self.size),
            });
        }
        if visited != self.nodes.len() || used != self.allocations {
            return Err(ConsistencyError::Unreachable {
                count: self.nodes.len().saturating_sub(visited),
            });
        }

        Ok(())
    }

    fn insert_node_into_bin(&mut self, size: u32, offset: u32) -> usize {
        let bin_index = size_class::round_down(size);
        let top_bin_index = (bin_index >> TOP_BINS_INDEX_SHIFT) as usize;
        let leaf_bin_index = bin_index & LEAF_BINS_INDEX_MASK;

        let head = self.bin_indices[bin_index as usize];
        if head.is_none() {
            self.used_bins[top_bin_index] |= 1 << leaf_bin_index;
            self.used_bins_top |= 1 << top_bin_index;
        }

        let index = self.nodes.insert(Node {
            offset,
            size,
            bin_prev: None,
            bin_next: head,
            neighbor_prev: None,
            neighbor_next: None,
            used: false,
        });

        if let Some(head) = head {
            self.nodes[head].bin_prev = Some(index);
        }
        self.bin_indices[bin_index as usize] = Some(index);
        self.free_storage += size;

        index
    }

    fn remove_node_from_bin(&mut self, index: usize) {
        let node = self.nodes.remove(index);

        if let Some(prev) = node.bin_prev {
            self.nodes[prev].bin_next = node.bin_next;
            if let Some(next) = node.bin_next {
                self.nodes[next].bin_prev = Some(prev);
            }
        } else {
            let bin_index = size_class::round_down(node.size);
            let top_bin_index = (bin_index >> TOP_BINS_INDEX_SHIFT) as usize;
            let leaf_bin_index = bin_index & LEAF_BINS_INDEX_MASK;

            self.bin_indices[bin_index as usize] = node.bin_next;
            match node.bin_next {
                Some(next) => self.nodes[next].bin_prev = None,
                None => {
                    self.used_bins[top_bin_index] &= !(1 << leaf_bin_index);
                    if self.used_bins[top_bin_index] == 0 {
                        self.used_bins_top &= !(1 << top_bin_index);
                    }
                }
            }
        }

        self.free_storage -= node.size;
    }
}
