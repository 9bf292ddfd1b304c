use {
    super::{MockDevice, MockTimeline},
    crate::{
        device::Device,
        error::{HeapError, OutOfMemoryError},
        heap::{Heap, HeapAlloc, HeapAllocDesc, HeapCachingConfig, HeapDesc, PageState},
        PageId,
        usage::MemoryType,
        utilization::HeapReport,
    },
    rand::Rng,
};

const MIB: u64 = 1024 * 1024;

fn heap_with(desc: HeapDesc) -> Heap<MockDevice, MockTimeline> {
    Heap::new(MockDevice::new(), MockTimeline::new(), desc)
}

fn caching(enabled: bool) -> HeapDesc {
    HeapDesc {
        label: "Test Heap".into(),
        caching: HeapCachingConfig {
            enabled,
            ..HeapCachingConfig::default()
        },
        ..HeapDesc::default()
    }
}

fn alloc_desc(size: u64) -> HeapAllocDesc {
    HeapAllocDesc {
        size,
        alignment: 128,
    }
}

fn counts(report: &HeapReport) -> (u64, u64, u64, u64) {
    (
        report.total_allocated,
        report.num_allocations,
        report.total_mem_usage,
        report.num_pages,
    )
}

#[test]
fn allocate_free_and_remove_empty_pages() {
    let heap = heap_with(caching(true));

    let a = heap.allocate(alloc_desc(MIB)).unwrap();
    assert_eq!(a.offset(), 0);
    assert_eq!(a.size(), MIB);
    assert_eq!(counts(&heap.report()), (MIB, 1, 8 * MIB, 1));

    let page = a.page_id();
    heap.free(a);
    assert_eq!(counts(&heap.report()), (0, 0, 8 * MIB, 1));
    assert_eq!(heap.page_state(page), Some(PageState::Cached));

    heap.remove_empty_pages();
    assert_eq!(counts(&heap.report()), (0, 0, 0, 0));
    assert_eq!(heap.page_state(page), Some(PageState::Released));
    assert_eq!(heap.device().live(), 0);
}

#[test]
fn free_waits_for_gpu() {
    let heap = heap_with(caching(true));

    let a = heap.allocate(alloc_desc(MIB)).unwrap();
    let value = heap.timeline().submit();
    heap.free(a);
    assert_eq!(heap.pending_frees(), 1);

    // Region is still in flight and must not be handed out again.
    let b = heap.allocate(alloc_desc(MIB)).unwrap();
    assert_eq!(b.offset(), MIB);
    assert_eq!(counts(&heap.report()), (2 * MIB, 2, 8 * MIB, 1));

    heap.flush();
    assert_eq!(heap.pending_frees(), 1);

    heap.timeline().signal(value);
    heap.flush();
    assert_eq!(heap.pending_frees(), 0);
    assert_eq!(counts(&heap.report()), (MIB, 1, 8 * MIB, 1));

    let c = heap.allocate(alloc_desc(MIB)).unwrap();
    assert_eq!(c.offset(), 0);

    heap.free(b);
    heap.free(c);
    heap.timeline().wait_idle();
    heap.check_consistency();
    assert_eq!(heap.report().total_allocated, 0);
}

#[test]
fn frees_reclaim_in_completion_order() {
    let heap = heap_with(caching(true));

    let a = heap.allocate(alloc_desc(MIB)).unwrap();
    let b = heap.allocate(alloc_desc(MIB)).unwrap();

    let first = heap.timeline().submit();
    heap.free(a);
    heap.timeline().submit();
    heap.free(b);
    assert_eq!(heap.pending_frees(), 2);

    heap.timeline().signal(first);
    heap.flush();
    assert_eq!(heap.pending_frees(), 1);
    assert_eq!(heap.report().num_allocations, 1);

    heap.timeline().wait_idle();
    // `report` reclaims completed frees on its own.
    assert_eq!(heap.report().num_allocations, 0);
    assert_eq!(heap.pending_frees(), 0);
}

#[test]
fn allocate_reclaims_completed_frees() {
    let heap = heap_with(caching(true));

    let a = heap.allocate(alloc_desc(4 * MIB)).unwrap();
    heap.timeline().submit();
    heap.free(a);
    heap.timeline().wait_idle();

    let b = heap.allocate(alloc_desc(4 * MIB)).unwrap();
    assert_eq!(b.offset(), 0);
    assert_eq!(heap.pending_frees(), 0);
    heap.free(b);
}

#[test]
fn in_order_timeline_reuses_immediately() {
    let heap = heap_with(caching(true));
    heap.timeline().set_in_order(true);

    let a = heap.allocate(alloc_desc(MIB)).unwrap();
    let offset = a.offset();
    heap.timeline().submit();
    heap.free(a);
    assert_eq!(heap.pending_frees(), 0);

    let b = heap.allocate(alloc_desc(MIB)).unwrap();
    assert_eq!(b.offset(), offset);
    heap.free(b);
}

fn upload_heap() -> Heap<MockDevice, MockTimeline> {
    heap_with(HeapDesc {
        memory_type: MemoryType::Upload,
        ..caching(true)
    })
}

fn fill(heap: &Heap<MockDevice, MockTimeline>, alloc: &HeapAlloc, byte: u8) {
    heap.with_raw_memory(alloc.page_id(), |memory| unsafe {
        let range = alloc.offset()..alloc.offset() + alloc.size();
        let ptr = heap.device().map(memory, range).unwrap();
        std::ptr::write_bytes(ptr.as_ptr(), byte, alloc.size() as usize);
        heap.device().unmap(memory);
    })
    .unwrap();
}

fn contents(
    heap: &Heap<MockDevice, MockTimeline>,
    page_id: PageId,
    offset: u64,
    size: u64,
) -> Vec<u8> {
    heap.with_raw_memory(page_id, |memory| unsafe {
        let ptr = heap.device().map(memory, offset..offset + size).unwrap();
        let bytes = std::slice::from_raw_parts(ptr.as_ptr(), size as usize).to_vec();
        heap.device().unmap(memory);
        bytes
    })
    .unwrap()
}

#[test]
fn reused_region_holds_new_contents() {
    let heap = upload_heap();
    heap.timeline().set_in_order(true);

    let a = heap.allocate(alloc_desc(64 * 1024)).unwrap();
    fill(&heap, &a, 0xAA);
    let (page, offset) = (a.page_id(), a.offset());
    heap.timeline().submit();
    heap.free(a);

    let b = heap.allocate(alloc_desc(64 * 1024)).unwrap();
    assert_eq!((b.page_id(), b.offset()), (page, offset));
    fill(&heap, &b, 0xBB);
    assert!(contents(&heap, page, offset, b.size())
        .iter()
        .all(|&byte| byte == 0xBB));
    heap.free(b);
}

#[test]
fn in_flight_region_keeps_its_contents() {
    let heap = upload_heap();

    let a = heap.allocate(alloc_desc(64 * 1024)).unwrap();
    fill(&heap, &a, 0xAA);
    let (page, offset, size) = (a.page_id(), a.offset(), a.size());
    heap.timeline().submit();
    heap.free(a);

    // GPU may still read the first region, new writes must land elsewhere.
    let b = heap.allocate(alloc_desc(64 * 1024)).unwrap();
    fill(&heap, &b, 0xBB);
    assert!(contents(&heap, page, offset, size)
        .iter()
        .all(|&byte| byte == 0xAA));

    heap.timeline().wait_idle();
    heap.free(b);
    assert_eq!(heap.report().total_allocated, 0);
}

#[test]
fn raw_memory_of_unknown_page() {
    let heap = upload_heap();
    assert_eq!(
        heap.with_raw_memory(42, |_| ()),
        Err(HeapError::UnknownPage(42))
    );

    let a = heap.allocate(alloc_desc(1024)).unwrap();
    let id = heap.with_raw_memory(a.page_id(), |memory| memory.id()).unwrap();
    assert_eq!(id, 1);
    heap.free(a);
}

#[test]
fn caching_disabled_releases_pages() {
    let heap = heap_with(caching(false));

    let a = heap.allocate(alloc_desc(MIB)).unwrap();
    assert_eq!(heap.report().num_pages, 1);

    heap.free(a);
    assert_eq!(counts(&heap.report()), (0, 0, 0, 0));
    assert_eq!(heap.device().live(), 0);

    let b = heap.allocate(alloc_desc(MIB)).unwrap();
    heap.timeline().submit();
    heap.free(b);
    assert_eq!(heap.report().num_pages, 1);
    heap.timeline().wait_idle();
    heap.flush();
    assert_eq!(heap.report().num_pages, 0);
}

#[test]
fn cached_page_is_reused() {
    let heap = heap_with(caching(true));

    let a = heap.allocate(alloc_desc(MIB)).unwrap();
    let page = a.page_id();
    heap.free(a);

    let b = heap.allocate(alloc_desc(2 * 1024)).unwrap();
    assert_eq!(b.page_id(), page);
    assert_eq!(heap.page_state(page), Some(PageState::Active));
    assert_eq!(heap.device().allocations(), 1);
    heap.free(b);
}

#[test]
fn full_page_spills_into_new_page() {
    let heap = heap_with(caching(true));

    let allocs: Vec<_> = (0..9)
        .map(|_| heap.allocate(alloc_desc(MIB)).unwrap())
        .collect();

    assert!(allocs[..8].iter().all(|a| a.page_id() == allocs[0].page_id()));
    assert_ne!(allocs[8].page_id(), allocs[0].page_id());
    assert_eq!(counts(&heap.report()), (9 * MIB, 9, 16 * MIB, 2));

    for a in allocs {
        heap.free(a);
    }
    assert_eq!(counts(&heap.report()), (0, 0, 16 * MIB, 2));
    heap.check_consistency();
}

#[test]
fn page_tiers_and_dedicated_pages() {
    let heap = heap_with(caching(true));

    let medium = heap.allocate(alloc_desc(2 * MIB)).unwrap();
    let large = heap.allocate(alloc_desc(32 * MIB)).unwrap();
    let huge = heap.allocate(alloc_desc(300 * MIB + 5)).unwrap();

    assert_eq!(huge.size(), 300 * MIB + 128);
    let report = heap.report();
    assert_eq!(report.num_pages, 3);
    // Dedicated page grows to the next allocator bin, 320 MiB.
    assert_eq!(report.total_mem_usage, 64 * MIB + 256 * MIB + 320 * MIB);

    heap.free(medium);
    heap.free(large);
    heap.free(huge);
    heap.remove_empty_pages();
    assert_eq!(heap.report().total_mem_usage, 0);
}

#[test]
fn oversized_requests_always_fit_their_page() {
    let heap = heap_with(caching(true));

    for &size in &[65 * MIB, 257 * MIB, 300 * MIB + 5, 1000 * MIB + 1] {
        let alloc = heap.allocate(alloc_desc(size)).unwrap();
        assert_eq!(alloc.offset(), 0);
        heap.free(alloc);
    }
    heap.check_consistency();

    // Exact bin sizes are not padded.
    let exact = heap.allocate(alloc_desc(512 * MIB)).unwrap();
    heap.free(exact);
    heap.remove_empty_pages();
    let exact = heap.allocate(alloc_desc(512 * MIB)).unwrap();
    assert_eq!(heap.report().total_mem_usage, 512 * MIB);
    heap.free(exact);
}

#[test]
fn alignment_is_checked_and_raised() {
    let heap = heap_with(caching(true));

    assert_eq!(
        heap.allocate(HeapAllocDesc {
            size: 64,
            alignment: 3
        }),
        Err(HeapError::InvalidAlignment(3))
    );
    assert_eq!(
        heap.allocate(HeapAllocDesc {
            size: 64,
            alignment: 0
        }),
        Err(HeapError::InvalidAlignment(0))
    );

    let small = heap
        .allocate(HeapAllocDesc {
            size: 1,
            alignment: 1,
        })
        .unwrap();
    assert_eq!(small.size(), 128);

    let next = heap.allocate(alloc_desc(10)).unwrap();
    assert_eq!(next.offset(), 128);

    // Different alignment gets pages of its own.
    let wide = heap
        .allocate(HeapAllocDesc {
            size: 10,
            alignment: 4096,
        })
        .unwrap();
    assert_eq!(wide.offset() % 4096, 0);
    assert_ne!(wide.page_id(), small.page_id());
    assert_eq!(heap.report().num_pages, 2);

    heap.free(small);
    heap.free(next);
    heap.free(wide);
}

#[test]
fn device_addresses_follow_offsets() {
    let heap = heap_with(caching(true));

    let a = heap.allocate(alloc_desc(1000)).unwrap();
    let b = heap.allocate(alloc_desc(1000)).unwrap();
    let (base_a, base_b) = (a.device_address().unwrap(), b.device_address().unwrap());
    assert_eq!(base_b - base_a, b.offset() - a.offset());

    heap.free(a);
    heap.free(b);
}

#[test]
fn out_of_memory_releases_empty_pages_and_retries() {
    let heap = Heap::new(
        MockDevice::with_budget(64 * MIB),
        MockTimeline::new(),
        caching(true),
    );

    let small = heap.allocate(alloc_desc(MIB)).unwrap();
    heap.free(small);
    assert_eq!(heap.report().num_pages, 1);

    // 64 MiB page only fits once the cached 8 MiB page is gone.
    let medium = heap.allocate(alloc_desc(2 * MIB)).unwrap();
    assert_eq!(counts(&heap.report()), (2 * MIB, 1, 64 * MIB, 1));

    assert_eq!(
        heap.allocate(alloc_desc(MIB)),
        Err(HeapError::OutOfMemory(OutOfMemoryError::OutOfDeviceMemory))
    );

    heap.free(medium);
    heap.device().set_budget(None);
    assert!(heap.allocate(alloc_desc(MIB)).map(|a| heap.free(a)).is_ok());
}

#[test]
fn cache_limits_release_oldest_pages() {
    let heap = heap_with(HeapDesc {
        caching: HeapCachingConfig {
            max_cached_pages: 1,
            ..HeapCachingConfig::default()
        },
        ..HeapDesc::default()
    });

    let allocs: Vec<_> = (0..24)
        .map(|_| heap.allocate(alloc_desc(MIB)).unwrap())
        .collect();
    assert_eq!(heap.report().num_pages, 3);
    let last_page = allocs[23].page_id();

    for a in allocs {
        heap.free(a);
    }

    assert_eq!(heap.report().num_pages, 1);
    assert_eq!(heap.page_state(last_page), Some(PageState::Cached));
}

#[test]
fn cached_memory_limit() {
    let heap = heap_with(HeapDesc {
        caching: HeapCachingConfig {
            max_cached_memory: 8 * MIB,
            ..HeapCachingConfig::default()
        },
        ..HeapDesc::default()
    });

    let small = heap.allocate(alloc_desc(MIB)).unwrap();
    let medium = heap.allocate(alloc_desc(2 * MIB)).unwrap();
    heap.free(small);
    assert_eq!(heap.report().num_pages, 2);

    // 64 MiB cached page is over the limit on its own.
    heap.free(medium);
    assert_eq!(heap.report().num_pages, 0);
}

#[test]
fn garbage_collection_trims_cached_share() {
    let heap = heap_with(HeapDesc {
        caching: HeapCachingConfig {
            enable_garbage_collection: true,
            gc_memory_threshold: 0.5,
            ..HeapCachingConfig::default()
        },
        ..HeapDesc::default()
    });

    let mut allocs: Vec<_> = (0..16)
        .map(|_| heap.allocate(alloc_desc(MIB)).unwrap())
        .collect();
    let second: Vec<_> = allocs.split_off(8);

    for a in second {
        heap.free(a);
    }
    // Half of the memory cached, not over the threshold.
    assert_eq!(heap.report().num_pages, 2);

    for a in allocs {
        heap.free(a);
    }
    assert_eq!(heap.report().num_pages, 0);
}

#[test]
fn random_workload_keeps_pages_bounded() {
    let heap = heap_with(caching(true));
    let mut rng = rand::thread_rng();
    let mut live = Vec::new();

    for i in 0..2000 {
        if live.len() < 32 && (live.is_empty() || rng.gen_bool(0.55)) {
            let size = rng.gen_range(1, 256 * 1024);
            live.push(heap.allocate(alloc_desc(size)).unwrap());
        } else {
            let index = rng.gen_range(0, live.len());
            heap.free(live.swap_remove(index));
        }

        if i % 100 == 0 {
            heap.check_consistency();
            let report = heap.report();
            assert!(report.total_allocated <= report.total_mem_usage);
        }
    }

    assert!(heap.report().num_pages <= 5);
    for a in live {
        heap.free(a);
    }
    assert_eq!(heap.report().total_allocated, 0);
}

#[test]
fn concurrent_allocations_never_overlap() {
    let heap = heap_with(caching(true));

    let mut blocks: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let mut mine = Vec::new();
                    for i in 0..200 {
                        let a = heap.allocate(alloc_desc(64 * 1024)).unwrap();
                        if i % 3 == 0 {
                            heap.free(a);
                        } else {
                            mine.push(a);
                        }
                    }
                    mine
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect()
    });

    blocks.sort_by_key(|a| (a.page_id(), a.offset()));
    for pair in blocks.windows(2) {
        if pair[0].page_id() == pair[1].page_id() {
            assert!(pair[0].offset() + pair[0].size() <= pair[1].offset());
        }
    }
    heap.check_consistency();

    let expected = blocks.len() as u64;
    assert_eq!(heap.report().num_allocations, expected);
    for a in blocks {
        heap.free(a);
    }
    assert_eq!(heap.report().num_allocations, 0);
}

#[test]
fn report_display_uses_label() {
    let heap = heap_with(HeapDesc {
        label: "Readback".into(),
        memory_type: MemoryType::ReadBack,
        ..HeapDesc::default()
    });
    assert!(heap.report().to_string().contains("Readback"));
}
