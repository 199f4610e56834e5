use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use zonemalloc_core::small::{LARGE_THRESHOLD, SMALL_QUANTUM};
use zonemalloc_core::tiny::{TINY_LIMIT, TINY_QUANTUM};
use zonemalloc_core::{CorruptionKind, GuardPages, PageProvider, SystemPages, Zone, ZoneError, ZoneFlags};

/// System pages plus counters for maps and live bytes.
struct CountingPages {
    maps: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl CountingPages {
    fn leak() -> &'static Self {
        Box::leak(Box::new(Self {
            maps: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }))
    }

    fn maps(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }
}

impl PageProvider for CountingPages {
    fn page_size(&self) -> usize {
        SystemPages::global().page_size()
    }

    fn allocate(&self, size: usize, align: usize, guard: GuardPages) -> Option<NonNull<u8>> {
        let p = SystemPages::global().allocate(size, align, guard)?;
        self.maps.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(size, Ordering::SeqCst);
        Some(p)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, guard: GuardPages) {
        self.live_bytes.fetch_sub(size, Ordering::SeqCst);
        unsafe { SystemPages::global().deallocate(ptr, size, guard) };
    }

    unsafe fn extend_in_place(&self, end: NonNull<u8>, additional: usize) -> bool {
        let grown = unsafe { SystemPages::global().extend_in_place(end, additional) };
        if grown {
            self.live_bytes.fetch_add(additional, Ordering::SeqCst);
        }
        grown
    }
}

fn counting_zone(flags: ZoneFlags) -> (&'static Zone, &'static CountingPages) {
    let pages = CountingPages::leak();
    (Zone::create(pages, flags).expect("zone"), pages)
}

fn fill(p: *mut u8, len: usize, byte: u8) {
    unsafe { std::ptr::write_bytes(p, byte, len) };
}

fn bytes<'a>(p: *const u8, len: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(p, len) }
}

#[test]
fn tiny_blocks_are_quantum_aligned_and_last_free_is_reused() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    for size in (0..=TINY_LIMIT).step_by(7) {
        let p = zone.allocate(size);
        assert!(!p.is_null());
        assert_eq!(p as usize % TINY_QUANTUM, 0, "size {size}");
        unsafe { zone.free(p) };
        let q = zone.allocate(size);
        assert_eq!(q, p, "size {size} did not reuse the last freed block");
        unsafe { zone.free(q) };
    }
    assert!(zone.check());
    unsafe { zone.destroy() };
}

#[test]
fn free_leaves_check_passing_for_every_class() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    let page = zone.page_size();
    let mut sizes = vec![
        0,
        1,
        100,
        TINY_LIMIT,
        TINY_LIMIT + 1,
        5000,
        LARGE_THRESHOLD - 1,
        LARGE_THRESHOLD,
        1 << 20,
    ];
    if page <= 16 * 1024 {
        sizes.push(page * page);
    }
    for size in sizes {
        let p = zone.allocate(size);
        assert!(!p.is_null(), "size {size}");
        assert!(zone.size(p) >= size);
        assert!(zone.check(), "after allocate({size})");
        unsafe { zone.free(p) };
        assert!(zone.check(), "after free of {size}");
    }
    assert_eq!(zone.statistics().blocks_in_use, 0);
    assert_eq!(zone.last_error(), None);
    unsafe { zone.destroy() };
}

#[test]
fn adjacent_frees_coalesce_without_a_new_region() {
    let (zone, pages) = counting_zone(ZoneFlags::NONE);
    let a = zone.allocate(2 * SMALL_QUANTUM);
    let b = zone.allocate(2 * SMALL_QUANTUM);
    let fence = zone.allocate(2 * SMALL_QUANTUM);
    assert_eq!(b as usize, a as usize + 2 * SMALL_QUANTUM);
    unsafe {
        zone.free(a);
        zone.free(b);
    }
    let maps = pages.maps();
    let joined = zone.allocate(4 * SMALL_QUANTUM);
    assert_eq!(joined, a);
    assert_eq!(pages.maps(), maps);
    assert!(zone.check());
    unsafe {
        zone.free(joined);
        zone.free(fence);
        zone.destroy();
    }
}

#[test]
fn zeroed_allocation_clears_recycled_blocks() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);

    let tiny = zone.allocate(100);
    fill(tiny, 100, 0xAB);
    unsafe { zone.free(tiny) };
    let again = zone.allocate_zeroed(4, 25);
    assert_eq!(again, tiny);
    assert!(bytes(again, zone.size(again)).iter().all(|&b| b == 0));

    let small = zone.allocate(3000);
    let fence = zone.allocate(3000);
    fill(small, 3000, 0xCD);
    unsafe { zone.free(small) };
    let recycled = zone.allocate_zeroed(3, 1000);
    assert_eq!(recycled, small);
    assert!(bytes(recycled, 3000).iter().all(|&b| b == 0));

    let large = zone.allocate_zeroed(1, 100_000);
    assert!(bytes(large, 100_000).iter().all(|&b| b == 0));

    assert!(zone.allocate_zeroed(usize::MAX, 2).is_null());
    let empty = zone.allocate_zeroed(0, 0);
    assert!(!empty.is_null());

    unsafe {
        zone.free(again);
        zone.free(empty);
        zone.free(recycled);
        zone.free(fence);
        zone.free(large);
        zone.destroy();
    }
}

#[test]
fn resize_grows_in_place_when_the_neighbour_is_free() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);

    let a = zone.allocate(1024);
    let b = zone.allocate(1024);
    let fence = zone.allocate(1024);
    unsafe { zone.free(b) };
    let grown = unsafe { zone.resize(a, 2048) };
    assert_eq!(grown, a);
    assert_eq!(zone.size(grown), 2048);

    // Growing into the untouched tail also stays put.
    let tail_block = zone.allocate(64);
    let bigger = unsafe { zone.resize(tail_block, 256) };
    assert_eq!(bigger, tail_block);

    // Shrinking never moves.
    assert_eq!(unsafe { zone.resize(grown, 10) }, grown);

    assert!(zone.check());
    unsafe {
        zone.free(grown);
        zone.free(fence);
        zone.free(bigger);
        zone.destroy();
    }
}

#[test]
fn resize_moves_and_preserves_bytes_when_blocked() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    for (old, new) in [(64, 200), (1024, 4096), (TINY_LIMIT, 10_000), (20_000, 200_000)] {
        let p = zone.allocate(old);
        let blocker = zone.allocate(old);
        for i in 0..old {
            unsafe { p.add(i).write((i % 251) as u8) };
        }
        let q = unsafe { zone.resize(p, new) };
        assert!(!q.is_null());
        if old < LARGE_THRESHOLD {
            assert_ne!(q, p, "{old} -> {new} should have moved");
        }
        assert!(zone.size(q) >= new);
        for i in 0..old {
            assert_eq!(unsafe { q.add(i).read() }, (i % 251) as u8, "{old} -> {new} byte {i}");
        }
        unsafe {
            zone.free(q);
            zone.free(blocker);
        }
    }
    assert!(zone.check());
    assert_eq!(zone.statistics().blocks_in_use, 0);
    unsafe { zone.destroy() };
}

#[test]
fn double_free_is_reported_not_fatal() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);

    let tiny = zone.allocate(64);
    unsafe {
        zone.free(tiny);
        zone.free(tiny);
    }
    assert_eq!(
        zone.last_error(),
        Some(ZoneError::CorruptionDetected {
            kind: CorruptionKind::DoubleFree,
            ptr: tiny as usize
        })
    );

    let small = zone.allocate(5000);
    unsafe {
        zone.free(small);
        zone.free(small);
    }
    assert_eq!(
        zone.last_error(),
        Some(ZoneError::CorruptionDetected {
            kind: CorruptionKind::DoubleFree,
            ptr: small as usize
        })
    );

    assert_eq!(zone.statistics().errors, 2);
    assert!(zone.check());
    let after = zone.allocate(64);
    assert!(!after.is_null());
    unsafe {
        zone.free(after);
        zone.destroy();
    }
}

#[test]
fn double_free_after_coalescing_is_still_a_double_free() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    let double_free = |p: *mut u8| {
        Some(ZoneError::CorruptionDetected {
            kind: CorruptionKind::DoubleFree,
            ptr: p as usize,
        })
    };

    // p[1] merges into p[0] once p[2] evicts it from the last-free cache.
    let p: Vec<_> = (0..4).map(|_| zone.allocate(64)).collect();
    unsafe {
        zone.free(p[0]);
        zone.free(p[1]);
        zone.free(p[2]);
        zone.free(p[1]);
    }
    assert_eq!(zone.last_error(), double_free(p[1]));

    let s: Vec<_> = (0..4).map(|_| zone.allocate(2000)).collect();
    unsafe {
        zone.free(s[0]);
        zone.free(s[1]);
        zone.free(s[1]);
    }
    assert_eq!(zone.last_error(), double_free(s[1]));

    assert_eq!(zone.statistics().errors, 2);
    assert!(zone.check());
    unsafe {
        zone.free(p[3]);
        zone.free(s[2]);
        zone.free(s[3]);
        zone.destroy();
    }
}

#[test]
fn batch_free_reports_a_failed_release_once() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    let blocks: Vec<_> = (0..6).map(|_| zone.allocate(64)).collect();
    let (b, c, e) = (blocks[1], blocks[2], blocks[4]);
    unsafe {
        zone.free(c);
        // Evicts `c` from the last-free cache onto a free list.
        zone.free(e);
        // Stomp the checksum of the listed neighbour of `b`.
        c.cast::<usize>().write(0);
    }

    let mut batch = [b];
    unsafe { zone.batch_free(&mut batch) };
    assert!(batch[0].is_null());
    assert_eq!(zone.statistics().errors, 1);
    assert_eq!(
        zone.last_error(),
        Some(ZoneError::CorruptionDetected {
            kind: CorruptionKind::BadChecksum,
            ptr: c as usize
        })
    );
    unsafe { zone.destroy() };
}

#[test]
fn batch_allocate_respects_the_output_bound() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    assert_eq!(zone.batch_allocate(64, &mut []), 0);

    // Populate the exact-size list with blocks kept apart by fences.
    let mut fences = Vec::new();
    let mut blocks = Vec::new();
    for _ in 0..40 {
        blocks.push(zone.allocate(64));
        fences.push(zone.allocate(64));
    }
    for p in blocks {
        unsafe { zone.free(p) };
    }

    let mut out = [std::ptr::null_mut(); 10];
    let n = zone.batch_allocate(64, &mut out);
    assert!(n <= out.len());
    assert_eq!(n, 10);

    let mut more = [std::ptr::null_mut(); 100];
    let m = zone.batch_allocate(64, &mut more);
    assert!(m <= more.len());
    assert!(more[m..].iter().all(|p| p.is_null()));

    for &p in out[..n].iter().chain(&more[..m]) {
        assert_eq!(zone.size(p), 64);
        unsafe { zone.free(p) };
    }
    assert_eq!(zone.last_error(), None);
    assert_eq!(zone.batch_allocate(TINY_LIMIT + 1, &mut out), 0);

    unsafe { zone.batch_free(&mut fences) };
    assert!(fences.iter().all(|p| p.is_null()));
    assert_eq!(zone.statistics().blocks_in_use, 0);
    assert!(zone.check());
    unsafe { zone.destroy() };
}

#[test]
fn batch_free_handles_mixed_classes() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    let mut ptrs = vec![
        zone.allocate(32),
        std::ptr::null_mut(),
        zone.allocate(4000),
        zone.allocate(500),
        zone.allocate(64 * 1024),
    ];
    unsafe { zone.batch_free(&mut ptrs) };
    assert!(ptrs.iter().all(|p| p.is_null()));
    assert_eq!(zone.statistics().blocks_in_use, 0);
    assert_eq!(zone.last_error(), None);
    unsafe { zone.destroy() };
}

#[test]
fn huge_blocks_are_page_aligned_and_sized() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    let page = zone.page_size();
    if page > 16 * 1024 {
        return;
    }
    let size = page * page;
    let p = zone.allocate(size + 1);
    assert_eq!(p as usize % page, 0);
    assert_eq!(zone.size(p), size + page);
    let stats = zone.statistics();
    assert_eq!(stats.huge.blocks_in_use, 1);
    assert_eq!(stats.huge.size_in_use, size + page);

    let pages = zone.allocate_pages(3 * page + 1);
    assert_eq!(pages as usize % page, 0);
    assert_eq!(zone.size(pages), 4 * page);

    unsafe {
        zone.free(p);
        zone.free(pages);
    }
    assert_eq!(zone.statistics().huge.blocks_in_use, 0);
    assert!(zone.check());
    unsafe { zone.destroy() };
}

#[test]
fn aligned_allocation_honours_alignment() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    let page = zone.page_size();
    let mut live = Vec::new();
    for align in [8, 16, TINY_QUANTUM, 64, 256, SMALL_QUANTUM, page] {
        for size in [1, 700, 5000, 40_000] {
            let p = zone.allocate_aligned(size, align);
            assert!(!p.is_null(), "size {size} align {align}");
            assert_eq!(p as usize % align, 0, "size {size} align {align}");
            assert!(zone.size(p) >= size);
            live.push(p);
        }
    }
    assert!(zone.allocate_aligned(64, 48).is_null());
    assert!(zone.allocate_aligned(64, 2 * page).is_null());
    for p in live {
        unsafe { zone.free(p) };
    }
    assert!(zone.check());
    unsafe { zone.destroy() };
}

#[test]
fn region_tables_grow_without_moving_blocks() {
    let (zone, pages) = counting_zone(ZoneFlags::NONE);

    let mut tiny = Vec::new();
    while zone.statistics().tiny_regions <= 16 {
        let p = zone.allocate(TINY_LIMIT);
        assert!(!p.is_null());
        unsafe { p.cast::<usize>().write(tiny.len()) };
        tiny.push(p);
    }
    let mut small = Vec::new();
    while zone.statistics().small_regions <= 4 {
        let p = zone.allocate(LARGE_THRESHOLD - 1);
        assert!(!p.is_null());
        unsafe { p.cast::<usize>().write(small.len()) };
        small.push(p);
    }

    for (i, &p) in tiny.iter().enumerate() {
        assert_eq!(zone.size(p), TINY_LIMIT);
        assert_eq!(unsafe { p.cast::<usize>().read() }, i);
    }
    for (i, &p) in small.iter().enumerate() {
        assert_eq!(zone.size(p), 30 * SMALL_QUANTUM);
        assert_eq!(unsafe { p.cast::<usize>().read() }, i);
    }
    assert!(zone.check());

    // The spilled arrays belong to the zone, not to the caller.
    let published = zone.published();
    let arrays: Vec<_> = published
        .tiny_regions
        .array_blocks()
        .chain(published.small_regions.array_blocks())
        .collect();
    assert_eq!(arrays.len(), 2);
    for &array in &arrays {
        unsafe { zone.free(array as *mut u8) };
        assert_eq!(zone.last_error(), Some(ZoneError::Misuse { ptr: array }));
    }
    assert_eq!(zone.statistics().errors, arrays.len());
    assert!(zone.check());

    for p in tiny.into_iter().chain(small) {
        unsafe { zone.free(p) };
    }
    assert!(zone.check());
    assert_eq!(zone.statistics().blocks_in_use, 0);

    unsafe { zone.destroy() };
    assert_eq!(pages.live_bytes(), 0);
}

#[test]
fn superseded_region_arrays_stay_zone_owned() {
    let (zone, pages) = counting_zone(ZoneFlags::NONE);
    let mut tiny = Vec::new();
    while zone.statistics().tiny_regions <= 32 {
        let p = zone.allocate(TINY_LIMIT);
        assert!(!p.is_null());
        tiny.push(p);
    }

    let arrays: Vec<_> = zone.published().tiny_regions.array_blocks().collect();
    assert_eq!(arrays.len(), 2);
    let before = zone.statistics();
    for &array in &arrays {
        unsafe { zone.free(array as *mut u8) };
        assert_eq!(zone.last_error(), Some(ZoneError::Misuse { ptr: array }));
    }
    let after = zone.statistics();
    assert_eq!(after.blocks_in_use, before.blocks_in_use);
    assert_eq!(after.errors, arrays.len());
    assert!(zone.check());

    let mut batch = arrays.iter().map(|&a| a as *mut u8).collect::<Vec<_>>();
    unsafe { zone.batch_free(&mut batch) };
    assert_eq!(zone.statistics().blocks_in_use, before.blocks_in_use);
    assert!(zone.check());

    for p in tiny {
        unsafe { zone.free(p) };
    }
    unsafe { zone.destroy() };
    assert_eq!(pages.live_bytes(), 0);
}

#[test]
fn destroy_returns_every_page() {
    let (zone, pages) = counting_zone(ZoneFlags::ADD_GUARD_PAGES);
    let mut live = Vec::new();
    for i in 0..300 {
        live.push(zone.allocate(16 * 1024 + i * 1024));
    }
    for i in 0..300 {
        live.push(zone.allocate(i * 13));
    }
    assert!(zone.check());
    assert!(pages.live_bytes() > 0);
    unsafe { zone.destroy() };
    assert_eq!(pages.live_bytes(), 0);
}

#[test]
fn scribble_overwrites_freed_memory() {
    let (zone, _) = counting_zone(ZoneFlags::DO_SCRIBBLE);
    let p = zone.allocate(2000);
    let fence = zone.allocate(2000);
    fill(p, 2000, 0);
    unsafe { zone.free(p) };
    // The free-list node and trailing size sit at the two ends.
    assert!(bytes(p, 2000)[64..1900].iter().all(|&b| b == 0x55));
    unsafe {
        zone.free(fence);
        zone.destroy();
    }
}

#[test]
fn foreign_and_interior_pointers_are_misuse() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    let p = zone.allocate(5000);
    let interior = unsafe { p.add(SMALL_QUANTUM) };
    unsafe { zone.free(interior) };
    assert_eq!(zone.last_error(), Some(ZoneError::Misuse { ptr: interior as usize }));
    assert_eq!(zone.size(interior), 0);
    assert_eq!(zone.size(p), zone.best_size(5000));

    let mut on_stack = [0u8; 64];
    unsafe { zone.free(on_stack.as_mut_ptr()) };
    assert_eq!(zone.statistics().errors, 2);
    unsafe {
        zone.free(p);
        zone.destroy();
    }
}

#[test]
fn log_address_records_operations_on_that_block() {
    let (zone, _) = counting_zone(ZoneFlags::NONE);
    let p = zone.allocate(3000);
    zone.set_log_address(Some(p as usize));
    let q = unsafe { zone.resize(p, 6000) };
    unsafe { zone.free(q) };
    let mut events = [zonemalloc_core::ZoneLogRecord::EMPTY; 16];
    let n = zone.recent_events(&mut events);
    assert!(
        events[..n]
            .iter()
            .any(|e| e.event == "watched_address" && e.symbol == "resize" && e.ptr == Some(p as usize))
    );
    zone.set_log_address(None);
    unsafe { zone.destroy() };
}
