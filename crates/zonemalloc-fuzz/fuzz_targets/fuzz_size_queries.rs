#![no_main]
use libfuzzer_sys::fuzz_target;
use zonemalloc_core::{SystemPages, Zone, ZoneFlags};

fuzz_target!(|data: &[u8]| {
    // Queries at arbitrary offsets around live blocks must never crash
    // and only report sizes for block starts.
    let Some(zone) = Zone::create(SystemPages::global(), ZoneFlags::NONE) else {
        return;
    };
    let blocks: Vec<_> = [40usize, 700, 5000, 20_000]
        .iter()
        .map(|&n| zone.allocate(n))
        .collect();

    for chunk in data.chunks_exact(3) {
        let base = blocks[chunk[0] as usize % blocks.len()] as usize;
        let offset = i16::from_le_bytes([chunk[1], chunk[2]]) as isize;
        let addr = base.wrapping_add_signed(offset);
        let size = zone.size(addr as *const u8);
        if size != 0 {
            assert!(blocks.contains(&(addr as *mut u8)) || zone.check());
        }
        let _ = zone.best_size(addr);
    }

    for p in blocks {
        unsafe { zone.free(p) };
    }
    unsafe { zone.destroy() };
});
