#![no_main]
use libfuzzer_sys::fuzz_target;
use zonemalloc_core::{SystemPages, Zone, ZoneFlags};

const SLOTS: usize = 32;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one op: [opcode, slot, size_lo, size_hi].
    let flags = match data.first() {
        Some(b) if b & 1 == 1 => ZoneFlags::DO_SCRIBBLE,
        _ => ZoneFlags::NONE,
    };
    let Some(zone) = Zone::create(SystemPages::global(), flags) else {
        return;
    };
    let mut slots: [(*mut u8, usize); SLOTS] = [(std::ptr::null_mut(), 0); SLOTS];

    for chunk in data.chunks_exact(4) {
        let slot = chunk[1] as usize % SLOTS;
        let size = u16::from_le_bytes([chunk[2], chunk[3]]) as usize * 4;
        let (ptr, len) = slots[slot];
        match chunk[0] % 6 {
            0 if ptr.is_null() => {
                let p = zone.allocate(size);
                assert!(!p.is_null());
                unsafe { p.write_bytes(chunk[1], size) };
                slots[slot] = (p, size);
            }
            1 if ptr.is_null() => {
                let p = zone.allocate_zeroed(1, size);
                assert!(unsafe { std::slice::from_raw_parts(p, size) }.iter().all(|&b| b == 0));
                slots[slot] = (p, size);
            }
            2 if !ptr.is_null() => {
                let p = unsafe { zone.resize(ptr, size) };
                assert!(!p.is_null());
                let len = len.max(size);
                assert!(zone.size(p) >= len);
                slots[slot] = (p, len);
            }
            3 if !ptr.is_null() => {
                unsafe { zone.free(ptr) };
                slots[slot] = (std::ptr::null_mut(), 0);
            }
            4 => {
                let mut out = [std::ptr::null_mut(); 8];
                let got = zone.batch_allocate(size % 992 + 1, &mut out);
                unsafe { zone.batch_free(&mut out[..got]) };
            }
            5 => assert!(zone.check()),
            _ => {}
        }
    }

    assert!(zone.check());
    for (ptr, _) in slots {
        if !ptr.is_null() {
            unsafe { zone.free(ptr) };
        }
    }
    assert_eq!(zone.statistics().blocks_in_use, 0);
    unsafe { zone.destroy() };
});
