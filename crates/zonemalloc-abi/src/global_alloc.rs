//! `GlobalAlloc` over the process zone.
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: zonemalloc_abi::ZoneAllocator = zonemalloc_abi::ZoneAllocator;
//! ```

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

use zonemalloc_core::tiny::TINY_QUANTUM;

use crate::zone_state::try_process_zone;

/// Routes Rust allocations to the process zone. Every zone block is at
/// least [`TINY_QUANTUM`] aligned, so only stricter layouts need the
/// aligned path.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZoneAllocator;

unsafe impl GlobalAlloc for ZoneAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(zone) = try_process_zone() else {
            return ptr::null_mut();
        };
        if layout.align() <= TINY_QUANTUM {
            zone.allocate(layout.size())
        } else {
            zone.allocate_aligned(layout.size(), layout.align())
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let Some(zone) = try_process_zone() else {
            return ptr::null_mut();
        };
        if layout.align() <= TINY_QUANTUM {
            return zone.allocate_zeroed(1, layout.size());
        }
        let p = zone.allocate_aligned(layout.size(), layout.align());
        if !p.is_null() {
            // SAFETY: fresh block of at least `layout.size()` bytes.
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(zone) = try_process_zone() {
            // SAFETY: `ptr` came from `alloc` on this allocator.
            unsafe { zone.free(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(zone) = try_process_zone() else {
            return ptr::null_mut();
        };
        if layout.align() <= TINY_QUANTUM {
            // SAFETY: `ptr` is a live block of the process zone.
            return unsafe { zone.resize(ptr, new_size) };
        }
        if new_size <= zone.size(ptr) {
            return ptr;
        }
        // SAFETY: the new layout keeps the old, valid alignment.
        let fresh = unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
        if !fresh.is_null() {
            // SAFETY: both blocks are live and distinct; the old one holds
            // `layout.size()` bytes and the new one at least as many.
            unsafe {
                ptr::copy_nonoverlapping(ptr, fresh, layout.size());
                zone.free(ptr);
            }
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_keep_their_alignment() {
        let a = ZoneAllocator;
        for (size, align) in [(1, 1), (24, 8), (100, 64), (3000, 256), (20_000, 4096)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            unsafe {
                let p = a.alloc_zeroed(layout);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                assert!(std::slice::from_raw_parts(p, size).iter().all(|&b| b == 0));
                p.write_bytes(0xA5, size);
                let q = a.realloc(p, layout, size * 3);
                assert_eq!(q as usize % align, 0);
                assert!(std::slice::from_raw_parts(q, size).iter().all(|&b| b == 0xA5));
                a.dealloc(q, Layout::from_size_align(size * 3, align).unwrap());
            }
        }
    }
}
