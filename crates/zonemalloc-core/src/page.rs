//! Page provider boundary.
//!
//! Everything the zone needs from the virtual-memory system goes through
//! [`PageProvider`]: aligned zero-filled extents, optional guard pages,
//! address-locked extension, and bulk page copies. [`SystemPages`] is the
//! `mmap`-backed implementation used by the process allocator.

use core::ffi::c_void;
use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Which sides of an extent get an inaccessible guard page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardPages {
    pub prelude: bool,
    pub postlude: bool,
}

impl GuardPages {
    pub const NONE: Self = Self {
        prelude: false,
        postlude: false,
    };

    #[must_use]
    pub const fn any(self) -> bool {
        self.prelude || self.postlude
    }

    /// Bytes of guard below the extent.
    #[must_use]
    pub const fn below(self, page_size: usize) -> usize {
        if self.prelude { page_size } else { 0 }
    }

    /// Bytes of guard above the extent.
    #[must_use]
    pub const fn above(self, page_size: usize) -> usize {
        if self.postlude { page_size } else { 0 }
    }
}

/// Source of virtual memory for a zone.
///
/// Failure is reported as `None`/`false`, never by panicking.
pub trait PageProvider: Sync {
    /// VM page size in bytes (a power of two).
    fn page_size(&self) -> usize;

    /// Map `size` bytes (page multiple) aligned to `align` (power of two, at
    /// least a page). The memory is zero-filled.
    fn allocate(&self, size: usize, align: usize, guard: GuardPages) -> Option<NonNull<u8>>;

    /// Unmap an extent returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `ptr`, `size` and `guard` must match a live extent from this provider.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, guard: GuardPages);

    /// Map `additional` zero-filled bytes exactly at `end`, so an extent that
    /// ends there grows in place. Returns `false` if the range is taken.
    ///
    /// # Safety
    /// `end` must be the page-aligned end of a live extent from this provider.
    unsafe fn extend_in_place(&self, end: NonNull<u8>, additional: usize) -> bool {
        let _ = (end, additional);
        false
    }

    /// Copy whole pages between extents.
    ///
    /// # Safety
    /// Both ranges must be valid for `len` bytes and must not overlap.
    unsafe fn copy_pages(&self, src: *const u8, dst: *mut u8, len: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { ptr::copy_nonoverlapping(src, dst, len) };
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Anonymous `mmap` provider.
#[derive(Debug, Default)]
pub struct SystemPages {
    page_size: AtomicUsize,
}

static SYSTEM_PAGES: SystemPages = SystemPages::new();

impl SystemPages {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_size: AtomicUsize::new(0),
        }
    }

    /// Process-wide instance.
    #[must_use]
    pub fn global() -> &'static SystemPages {
        &SYSTEM_PAGES
    }

    fn map(len: usize, hint: *mut c_void) -> Option<NonNull<u8>> {
        // SAFETY: anonymous private mapping; no existing memory is touched
        // because MAP_FIXED is never passed.
        let p = unsafe {
            libc::mmap(
                hint,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            None
        } else {
            NonNull::new(p.cast::<u8>())
        }
    }

    /// # Safety
    /// The range must be a mapping owned by this provider.
    unsafe fn unmap(addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: caller owns the range.
        let _ = unsafe { libc::munmap(addr as *mut c_void, len) };
    }
}

impl PageProvider for SystemPages {
    fn page_size(&self) -> usize {
        let cached = self.page_size.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        // SAFETY: sysconf has no memory-safety preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let size = if raw > 0 { raw as usize } else { 4096 };
        self.page_size.store(size, Ordering::Relaxed);
        size
    }

    fn allocate(&self, size: usize, align: usize, guard: GuardPages) -> Option<NonNull<u8>> {
        let page = self.page_size();
        let size = round_up(size.max(1), page);
        let align = align.max(page);
        let below = guard.below(page);
        let above = guard.above(page);
        let slack = align - page;
        let total = size
            .checked_add(below)?
            .checked_add(above)?
            .checked_add(slack)?;

        let base = Self::map(total, ptr::null_mut())?.as_ptr() as usize;
        let user = round_up(base + below, align);
        let lead = user - below - base;
        let tail_start = user + size + above;
        let trail = base + total - tail_start;
        // SAFETY: both trimmed ranges lie inside the mapping made above.
        unsafe {
            Self::unmap(base, lead);
            Self::unmap(tail_start, trail);
        }

        if below != 0 {
            // SAFETY: the guard page is part of the live mapping.
            unsafe { libc::mprotect((user - below) as *mut c_void, below, libc::PROT_NONE) };
        }
        if above != 0 {
            // SAFETY: as above.
            unsafe { libc::mprotect((user + size) as *mut c_void, above, libc::PROT_NONE) };
        }
        NonNull::new(user as *mut u8)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, guard: GuardPages) {
        let page = self.page_size();
        let size = round_up(size.max(1), page);
        let below = guard.below(page);
        let above = guard.above(page);
        // SAFETY: caller guarantees the extent and its guards are ours.
        unsafe { Self::unmap(ptr.as_ptr() as usize - below, size + below + above) };
    }

    unsafe fn extend_in_place(&self, end: NonNull<u8>, additional: usize) -> bool {
        let additional = round_up(additional, self.page_size());
        if additional == 0 {
            return true;
        }
        let Some(got) = Self::map(additional, end.as_ptr().cast()) else {
            return false;
        };
        if got == end {
            return true;
        }
        // The kernel placed it elsewhere: the range after the extent is busy.
        // SAFETY: `got` is the mapping we just created.
        unsafe { Self::unmap(got.as_ptr() as usize, additional) };
        false
    }
}
