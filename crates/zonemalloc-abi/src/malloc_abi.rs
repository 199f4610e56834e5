//! ABI layer for the C allocation entry points (`malloc`, `free`, `calloc`,
//! `realloc`, `valloc`, `posix_memalign`, `aligned_alloc`, `memalign`,
//! `malloc_usable_size`).
//!
//! Every call goes to the process zone. Symbols are exported unmangled only
//! with the `interpose` feature (the `LD_PRELOAD` build); otherwise binaries
//! linking this crate keep the system allocator and call these by path.

use std::ffi::{c_int, c_void};
use std::ptr;

use zonemalloc_core::Zone;

use crate::zone_state::try_process_zone;

fn with_zone(f: impl FnOnce(&'static Zone) -> *mut u8) -> *mut c_void {
    match try_process_zone() {
        Some(zone) => f(zone).cast(),
        None => ptr::null_mut(),
    }
}

/// `posix_memalign` accepts powers of two that are multiples of a pointer.
fn valid_posix_alignment(alignment: usize) -> bool {
    alignment.is_power_of_two() && alignment % size_of::<*mut c_void>() == 0
}

// ---------------------------------------------------------------------------
// malloc / free
// ---------------------------------------------------------------------------

/// POSIX `malloc` -- allocates `size` bytes of uninitialized memory.
///
/// A zero-byte request returns a unique minimal block.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    with_zone(|zone| zone.allocate(size))
}

/// POSIX `free`. Null is a no-op. Foreign pointers and double frees are
/// reported by the zone and otherwise ignored.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by one of these functions.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    if let Some(zone) = try_process_zone() {
        // SAFETY: forwarded caller contract.
        unsafe { zone.free(ptr.cast()) };
    }
}

// ---------------------------------------------------------------------------
// calloc / realloc
// ---------------------------------------------------------------------------

/// POSIX `calloc` -- `nmemb * size` zeroed bytes, null on overflow.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    with_zone(|zone| zone.allocate_zeroed(nmemb, size))
}

/// POSIX `realloc`.
///
/// - If `ptr` is null, behaves like `malloc(size)`.
/// - If `size` is 0 and `ptr` is non-null, frees `ptr` and returns null.
/// - Otherwise grows in place when possible or moves the data. Blocks
///   never shrink.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by these functions.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if !ptr.is_null() && size == 0 {
        // SAFETY: forwarded caller contract.
        unsafe { free(ptr) };
        return ptr::null_mut();
    }
    // SAFETY: forwarded caller contract.
    with_zone(|zone| unsafe { zone.resize(ptr.cast(), size) })
}

// ---------------------------------------------------------------------------
// aligned variants
// ---------------------------------------------------------------------------

/// `valloc` -- page-aligned allocation.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    with_zone(|zone| zone.allocate_pages(size))
}

/// `memalign` -- null for alignments that are not a power of two or exceed
/// the page size.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    with_zone(|zone| zone.allocate_aligned(size, alignment))
}

/// C11 `aligned_alloc`.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    with_zone(|zone| zone.allocate_aligned(size, alignment))
}

/// POSIX `posix_memalign`.
///
/// Returns `EINVAL` for a bad alignment and `ENOMEM` when the zone cannot
/// satisfy the request; `*memptr` is written only on success.
///
/// # Safety
///
/// `memptr` must be valid for one pointer write.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() || !valid_posix_alignment(alignment) {
        return libc::EINVAL;
    }
    let p = with_zone(|zone| zone.allocate_aligned(size, alignment));
    if p.is_null() {
        return libc::ENOMEM;
    }
    // SAFETY: caller guarantees `memptr` is writable.
    unsafe { *memptr = p };
    0
}

/// `malloc_usable_size` -- bytes usable at `ptr`, 0 for null or foreign
/// pointers.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by these functions.
#[cfg_attr(feature = "interpose", unsafe(no_mangle))]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    try_process_zone().map_or(0, |zone| zone.size(ptr.cast()))
}
