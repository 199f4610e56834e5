//! Native zone vtable.
//!
//! A [`MallocZone`] is a C function table a platform allocator dispatcher
//! can call without knowing anything about [`Zone`]. Each table lives in a
//! tiny block of the zone it fronts, so destroying the zone frees it too.
//!
//! The introspection table ([`MallocIntrospection`]) carries the lock-free
//! enumerator. It talks to callers through two C callbacks: a memory reader
//! that maps another task's memory locally and a range recorder that
//! receives batches of [`VmRange`].

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::fmt;
use std::ptr;

use zonemalloc_core::{
    EnumerateMask, LocalReader, MemoryReader, RangeKind, RangeRecorder, SystemPages, VmRange, Zone,
    ZoneError, ZoneFlags, introspect,
};

pub const KERN_SUCCESS: c_int = 0;
pub const KERN_INVALID_ADDRESS: c_int = 1;
pub const KERN_FAILURE: c_int = 5;

/// Table layout version reported in [`MallocZone::version`].
pub const MALLOC_ZONE_VERSION: c_uint = 6;

const ZONE_NAME: &std::ffi::CStr = c"zonemalloc";

/// Maps `size` bytes at `address` in `task` and stores a local pointer in
/// `*local`. Returns [`KERN_SUCCESS`] on success.
pub type MemoryReaderFn = unsafe extern "C" fn(
    task: *mut c_void,
    address: usize,
    size: usize,
    local: *mut *mut c_void,
) -> c_int;

/// Receives `count` ranges of one type (`1` in use, `2` region, `4` admin).
pub type RangeRecorderFn = unsafe extern "C" fn(
    task: *mut c_void,
    context: *mut c_void,
    type_mask: c_uint,
    ranges: *mut VmRange,
    count: c_uint,
);

/// Entry points of one zone.
#[repr(C)]
pub struct MallocZone {
    pub reserved1: *mut c_void,
    pub reserved2: *mut c_void,
    pub size: unsafe extern "C" fn(zone: *mut MallocZone, ptr: *const c_void) -> usize,
    pub malloc: unsafe extern "C" fn(zone: *mut MallocZone, size: usize) -> *mut c_void,
    pub calloc: unsafe extern "C" fn(zone: *mut MallocZone, num_items: usize, size: usize) -> *mut c_void,
    pub valloc: unsafe extern "C" fn(zone: *mut MallocZone, size: usize) -> *mut c_void,
    pub free: unsafe extern "C" fn(zone: *mut MallocZone, ptr: *mut c_void),
    pub realloc: unsafe extern "C" fn(zone: *mut MallocZone, ptr: *mut c_void, size: usize) -> *mut c_void,
    pub destroy: unsafe extern "C" fn(zone: *mut MallocZone),
    pub zone_name: *const c_char,
    pub batch_malloc: unsafe extern "C" fn(
        zone: *mut MallocZone,
        size: usize,
        results: *mut *mut c_void,
        num_requested: c_uint,
    ) -> c_uint,
    pub batch_free: unsafe extern "C" fn(zone: *mut MallocZone, to_be_freed: *mut *mut c_void, num: c_uint),
    pub introspect: *const MallocIntrospection,
    pub version: c_uint,
    pub memalign: unsafe extern "C" fn(zone: *mut MallocZone, alignment: usize, size: usize) -> *mut c_void,
    pub free_definite_size: unsafe extern "C" fn(zone: *mut MallocZone, ptr: *mut c_void, size: usize),
}

/// Introspection entry points shared by every zone.
#[repr(C)]
pub struct MallocIntrospection {
    pub enumerator: unsafe extern "C" fn(
        task: *mut c_void,
        context: *mut c_void,
        type_mask: c_uint,
        zone_address: usize,
        reader: Option<MemoryReaderFn>,
        recorder: Option<RangeRecorderFn>,
    ) -> c_int,
    pub good_size: unsafe extern "C" fn(zone: *mut MallocZone, size: usize) -> usize,
    pub check: unsafe extern "C" fn(zone: *mut MallocZone) -> c_int,
    pub print: unsafe extern "C" fn(zone: *mut MallocZone, verbose: c_int),
    pub log: unsafe extern "C" fn(zone: *mut MallocZone, address: *mut c_void),
    pub force_lock: unsafe extern "C" fn(zone: *mut MallocZone),
    pub force_unlock: unsafe extern "C" fn(zone: *mut MallocZone),
    pub statistics: unsafe extern "C" fn(zone: *mut MallocZone, stats: *mut MallocStatistics),
}

/// C view of [`zonemalloc_core::ZoneStatistics`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MallocStatistics {
    pub blocks_in_use: c_uint,
    pub size_in_use: usize,
    pub max_size_in_use: usize,
    pub size_allocated: usize,
}

/// The table plus the zone it fronts. `basic` must stay first: callers
/// hold `*mut MallocZone` and we cast back.
#[repr(C)]
struct ZoneHandle {
    basic: MallocZone,
    zone: *const Zone,
}

static INTROSPECTION: MallocIntrospection = MallocIntrospection {
    enumerator: zone_enumerator,
    good_size: zone_good_size,
    check: zone_check,
    print: zone_print,
    log: zone_log,
    force_lock: zone_force_lock,
    force_unlock: zone_force_unlock,
    statistics: zone_statistics,
};

/// Create a zone with its own regions and return its function table.
///
/// `start_size` is accepted for signature compatibility and ignored.
/// Returns null when the zone cannot be created.
#[unsafe(no_mangle)]
pub extern "C" fn zonemalloc_create_zone(start_size: usize, flags: c_uint) -> *mut MallocZone {
    let _ = start_size;
    let Some(zone) = Zone::create(SystemPages::global(), ZoneFlags::from_bits_truncate(flags)) else {
        return ptr::null_mut();
    };
    let slot = zone.allocate(size_of::<ZoneHandle>()).cast::<ZoneHandle>();
    if slot.is_null() {
        // SAFETY: nothing else refers to the zone yet.
        unsafe { zone.destroy() };
        return ptr::null_mut();
    }
    let handle = ZoneHandle {
        basic: MallocZone {
            reserved1: ptr::null_mut(),
            reserved2: ptr::null_mut(),
            size: zone_size,
            malloc: zone_malloc,
            calloc: zone_calloc,
            valloc: zone_valloc,
            free: zone_free,
            realloc: zone_realloc,
            destroy: zone_destroy,
            zone_name: ZONE_NAME.as_ptr(),
            batch_malloc: zone_batch_malloc,
            batch_free: zone_batch_free,
            introspect: &INTROSPECTION,
            version: MALLOC_ZONE_VERSION,
            memalign: zone_memalign,
            free_definite_size: zone_free_definite_size,
        },
        zone: zone as *const Zone,
    };
    // SAFETY: the block is large enough and at least quantum aligned.
    unsafe { slot.write(handle) };
    slot.cast()
}

/// # Safety
/// `zone` must come from [`zonemalloc_create_zone`] and not be destroyed.
unsafe fn zone_of(zone: *mut MallocZone) -> &'static Zone {
    // SAFETY: caller contract; the handle lives as long as the zone.
    unsafe { &*(*zone.cast::<ZoneHandle>()).zone }
}

// ---------------------------------------------------------------------------
// Basic entry points
// ---------------------------------------------------------------------------

unsafe extern "C" fn zone_size(zone: *mut MallocZone, ptr: *const c_void) -> usize {
    // SAFETY: dispatcher passes a live zone.
    unsafe { zone_of(zone) }.size(ptr.cast())
}

unsafe extern "C" fn zone_malloc(zone: *mut MallocZone, size: usize) -> *mut c_void {
    // SAFETY: dispatcher passes a live zone.
    unsafe { zone_of(zone) }.allocate(size).cast()
}

unsafe extern "C" fn zone_calloc(zone: *mut MallocZone, num_items: usize, size: usize) -> *mut c_void {
    // SAFETY: dispatcher passes a live zone.
    unsafe { zone_of(zone) }.allocate_zeroed(num_items, size).cast()
}

unsafe extern "C" fn zone_valloc(zone: *mut MallocZone, size: usize) -> *mut c_void {
    // SAFETY: dispatcher passes a live zone.
    unsafe { zone_of(zone) }.allocate_pages(size).cast()
}

unsafe extern "C" fn zone_free(zone: *mut MallocZone, ptr: *mut c_void) {
    // SAFETY: dispatcher passes a live zone and one of its blocks.
    unsafe { zone_of(zone).free(ptr.cast()) }
}

unsafe extern "C" fn zone_free_definite_size(zone: *mut MallocZone, ptr: *mut c_void, _size: usize) {
    // SAFETY: as for `zone_free`.
    unsafe { zone_free(zone, ptr) }
}

unsafe extern "C" fn zone_realloc(zone: *mut MallocZone, ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: dispatcher passes a live zone and null or one of its blocks.
    unsafe { zone_of(zone).resize(ptr.cast(), size) }.cast()
}

unsafe extern "C" fn zone_memalign(zone: *mut MallocZone, alignment: usize, size: usize) -> *mut c_void {
    // SAFETY: dispatcher passes a live zone.
    unsafe { zone_of(zone) }.allocate_aligned(size, alignment).cast()
}

unsafe extern "C" fn zone_destroy(zone: *mut MallocZone) {
    // SAFETY: dispatcher passes a live zone; the handle dies with it and is
    // not touched after `destroy`.
    unsafe {
        let inner = zone_of(zone);
        inner.destroy();
    }
}

unsafe extern "C" fn zone_batch_malloc(
    zone: *mut MallocZone,
    size: usize,
    results: *mut *mut c_void,
    num_requested: c_uint,
) -> c_uint {
    if results.is_null() || num_requested == 0 {
        return 0;
    }
    // SAFETY: caller provides `num_requested` writable slots.
    let out = unsafe { std::slice::from_raw_parts_mut(results.cast::<*mut u8>(), num_requested as usize) };
    // SAFETY: dispatcher passes a live zone.
    let filled = unsafe { zone_of(zone) }.batch_allocate(size, out);
    filled as c_uint
}

unsafe extern "C" fn zone_batch_free(zone: *mut MallocZone, to_be_freed: *mut *mut c_void, num: c_uint) {
    if to_be_freed.is_null() || num == 0 {
        return;
    }
    // SAFETY: caller provides `num` entries, each null or a live block.
    unsafe {
        let ptrs = std::slice::from_raw_parts_mut(to_be_freed.cast::<*mut u8>(), num as usize);
        zone_of(zone).batch_free(ptrs);
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// [`MemoryReader`] over a C reader callback; a missing callback means the
/// zone is in this process.
struct CReader {
    task: *mut c_void,
    read: Option<MemoryReaderFn>,
}

impl MemoryReader for CReader {
    fn read(&mut self, address: usize, size: usize) -> Option<*const u8> {
        let Some(read) = self.read else {
            return LocalReader.read(address, size);
        };
        let mut local = ptr::null_mut();
        // SAFETY: the callback is provided by the enumerator's caller and
        // `local` is a valid out-pointer.
        let rc = unsafe { read(self.task, address, size, &mut local) };
        (rc == KERN_SUCCESS && !local.is_null()).then_some(local.cast_const().cast())
    }
}

struct CRecorder {
    task: *mut c_void,
    context: *mut c_void,
    record: RangeRecorderFn,
}

impl RangeRecorder for CRecorder {
    fn record(&mut self, kind: RangeKind, ranges: &[VmRange]) {
        // SAFETY: the callback is provided by the enumerator's caller; the
        // batch is at most 256 ranges and only read.
        unsafe {
            (self.record)(
                self.task,
                self.context,
                kind.mask().bits(),
                ranges.as_ptr().cast_mut(),
                ranges.len() as c_uint,
            );
        }
    }
}

unsafe extern "C" fn zone_enumerator(
    task: *mut c_void,
    context: *mut c_void,
    type_mask: c_uint,
    zone_address: usize,
    reader: Option<MemoryReaderFn>,
    recorder: Option<RangeRecorderFn>,
) -> c_int {
    let Some(record) = recorder else {
        return KERN_SUCCESS;
    };
    let mut reader = CReader { task, read: reader };
    let Some(handle) = reader.read(zone_address, size_of::<ZoneHandle>()) else {
        return KERN_INVALID_ADDRESS;
    };
    // SAFETY: the reader mapped a whole handle; only the plain address
    // field is read, never dereferenced locally.
    let inner = unsafe { ptr::addr_of!((*handle.cast::<ZoneHandle>()).zone).read_unaligned() } as usize;
    let mut recorder = CRecorder { task, context, record };
    let mask = EnumerateMask::from_bits_truncate(type_mask);
    // SAFETY: the caller keeps the target zone mapped for the walk.
    match unsafe { introspect::enumerate(inner, mask, &mut reader, &mut recorder) } {
        Ok(()) => KERN_SUCCESS,
        Err(ZoneError::ReadFailed { .. }) => KERN_INVALID_ADDRESS,
        Err(_) => KERN_FAILURE,
    }
}

unsafe extern "C" fn zone_good_size(zone: *mut MallocZone, size: usize) -> usize {
    // SAFETY: dispatcher passes a live zone.
    unsafe { zone_of(zone) }.best_size(size)
}

unsafe extern "C" fn zone_check(zone: *mut MallocZone) -> c_int {
    // SAFETY: dispatcher passes a live zone.
    c_int::from(unsafe { zone_of(zone) }.check())
}

/// `fmt::Write` straight to a file descriptor.
struct FdWriter(c_int);

impl fmt::Write for FdWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s.as_bytes();
        while !rest.is_empty() {
            // SAFETY: `rest` is a live byte slice.
            let n = unsafe { libc::write(self.0, rest.as_ptr().cast(), rest.len()) };
            if n <= 0 {
                return Err(fmt::Error);
            }
            rest = &rest[n as usize..];
        }
        Ok(())
    }
}

unsafe extern "C" fn zone_print(zone: *mut MallocZone, verbose: c_int) {
    // SAFETY: dispatcher passes a live zone.
    let zone = unsafe { zone_of(zone) };
    let _ = zone.print(&mut FdWriter(libc::STDERR_FILENO), verbose != 0);
}

unsafe extern "C" fn zone_log(zone: *mut MallocZone, address: *mut c_void) {
    // SAFETY: dispatcher passes a live zone.
    let zone = unsafe { zone_of(zone) };
    zone.set_log_address((!address.is_null()).then_some(address as usize));
}

unsafe extern "C" fn zone_force_lock(zone: *mut MallocZone) {
    // SAFETY: dispatcher passes a live zone.
    unsafe { zone_of(zone) }.force_lock();
}

unsafe extern "C" fn zone_force_unlock(zone: *mut MallocZone) {
    // SAFETY: dispatcher pairs this with `force_lock`.
    unsafe { zone_of(zone).force_unlock() }
}

unsafe extern "C" fn zone_statistics(zone: *mut MallocZone, stats: *mut MallocStatistics) {
    if stats.is_null() {
        return;
    }
    // SAFETY: dispatcher passes a live zone.
    let s = unsafe { zone_of(zone) }.statistics();
    let out = MallocStatistics {
        blocks_in_use: c_uint::try_from(s.blocks_in_use).unwrap_or(c_uint::MAX),
        size_in_use: s.size_in_use,
        max_size_in_use: s.max_size_in_use,
        size_allocated: s.size_allocated,
    };
    // SAFETY: caller provides a writable statistics record.
    unsafe { stats.write(out) };
}
