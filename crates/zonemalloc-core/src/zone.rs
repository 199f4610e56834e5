//! The zone facade.
//!
//! A [`Zone`] owns every region, table and extent of one heap and the
//! single mutex that serializes mutation. It classifies requests by size:
//!
//! - `size <= TINY_LIMIT`: tiny regions
//! - `size < LARGE_THRESHOLD`: small regions
//! - otherwise: a standalone page extent (large, or huge at `page_size`
//!   pages and up)
//!
//! The zone struct itself is carved out of its first tiny region, so it
//! has a stable address for its whole life and is released last.
//!
//! Everything a lock-free reader needs sits at the front of the struct in
//! [`PublishedState`], built only from atomics and plain integers.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;

use crate::config::{SCRIBBLE_BYTE, ZoneFlags};
use crate::error::{CorruptionKind, ZoneError};
use crate::introspect::{self, EnumerateMask, LocalReader, RangeRecorder};
use crate::large::{HugeTable, LargeEntry, LargeTable, huge_table_bytes, is_huge, large_table_bytes};
use crate::log::{EVENT_LOG_CAPACITY, EventLog, LogLevel, ZoneLogRecord, write_diagnostic};
use crate::page::{GuardPages, PageProvider, round_up};
use crate::region::{
    INITIAL_SMALL_REGIONS, INITIAL_TINY_REGIONS, RegionArrayHeader, RegionTable, Tail, region_array_bytes,
    region_base,
};
use crate::small::{
    LARGE_THRESHOLD, SHIFT_SMALL_QUANTUM, SMALL_QUANTUM, SMALL_REGION_SIZE, SmallAllocator, SmallRegion,
    small_msize_for,
};
use crate::tiny::{
    Carved, LastFree, SHIFT_TINY_QUANTUM, TINY_CACHE_MSIZE_LIMIT, TINY_LIMIT, TINY_QUANTUM, TINY_REGION_SIZE,
    TinyAllocator, TinyRegion, tiny_msize_for,
};

/// `"ZONE"`, checked by lock-free readers before trusting a zone address.
pub const ZONE_MAGIC: u32 = 0x5A4F_4E45;
pub const ZONE_VERSION: u32 = 1;
/// Moves at least this large between page-aligned blocks use
/// [`PageProvider::copy_pages`].
pub const VM_COPY_THRESHOLD: usize = 40 * 1024;

const _: () = assert!(align_of::<Zone>() <= TINY_QUANTUM);

/// Whether an admin table of `bytes` is page-backed instead of a small block.
#[inline]
#[must_use]
pub const fn admin_uses_pages(bytes: usize) -> bool {
    bytes >= LARGE_THRESHOLD
}

/// Storage class of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Tiny = 0,
    Small = 1,
    Large = 2,
    Huge = 3,
}

impl SizeClass {
    pub const ALL: [Self; 4] = [Self::Tiny, Self::Small, Self::Large, Self::Huge];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Small => "small",
            Self::Large => "large",
            Self::Huge => "huge",
        }
    }
}

/// Per-class usage for one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStatistics {
    pub blocks_in_use: usize,
    pub size_in_use: usize,
}

/// Zone-wide usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneStatistics {
    pub blocks_in_use: usize,
    pub size_in_use: usize,
    pub max_size_in_use: usize,
    /// Bytes of VM held: regions plus large and huge extents.
    pub size_allocated: usize,
    pub tiny: ClassStatistics,
    pub small: ClassStatistics,
    pub large: ClassStatistics,
    pub huge: ClassStatistics,
    pub tiny_regions: usize,
    pub small_regions: usize,
    pub errors: usize,
}

/// Running counters, readable without the lock.
#[repr(C)]
#[derive(Debug)]
pub struct ZoneCounters {
    objects: [AtomicUsize; 4],
    bytes: [AtomicUsize; 4],
    max_size_in_use: AtomicUsize,
    errors: AtomicUsize,
}

impl Default for ZoneCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects: [const { AtomicUsize::new(0) }; 4],
            bytes: [const { AtomicUsize::new(0) }; 4],
            max_size_in_use: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        }
    }

    fn add(&self, class: SizeClass, count: usize, bytes: usize) {
        self.objects[class as usize].fetch_add(count, Ordering::Relaxed);
        self.grow(class, bytes);
    }

    fn grow(&self, class: SizeClass, bytes: usize) {
        self.bytes[class as usize].fetch_add(bytes, Ordering::Relaxed);
        self.max_size_in_use.fetch_max(self.size_in_use(), Ordering::Relaxed);
    }

    fn sub(&self, class: SizeClass, bytes: usize) {
        self.objects[class as usize].fetch_sub(1, Ordering::Relaxed);
        self.bytes[class as usize].fetch_sub(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn class(&self, class: SizeClass) -> ClassStatistics {
        ClassStatistics {
            blocks_in_use: self.objects[class as usize].load(Ordering::Relaxed),
            size_in_use: self.bytes[class as usize].load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn size_in_use(&self) -> usize {
        self.bytes.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    #[must_use]
    pub fn max_size_in_use(&self) -> usize {
        self.max_size_in_use.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Zone fields that lock-free readers may look at.
#[repr(C)]
#[derive(Debug)]
pub struct PublishedState {
    pub magic: u32,
    pub version: u32,
    pub page_shift: u32,
    pub flags: u32,
    /// Bytes of the tiny block holding the zone struct.
    pub zone_block_size: usize,
    pub tiny_regions: RegionTable<INITIAL_TINY_REGIONS>,
    pub small_regions: RegionTable<INITIAL_SMALL_REGIONS>,
    pub last_free: LastFree,
    pub large: LargeTable,
    pub huge: HugeTable,
    /// Address whose operations are recorded in the event log (0 = none).
    pub log_address: AtomicUsize,
    pub counters: ZoneCounters,
}

impl PublishedState {
    const fn new(page_shift: u32, flags: ZoneFlags, zone_block_size: usize) -> Self {
        Self {
            magic: ZONE_MAGIC,
            version: ZONE_VERSION,
            page_shift,
            flags: flags.bits(),
            zone_block_size,
            tiny_regions: RegionTable::new(),
            small_regions: RegionTable::new(),
            last_free: LastFree::new(),
            large: LargeTable::new(),
            huge: HugeTable::new(),
            log_address: AtomicUsize::new(0),
            counters: ZoneCounters::new(),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == ZONE_MAGIC && self.version == ZONE_VERSION
    }
}

/// Lock-protected allocator state.
#[derive(Debug)]
pub(crate) struct ZoneState {
    pub(crate) tiny: TinyAllocator,
    pub(crate) small: SmallAllocator,
    pub(crate) log: EventLog,
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Tiny(usize),
    Small(usize),
    Large { pages: usize, align: usize },
}

/// Lock-free snapshot taken for `print`.
struct PrintSnapshot {
    tiny_occupancy: u32,
    small_occupancy: u32,
    tiny_tail: Option<Tail>,
    small_tail: Option<Tail>,
    events: [Option<ZoneLogRecord>; EVENT_LOG_CAPACITY],
}

/// One heap.
#[repr(C)]
pub struct Zone {
    published: PublishedState,
    lock: RawMutex,
    provider: &'static dyn PageProvider,
    state: UnsafeCell<ZoneState>,
}

// SAFETY: `state` is only touched with `lock` held; everything else is
// atomics or immutable after creation.
unsafe impl Sync for Zone {}
// SAFETY: as above.
unsafe impl Send for Zone {}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("flags", &self.flags())
            .field("statistics", &self.statistics())
            .finish_non_exhaustive()
    }
}

impl Zone {
    /// Create a zone inside its own first tiny region.
    ///
    /// Returns `None` if the provider cannot supply the region.
    pub fn create(provider: &'static dyn PageProvider, flags: ZoneFlags) -> Option<&'static Zone> {
        let page_size = provider.page_size();
        if !page_size.is_power_of_two() {
            return None;
        }
        let base = provider.allocate(TINY_REGION_SIZE, TINY_REGION_SIZE, GuardPages::NONE)?;
        // SAFETY: freshly mapped, aligned, zeroed tiny region.
        let region = unsafe { TinyRegion::from_base(base.as_ptr() as usize) };
        let mut tiny = TinyAllocator::new();
        // SAFETY: no lock needed yet; nothing else can see the region.
        if unsafe { tiny.add_region(region) }.is_err() {
            // SAFETY: the region is ours and unused.
            unsafe { provider.deallocate(base, TINY_REGION_SIZE, GuardPages::NONE) };
            return None;
        }
        let msize = tiny_msize_for(size_of::<Zone>());
        let carved = tiny.carve_tail(msize)?;
        let slot = carved.ptr.as_ptr().cast::<Zone>();
        let zone = Zone {
            published: PublishedState::new(page_size.trailing_zeros(), flags, msize << SHIFT_TINY_QUANTUM),
            lock: RawMutex::INIT,
            provider,
            state: UnsafeCell::new(ZoneState {
                tiny,
                small: SmallAllocator::new(),
                log: EventLog::new(),
            }),
        };
        // SAFETY: the carved block is large enough and quantum aligned.
        unsafe { slot.write(zone) };
        // SAFETY: initialized above; the block is never released before destroy.
        let zone: &'static Zone = unsafe { &*slot };
        zone.published.tiny_regions.push(region.base());
        zone.with_state(|st| {
            st.log.record(
                LogLevel::Debug,
                "create",
                "region_created",
                Some(region.base()),
                Some(TINY_REGION_SIZE),
                "ok",
                None,
            );
        });
        Some(zone)
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    #[must_use]
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    #[must_use]
    pub fn flags(&self) -> ZoneFlags {
        ZoneFlags::from_bits_truncate(self.published.flags)
    }

    #[must_use]
    pub fn page_shift(&self) -> u32 {
        self.published.page_shift
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        1 << self.published.page_shift
    }

    #[must_use]
    pub fn provider(&self) -> &'static dyn PageProvider {
        self.provider
    }

    #[must_use]
    pub fn published(&self) -> &PublishedState {
        &self.published
    }

    fn tiny_region_of(&self, addr: usize) -> Option<TinyRegion> {
        // SAFETY: the table only holds live tiny regions.
        unsafe { TinyRegion::containing(addr, self.published.tiny_regions.iter()) }
    }

    fn small_region_of(&self, addr: usize) -> Option<SmallRegion> {
        // SAFETY: the table only holds live small regions.
        unsafe { SmallRegion::containing(addr, self.published.small_regions.iter()) }
    }

    /// Pages needed for `size` bytes, `None` on overflow.
    fn pages_for(&self, size: usize) -> Option<usize> {
        let page = self.page_size();
        Some((size.checked_add(page - 1)? >> self.page_shift()).max(1))
    }

    fn classify(&self, size: usize) -> Option<Request> {
        Some(if size <= TINY_LIMIT {
            Request::Tiny(tiny_msize_for(size))
        } else if size < LARGE_THRESHOLD {
            Request::Small(small_msize_for(size))
        } else {
            Request::Large {
                pages: self.pages_for(size)?,
                align: self.page_size(),
            }
        })
    }

    // -----------------------------------------------------------------
    // Locking and error reporting
    // -----------------------------------------------------------------

    fn with_state<R>(&self, f: impl FnOnce(&mut ZoneState) -> R) -> R {
        self.lock.lock();
        // SAFETY: the lock is held until after `f` returns.
        let result = f(unsafe { &mut *self.state.get() });
        // SAFETY: locked above by this thread.
        unsafe { self.lock.unlock() };
        result
    }

    /// Run `f` under the lock; any `Err` goes through the reporting hook.
    fn locked<R>(
        &self,
        symbol: &'static str,
        f: impl FnOnce(&mut ZoneState) -> Result<R, ZoneError>,
    ) -> Result<R, ZoneError> {
        let result = self.with_state(|st| {
            let result = f(st);
            if let Err(error) = result {
                self.note_error(st, symbol, error);
            }
            result
        });
        if let Err(error) = &result {
            self.report(error);
        }
        result
    }

    fn note_error(&self, st: &mut ZoneState, symbol: &'static str, error: ZoneError) {
        self.published.counters.errors.fetch_add(1, Ordering::Relaxed);
        let (level, ptr, size, outcome) = match error {
            ZoneError::OutOfMemory { requested } => (LogLevel::Warn, None, Some(requested), "null"),
            ZoneError::CorruptionDetected { ptr, .. } | ZoneError::Misuse { ptr } => {
                (LogLevel::Error, Some(ptr), None, "ignored")
            }
            ZoneError::InvariantViolation { address, .. } => (LogLevel::Error, Some(address), None, "check_failed"),
            ZoneError::ReadFailed { address, size } => (LogLevel::Warn, Some(address), Some(size), "aborted"),
        };
        st.log.record(level, symbol, "error", ptr, size, outcome, Some(error));
    }

    /// Called with the lock released.
    fn report(&self, error: &ZoneError) {
        if matches!(error, ZoneError::OutOfMemory { .. } | ZoneError::ReadFailed { .. }) {
            return;
        }
        write_diagnostic(self.address(), error);
        if self.flags().abort_on_corruption() && error.is_fatal_candidate() {
            std::process::abort();
        }
    }

    fn trace_address(&self, st: &mut ZoneState, symbol: &'static str, addr: usize, size: Option<usize>) {
        let watched = self.published.log_address.load(Ordering::Relaxed);
        if watched != 0 && watched == addr {
            st.log
                .record(LogLevel::Info, symbol, "watched_address", Some(addr), size, "ok", None);
        }
    }

    // -----------------------------------------------------------------
    // Region and table growth (lock held)
    // -----------------------------------------------------------------

    fn add_tiny_region(&self, st: &mut ZoneState) -> Result<(), ZoneError> {
        let table = &self.published.tiny_regions;
        if table.is_full() {
            let capacity = table.capacity() * 2;
            let block = self.allocate_admin(st, region_array_bytes(capacity))?;
            // SAFETY: admin blocks are word aligned and never released while
            // the zone lives.
            unsafe { table.grow_into(block, capacity) };
            st.log.record(
                LogLevel::Debug,
                "allocate",
                "tiny_table_grown",
                Some(block.as_ptr() as usize),
                Some(capacity),
                "ok",
                None,
            );
        }
        let base = self
            .provider
            .allocate(TINY_REGION_SIZE, TINY_REGION_SIZE, GuardPages::NONE)
            .ok_or(ZoneError::OutOfMemory {
                requested: TINY_REGION_SIZE,
            })?;
        // SAFETY: freshly mapped, aligned and zeroed.
        let region = unsafe { TinyRegion::from_base(base.as_ptr() as usize) };
        unsafe { st.tiny.add_region(region)? };
        table.push(region.base());
        st.log.record(
            LogLevel::Debug,
            "allocate",
            "region_created",
            Some(region.base()),
            Some(TINY_REGION_SIZE),
            "ok",
            None,
        );
        Ok(())
    }

    fn add_small_region(&self, st: &mut ZoneState) -> Result<(), ZoneError> {
        let base = self
            .provider
            .allocate(SMALL_REGION_SIZE, SMALL_REGION_SIZE, GuardPages::NONE)
            .ok_or(ZoneError::OutOfMemory {
                requested: SMALL_REGION_SIZE,
            })?;
        // SAFETY: freshly mapped, aligned and zeroed.
        let region = unsafe { SmallRegion::from_base(base.as_ptr() as usize) };
        unsafe { st.small.add_region(&self.published.small_regions, region)? };
        st.log.record(
            LogLevel::Debug,
            "allocate",
            "region_created",
            Some(region.base()),
            Some(SMALL_REGION_SIZE),
            "ok",
            None,
        );
        Ok(())
    }

    fn tiny_carve(&self, st: &mut ZoneState, msize: usize) -> Result<Carved, ZoneError> {
        // SAFETY: lock held; listed blocks live in published regions.
        if let Some(carved) = unsafe { st.tiny.allocate(msize)? } {
            return Ok(carved);
        }
        self.add_tiny_region(st)?;
        unsafe { st.tiny.allocate(msize)? }.ok_or(ZoneError::OutOfMemory {
            requested: msize << SHIFT_TINY_QUANTUM,
        })
    }

    fn small_carve(&self, st: &mut ZoneState, msize: usize) -> Result<Carved, ZoneError> {
        // SAFETY: as for tiny.
        if let Some(carved) = unsafe { st.small.allocate(msize)? } {
            return Ok(carved);
        }
        self.add_small_region(st)?;
        unsafe { st.small.allocate(msize)? }.ok_or(ZoneError::OutOfMemory {
            requested: msize << SHIFT_SMALL_QUANTUM,
        })
    }

    /// Zeroed, word-aligned storage for an auxiliary table.
    fn allocate_admin(&self, st: &mut ZoneState, bytes: usize) -> Result<NonNull<u8>, ZoneError> {
        if admin_uses_pages(bytes) {
            let size = round_up(bytes, self.page_size());
            return self
                .provider
                .allocate(size, self.page_size(), GuardPages::NONE)
                .ok_or(ZoneError::OutOfMemory { requested: size });
        }
        let carved = self.small_carve(st, small_msize_for(bytes))?;
        // SAFETY: the block is ours and at least `dirty_bytes` long.
        unsafe { ptr::write_bytes(carved.ptr.as_ptr(), 0, carved.dirty_bytes) };
        Ok(carved.ptr)
    }

    fn free_admin(&self, st: &mut ZoneState, addr: usize, bytes: usize) -> Result<(), ZoneError> {
        if admin_uses_pages(bytes) {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                let size = round_up(bytes, self.page_size());
                // SAFETY: page-backed admin storage we allocated with this size.
                unsafe { self.provider.deallocate(ptr, size, GuardPages::NONE) };
            }
            return Ok(());
        }
        let region = self.small_region_of(addr).ok_or(ZoneError::InvariantViolation {
            what: "admin block outside small regions",
            address: addr,
        })?;
        let msize = region.in_use_msize(addr)?;
        // SAFETY: validated in-use small block owned by the zone.
        unsafe { st.small.release(region, region.index_of(addr), msize, false) }
    }

    fn ensure_large_room(&self, st: &mut ZoneState) -> Result<(), ZoneError> {
        let large = &self.published.large;
        if !large.needs_growth() {
            return Ok(());
        }
        let capacity = large.next_capacity();
        let storage = self.allocate_admin(st, large_table_bytes(capacity))?;
        // SAFETY: zeroed storage for `capacity` words.
        let old = unsafe { large.rehash_into(storage, capacity, self.page_shift()) };
        if let Some((addr, old_capacity)) = old {
            self.free_admin(st, addr, large_table_bytes(old_capacity))?;
        }
        st.log.record(
            LogLevel::Debug,
            "allocate",
            "large_table_grown",
            Some(storage.as_ptr() as usize),
            Some(capacity),
            "ok",
            None,
        );
        Ok(())
    }

    fn ensure_huge_room(&self, st: &mut ZoneState) -> Result<(), ZoneError> {
        let huge = &self.published.huge;
        if !huge.needs_growth() {
            return Ok(());
        }
        let capacity = huge.next_capacity();
        let storage = self.allocate_admin(st, huge_table_bytes(capacity))?;
        // SAFETY: storage for `capacity` entries.
        let old = unsafe { huge.grow_into(storage, capacity) };
        if let Some((addr, old_capacity)) = old {
            self.free_admin(st, addr, huge_table_bytes(old_capacity))?;
        }
        st.log.record(
            LogLevel::Debug,
            "allocate",
            "huge_table_grown",
            Some(storage.as_ptr() as usize),
            Some(capacity),
            "ok",
            None,
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    fn allocate_locked(&self, st: &mut ZoneState, request: Request) -> Result<Carved, ZoneError> {
        let counters = &self.published.counters;
        let carved = match request {
            Request::Tiny(msize) => {
                let carved = self.tiny_carve(st, msize)?;
                counters.add(SizeClass::Tiny, 1, msize << SHIFT_TINY_QUANTUM);
                carved
            }
            Request::Small(msize) => {
                let carved = self.small_carve(st, msize)?;
                counters.add(SizeClass::Small, 1, msize << SHIFT_SMALL_QUANTUM);
                carved
            }
            Request::Large { pages, align } => Carved {
                ptr: self.allocate_extent(st, pages, align)?,
                msize: pages,
                dirty_bytes: 0,
            },
        };
        self.trace_address(st, "allocate", carved.ptr.as_ptr() as usize, None);
        Ok(carved)
    }

    fn allocate_extent(&self, st: &mut ZoneState, pages: usize, align: usize) -> Result<NonNull<u8>, ZoneError> {
        let shift = self.page_shift();
        let size = pages
            .checked_mul(self.page_size())
            .ok_or(ZoneError::OutOfMemory { requested: usize::MAX })?;
        let guard = self.flags().guard_pages();
        let huge = is_huge(pages, shift);
        if huge {
            self.ensure_huge_room(st)?;
        } else {
            self.ensure_large_room(st)?;
        }
        let ptr = self
            .provider
            .allocate(size, align, guard)
            .ok_or(ZoneError::OutOfMemory { requested: size })?;
        let address = ptr.as_ptr() as usize;
        if huge {
            self.published.huge.push(address, size);
            self.published.counters.add(SizeClass::Huge, 1, size);
        } else {
            self.published.large.insert(LargeEntry { address, num_pages: pages }, shift);
            self.published.counters.add(SizeClass::Large, 1, size);
        }
        Ok(ptr)
    }

    fn allocate_request(&self, request: Request, zero: bool, symbol: &'static str) -> *mut u8 {
        if let Request::Tiny(msize) = request {
            if msize < TINY_CACHE_MSIZE_LIMIT {
                if let Some(addr) = self.published.last_free.claim(msize) {
                    let bytes = msize << SHIFT_TINY_QUANTUM;
                    self.published.counters.add(SizeClass::Tiny, 1, bytes);
                    if zero {
                        // SAFETY: the claimed block is ours.
                        unsafe { ptr::write_bytes(addr as *mut u8, 0, bytes) };
                    }
                    if self.published.log_address.load(Ordering::Relaxed) == addr {
                        self.with_state(|st| self.trace_address(st, symbol, addr, Some(bytes)));
                    }
                    return addr as *mut u8;
                }
            }
        }
        match self.locked(symbol, |st| self.allocate_locked(st, request)) {
            Ok(carved) => {
                if zero && carved.dirty_bytes != 0 {
                    // SAFETY: the block is ours and at least `dirty_bytes` long.
                    unsafe { ptr::write_bytes(carved.ptr.as_ptr(), 0, carved.dirty_bytes) };
                }
                carved.ptr.as_ptr()
            }
            Err(_) => ptr::null_mut(),
        }
    }

    fn out_of_memory(&self, symbol: &'static str, requested: usize) -> *mut u8 {
        let _ = self.locked::<()>(symbol, |_| Err(ZoneError::OutOfMemory { requested }));
        ptr::null_mut()
    }

    /// Allocate at least `size` bytes. Returns null when out of memory.
    #[must_use]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        match self.classify(size) {
            Some(request) => self.allocate_request(request, false, "allocate"),
            None => self.out_of_memory("allocate", size),
        }
    }

    /// Allocate `count * size` zeroed bytes; null on overflow.
    #[must_use]
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return self.out_of_memory("allocate_zeroed", usize::MAX);
        };
        match self.classify(total) {
            Some(request) => self.allocate_request(request, true, "allocate_zeroed"),
            None => self.out_of_memory("allocate_zeroed", total),
        }
    }

    /// Allocate whole, page-aligned, zeroed pages.
    #[must_use]
    pub fn allocate_pages(&self, size: usize) -> *mut u8 {
        match self.pages_for(size) {
            Some(pages) => self.allocate_request(
                Request::Large {
                    pages,
                    align: self.page_size(),
                },
                false,
                "allocate_pages",
            ),
            None => self.out_of_memory("allocate_pages", size),
        }
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// `align` must be a power of two no larger than the page size;
    /// anything else returns null.
    #[must_use]
    pub fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        if !align.is_power_of_two() || align > self.page_size() {
            return ptr::null_mut();
        }
        if align <= TINY_QUANTUM {
            return self.allocate(size);
        }
        let request = if align <= SMALL_QUANTUM && size < LARGE_THRESHOLD {
            Some(Request::Small(small_msize_for(size)))
        } else {
            self.pages_for(size).map(|pages| Request::Large {
                pages,
                align: self.page_size(),
            })
        };
        match request {
            Some(request) => self.allocate_request(request, false, "allocate_aligned"),
            None => self.out_of_memory("allocate_aligned", size),
        }
    }

    // -----------------------------------------------------------------
    // Free
    // -----------------------------------------------------------------

    fn is_admin_block(&self, addr: usize) -> bool {
        let p = &self.published;
        addr == p.large.storage()
            || addr == p.huge.storage()
            || p.tiny_regions.array_blocks().any(|block| block == addr)
            || p.small_regions.array_blocks().any(|block| block == addr)
    }

    /// # Safety
    /// Lock held.
    unsafe fn free_locked(&self, st: &mut ZoneState, addr: usize, use_cache: bool) -> Result<(), ZoneError> {
        if addr == self.address() || self.is_admin_block(addr) {
            return Err(ZoneError::Misuse { ptr: addr });
        }
        self.trace_address(st, "free", addr, None);
        let counters = &self.published.counters;
        let scribble = self.flags().scribble();

        if let Some(region) = self.tiny_region_of(addr) {
            if self.published.last_free.holds(addr) {
                return Err(ZoneError::corruption(CorruptionKind::DoubleFree, addr));
            }
            let msize = region.in_use_msize(addr)?;
            let bytes = msize << SHIFT_TINY_QUANTUM;
            counters.sub(SizeClass::Tiny, bytes);
            if use_cache && msize < TINY_CACHE_MSIZE_LIMIT {
                if scribble {
                    // SAFETY: the caller's block, still marked in use.
                    unsafe { ptr::write_bytes(addr as *mut u8, SCRIBBLE_BYTE, bytes) };
                }
                if let Some((old, old_msize)) = self.published.last_free.replace(addr, msize) {
                    let old_region = self.tiny_region_of(old).ok_or(ZoneError::InvariantViolation {
                        what: "cached block outside tiny regions",
                        address: old,
                    })?;
                    // SAFETY: the evicted block is in use and only we own it.
                    unsafe { st.tiny.release(old_region, old_region.index_of(old), old_msize, false)? };
                }
                return Ok(());
            }
            // SAFETY: validated in-use block.
            return unsafe { st.tiny.release(region, region.index_of(addr), msize, scribble) };
        }

        if let Some(region) = self.small_region_of(addr) {
            let msize = region.in_use_msize(addr)?;
            counters.sub(SizeClass::Small, msize << SHIFT_SMALL_QUANTUM);
            // SAFETY: validated in-use block.
            return unsafe { st.small.release(region, region.index_of(addr), msize, scribble) };
        }

        let shift = self.page_shift();
        let guard = self.flags().guard_pages();
        if let Some((index, entry)) = self.published.large.lookup(addr, shift) {
            self.published.large.remove_at(index, shift);
            let size = entry.size(shift);
            counters.sub(SizeClass::Large, size);
            // SAFETY: a live large extent with this size and guard layout.
            unsafe { self.provider.deallocate(NonNull::new_unchecked(addr as *mut u8), size, guard) };
            return Ok(());
        }
        if let Some((index, size)) = self.published.huge.find(addr) {
            self.published.huge.swap_remove(index);
            counters.sub(SizeClass::Huge, size);
            // SAFETY: a live huge extent.
            unsafe { self.provider.deallocate(NonNull::new_unchecked(addr as *mut u8), size, guard) };
            return Ok(());
        }
        Err(ZoneError::Misuse { ptr: addr })
    }

    /// Free a block returned by this zone. Null is ignored.
    ///
    /// Double frees and foreign pointers are reported and otherwise ignored.
    ///
    /// # Safety
    /// `ptr` must not be used after this call.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: lock held inside `locked`.
        let _ = self.locked("free", |st| unsafe { self.free_locked(st, ptr as usize, true) });
    }

    // -----------------------------------------------------------------
    // Size queries and resize
    // -----------------------------------------------------------------

    /// Usable size of a block, or 0 if `ptr` is not a live block of this zone.
    #[must_use]
    pub fn size(&self, ptr: *const u8) -> usize {
        let addr = ptr as usize;
        if addr == 0 || addr == self.address() {
            return 0;
        }
        if let Some(region) = self.tiny_region_of(addr) {
            if self.published.last_free.holds(addr) {
                return 0;
            }
            return region.in_use_msize(addr).map_or(0, |m| m << SHIFT_TINY_QUANTUM);
        }
        if let Some(region) = self.small_region_of(addr) {
            return region.in_use_msize(addr).map_or(0, |m| m << SHIFT_SMALL_QUANTUM);
        }
        let shift = self.page_shift();
        if let Some((_, entry)) = self.published.large.lookup(addr, shift) {
            return entry.size(shift);
        }
        self.published.huge.find(addr).map_or(0, |(_, size)| size)
    }

    /// Bytes a request of `size` would actually receive.
    #[must_use]
    pub fn best_size(&self, size: usize) -> usize {
        match self.classify(size) {
            Some(Request::Tiny(msize)) => msize << SHIFT_TINY_QUANTUM,
            Some(Request::Small(msize)) => msize << SHIFT_SMALL_QUANTUM,
            Some(Request::Large { pages, .. }) => pages.saturating_mul(self.page_size()),
            None => size,
        }
    }

    fn try_grow_locked(&self, st: &mut ZoneState, addr: usize, new_size: usize) -> Result<bool, ZoneError> {
        let counters = &self.published.counters;
        if let Some(region) = self.tiny_region_of(addr) {
            if new_size > TINY_LIMIT {
                return Ok(false);
            }
            if self.published.last_free.holds(addr) {
                return Err(ZoneError::Misuse { ptr: addr });
            }
            let old_msize = region.in_use_msize(addr)?;
            let new_msize = tiny_msize_for(new_size);
            // SAFETY: lock held; validated in-use block.
            let grown = unsafe { st.tiny.try_grow(region, region.index_of(addr), old_msize, new_msize)? };
            if grown {
                counters.grow(SizeClass::Tiny, (new_msize - old_msize) << SHIFT_TINY_QUANTUM);
            }
            return Ok(grown);
        }
        if let Some(region) = self.small_region_of(addr) {
            if new_size >= LARGE_THRESHOLD {
                return Ok(false);
            }
            let old_msize = region.in_use_msize(addr)?;
            let new_msize = small_msize_for(new_size);
            // SAFETY: lock held; validated in-use block.
            let grown = unsafe { st.small.try_grow(region, region.index_of(addr), old_msize, new_msize)? };
            if grown {
                counters.grow(SizeClass::Small, (new_msize - old_msize) << SHIFT_SMALL_QUANTUM);
            }
            return Ok(grown);
        }

        let shift = self.page_shift();
        let Some(new_pages) = self.pages_for(new_size) else {
            return Ok(false);
        };
        if self.flags().guard_pages().any() {
            return Ok(false);
        }
        if let Some((index, entry)) = self.published.large.lookup(addr, shift) {
            let crosses = is_huge(new_pages, shift);
            if crosses {
                self.ensure_huge_room(st)?;
            }
            if !self.extend(addr, entry.size(shift), new_pages << shift) {
                return Ok(false);
            }
            let new_size = new_pages << shift;
            if crosses {
                self.published.large.remove_at(index, shift);
                self.published.huge.push(addr, new_size);
                counters.sub(SizeClass::Large, entry.size(shift));
                counters.add(SizeClass::Huge, 1, new_size);
            } else {
                self.published.large.update(
                    index,
                    LargeEntry {
                        address: addr,
                        num_pages: new_pages,
                    },
                );
                counters.grow(SizeClass::Large, new_size - entry.size(shift));
            }
            return Ok(true);
        }
        if let Some((index, size)) = self.published.huge.find(addr) {
            let new_size = new_pages << shift;
            if !self.extend(addr, size, new_size) {
                return Ok(false);
            }
            self.published.huge.set_size(index, new_size);
            counters.grow(SizeClass::Huge, new_size - size);
            return Ok(true);
        }
        Err(ZoneError::Misuse { ptr: addr })
    }

    fn extend(&self, addr: usize, old_size: usize, new_size: usize) -> bool {
        // SAFETY: `addr + old_size` is the end of a live extent.
        unsafe {
            self.provider.extend_in_place(
                NonNull::new_unchecked((addr + old_size) as *mut u8),
                new_size - old_size,
            )
        }
    }

    /// Grow `ptr` to at least `new_size` bytes.
    ///
    /// Never shrinks: a smaller `new_size` returns `ptr` unchanged. Grows in
    /// place when the neighbouring space allows, otherwise moves the data.
    /// Returns null (leaving `ptr` valid) when out of memory.
    ///
    /// # Safety
    /// `ptr` must be null or a live block of this zone.
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        let addr = ptr as usize;
        let old_size = self.size(ptr);
        if old_size == 0 {
            let _ = self.locked::<()>("resize", |_| Err(ZoneError::Misuse { ptr: addr }));
            return ptr::null_mut();
        }
        if new_size <= old_size {
            return ptr;
        }
        match self.locked("resize", |st| {
            self.trace_address(st, "resize", addr, Some(new_size));
            self.try_grow_locked(st, addr, new_size)
        }) {
            Ok(true) => return ptr,
            Ok(false) => {}
            Err(_) => return ptr::null_mut(),
        }

        let fresh = self.allocate(new_size);
        if fresh.is_null() {
            return ptr::null_mut();
        }
        let page = self.page_size();
        // SAFETY: both blocks are live and distinct; `old_size` fits both.
        unsafe {
            if old_size >= VM_COPY_THRESHOLD && (addr | fresh as usize | old_size) % page == 0 {
                self.provider.copy_pages(ptr, fresh, old_size);
            } else {
                ptr::copy_nonoverlapping(ptr, fresh, old_size);
            }
            self.free(ptr);
        }
        fresh
    }

    // -----------------------------------------------------------------
    // Batch operations
    // -----------------------------------------------------------------

    /// Fill `out` with blocks of exactly `size` bytes taken from the tiny
    /// exact-size free list. Returns how many were written (possibly 0).
    pub fn batch_allocate(&self, size: usize, out: &mut [*mut u8]) -> usize {
        if out.is_empty() || size > TINY_LIMIT {
            return 0;
        }
        let msize = tiny_msize_for(size);
        self.locked("batch_allocate", |st| {
            let mut filled = 0;
            while filled < out.len() {
                // SAFETY: lock held.
                let Some(ptr) = (unsafe { st.tiny.allocate_exact(msize)? }) else {
                    break;
                };
                self.published
                    .counters
                    .add(SizeClass::Tiny, 1, msize << SHIFT_TINY_QUANTUM);
                out[filled] = ptr.as_ptr();
                filled += 1;
            }
            Ok(filled)
        })
        .unwrap_or(0)
    }

    /// Free every pointer in `ptrs`: tiny ones in one locked pass, the rest
    /// through [`free`](Self::free). Every entry is nulled.
    ///
    /// # Safety
    /// As for [`free`](Self::free), for each non-null entry.
    pub unsafe fn batch_free(&self, ptrs: &mut [*mut u8]) {
        let scribble = self.flags().scribble();
        let _ = self.locked("batch_free", |st| {
            for slot in ptrs.iter_mut() {
                let addr = *slot as usize;
                if addr == 0
                    || addr == self.address()
                    || self.published.last_free.holds(addr)
                    || self.is_admin_block(addr)
                {
                    continue;
                }
                let Some(region) = self.tiny_region_of(addr) else {
                    continue;
                };
                let Ok(msize) = region.in_use_msize(addr) else {
                    continue;
                };
                self.trace_address(st, "batch_free", addr, None);
                self.published
                    .counters
                    .sub(SizeClass::Tiny, msize << SHIFT_TINY_QUANTUM);
                // The block is ours from here on, even if releasing it fails.
                *slot = ptr::null_mut();
                // SAFETY: lock held; validated in-use block.
                unsafe { st.tiny.release(region, region.index_of(addr), msize, scribble)? };
            }
            Ok(())
        });
        for slot in ptrs.iter_mut() {
            if !slot.is_null() {
                // SAFETY: caller contract.
                unsafe { self.free(*slot) };
                *slot = ptr::null_mut();
            }
        }
    }

    // -----------------------------------------------------------------
    // Introspection surface
    // -----------------------------------------------------------------

    /// Run the consistency checker; the first violation is logged.
    #[must_use]
    pub fn check(&self) -> bool {
        self.locked("check", |st| crate::check::check_zone(self, st)).is_ok()
    }

    /// Walk every live range without taking the lock.
    pub fn enumerate(&self, mask: EnumerateMask, recorder: &mut dyn RangeRecorder) -> Result<(), ZoneError> {
        // SAFETY: the zone is live for the duration of the walk.
        unsafe { introspect::enumerate(self.address(), mask, &mut LocalReader, recorder) }
    }

    #[must_use]
    pub fn statistics(&self) -> ZoneStatistics {
        let c = &self.published.counters;
        let [tiny, small, large, huge] = SizeClass::ALL.map(|class| c.class(class));
        let tiny_regions = self.published.tiny_regions.count();
        let small_regions = self.published.small_regions.count();
        ZoneStatistics {
            blocks_in_use: tiny.blocks_in_use + small.blocks_in_use + large.blocks_in_use + huge.blocks_in_use,
            size_in_use: c.size_in_use(),
            max_size_in_use: c.max_size_in_use(),
            size_allocated: tiny_regions * TINY_REGION_SIZE
                + small_regions * SMALL_REGION_SIZE
                + large.size_in_use
                + huge.size_in_use,
            tiny,
            small,
            large,
            huge,
            tiny_regions,
            small_regions,
            errors: c.errors(),
        }
    }

    /// Record every operation on `address` in the event log.
    pub fn set_log_address(&self, address: Option<usize>) {
        self.published
            .log_address
            .store(address.unwrap_or(0), Ordering::Relaxed);
    }

    /// Most recent error recorded in the event log.
    #[must_use]
    pub fn last_error(&self) -> Option<ZoneError> {
        self.with_state(|st| st.log.last_error())
    }

    /// Copy the retained event log (oldest first) into `out`.
    pub fn recent_events(&self, out: &mut [ZoneLogRecord]) -> usize {
        self.with_state(|st| {
            let mut n = 0;
            for (slot, record) in out.iter_mut().zip(st.log.iter()) {
                *slot = *record;
                n += 1;
            }
            n
        })
    }

    /// Hold the zone lock across a fork or similar.
    pub fn force_lock(&self) {
        self.lock.lock();
    }

    /// # Safety
    /// Must pair with a preceding [`force_lock`](Self::force_lock).
    pub unsafe fn force_unlock(&self) {
        // SAFETY: caller contract.
        unsafe { self.lock.unlock() };
    }

    /// Human-readable summary. Formatting happens after the lock is
    /// released, so `out` may allocate (even from this zone).
    pub fn print(&self, out: &mut dyn fmt::Write, verbose: bool) -> fmt::Result {
        let snapshot = self.with_state(|st| {
            let mut events = [None; EVENT_LOG_CAPACITY];
            for (slot, record) in events.iter_mut().zip(st.log.iter()) {
                *slot = Some(*record);
            }
            PrintSnapshot {
                tiny_occupancy: st.tiny.lists().occupancy(),
                small_occupancy: st.small.lists().occupancy(),
                tiny_tail: st.tiny.tail(),
                small_tail: st.small.tail(),
                events,
            }
        });
        let stats = self.statistics();
        writeln!(
            out,
            "zone {:#x} flags={:#x} page_size={}",
            self.address(),
            self.flags().bits(),
            self.page_size()
        )?;
        writeln!(
            out,
            "in use: {} blocks, {} bytes (max {}); allocated {} bytes; errors {}",
            stats.blocks_in_use, stats.size_in_use, stats.max_size_in_use, stats.size_allocated, stats.errors
        )?;
        writeln!(
            out,
            "tiny: {} regions, {} blocks, {} bytes, free slots {:#034b}",
            stats.tiny_regions, stats.tiny.blocks_in_use, stats.tiny.size_in_use, snapshot.tiny_occupancy
        )?;
        writeln!(
            out,
            "small: {} regions, {} blocks, {} bytes, free slots {:#034b}",
            stats.small_regions, stats.small.blocks_in_use, stats.small.size_in_use, snapshot.small_occupancy
        )?;
        writeln!(
            out,
            "large: {} blocks, {} bytes; huge: {} blocks, {} bytes",
            stats.large.blocks_in_use, stats.large.size_in_use, stats.huge.blocks_in_use, stats.huge.size_in_use
        )?;
        if !verbose {
            return Ok(());
        }
        for base in self.published.tiny_regions.iter() {
            writeln!(out, "  tiny region {base:#x}")?;
        }
        if let Some(tail) = snapshot.tiny_tail {
            writeln!(out, "  tiny tail {:#x} at quantum {}", tail.region, tail.start)?;
        }
        for base in self.published.small_regions.iter() {
            writeln!(out, "  small region {base:#x}")?;
        }
        if let Some(tail) = snapshot.small_tail {
            writeln!(out, "  small tail {:#x} at quantum {}", tail.region, tail.start)?;
        }
        for entry in self.published.large.iter(self.page_shift()) {
            writeln!(out, "  large {:#x} {} pages", entry.address, entry.num_pages)?;
        }
        for (address, size) in self.published.huge.iter() {
            writeln!(out, "  huge {address:#x} {size} bytes")?;
        }
        for record in snapshot.events.iter().flatten() {
            writeln!(out, "  event {record}")?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Destroy
    // -----------------------------------------------------------------

    /// Release every extent and region of the zone, the region holding
    /// the zone struct last.
    ///
    /// # Safety
    /// No other thread may use the zone, and no pointer from it may be
    /// used afterwards (including `self`).
    pub unsafe fn destroy(&'static self) {
        let provider = self.provider;
        let shift = self.page_shift();
        let page = self.page_size();
        let guard = self.flags().guard_pages();
        let zone_region = region_base(self.address(), TINY_REGION_SIZE);
        let release = |addr: usize, size: usize, guard: GuardPages| {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // SAFETY: every extent released here was mapped by `provider`
                // with this size and guard layout, and is released once.
                unsafe { provider.deallocate(ptr, size, guard) };
            }
        };

        for entry in self.published.large.iter(shift) {
            release(entry.address, entry.size(shift), guard);
        }
        for (address, size) in self.published.huge.iter() {
            release(address, size, guard);
        }
        let large_bytes = large_table_bytes(self.published.large.capacity());
        if admin_uses_pages(large_bytes) {
            release(self.published.large.storage(), round_up(large_bytes, page), GuardPages::NONE);
        }
        let huge_bytes = huge_table_bytes(self.published.huge.capacity());
        if admin_uses_pages(huge_bytes) {
            release(self.published.huge.storage(), round_up(huge_bytes, page), GuardPages::NONE);
        }

        for base in self.published.tiny_regions.iter() {
            if base != zone_region {
                release(base, TINY_REGION_SIZE, GuardPages::NONE);
            }
        }
        let mut block = self.published.tiny_regions.array_block();
        while block != 0 {
            // SAFETY: spilled arrays start with a header and are still live.
            let header = unsafe { (block as *const RegionArrayHeader).read() };
            let bytes = region_array_bytes(header.capacity);
            if admin_uses_pages(bytes) {
                release(block, round_up(bytes, page), GuardPages::NONE);
            }
            block = header.previous;
        }

        let holder = region_base(self.published.small_regions.array_block(), SMALL_REGION_SIZE);
        let mut holder_live = false;
        for base in self.published.small_regions.iter() {
            if base == holder {
                holder_live = true;
            } else {
                release(base, SMALL_REGION_SIZE, GuardPages::NONE);
            }
        }
        if holder_live {
            release(holder, SMALL_REGION_SIZE, GuardPages::NONE);
        }

        release(zone_region, TINY_REGION_SIZE, GuardPages::NONE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::SystemPages;

    fn zone() -> &'static Zone {
        Zone::create(SystemPages::global(), ZoneFlags::NONE).expect("zone")
    }

    #[test]
    fn zone_lives_in_its_first_tiny_region() {
        let z = zone();
        let regions: Vec<_> = z.published().tiny_regions.iter().collect();
        assert_eq!(regions, vec![region_base(z.address(), TINY_REGION_SIZE)]);
        assert!(z.published().is_valid());
        // The zone block itself is neither a user block nor freeable.
        assert_eq!(z.size(z.address() as *const u8), 0);
        unsafe { z.free(z.address() as *mut u8) };
        assert_eq!(z.last_error(), Some(ZoneError::Misuse { ptr: z.address() }));
        unsafe { z.destroy() };
    }

    #[test]
    fn classification_boundaries() {
        let z = zone();
        assert_eq!(z.best_size(0), TINY_QUANTUM);
        assert_eq!(z.best_size(TINY_LIMIT), TINY_LIMIT);
        assert_eq!(z.best_size(TINY_LIMIT + 1), SMALL_QUANTUM * small_msize_for(TINY_LIMIT + 1));
        assert_eq!(z.best_size(LARGE_THRESHOLD), round_up(LARGE_THRESHOLD, z.page_size()));
        assert_eq!(z.best_size(usize::MAX), usize::MAX);
        unsafe { z.destroy() };
    }

    #[test]
    fn statistics_follow_allocations() {
        let z = zone();
        let a = z.allocate(100);
        let b = z.allocate(2000);
        let c = z.allocate(100_000);
        let s = z.statistics();
        assert_eq!(s.blocks_in_use, 3);
        assert_eq!(s.tiny.size_in_use, z.best_size(100));
        assert_eq!(s.small.size_in_use, z.best_size(2000));
        assert_eq!(s.large.size_in_use, z.best_size(100_000));
        assert_eq!(s.small_regions, 1);
        unsafe {
            z.free(a);
            z.free(b);
            z.free(c);
        }
        let s = z.statistics();
        assert_eq!(s.blocks_in_use, 0);
        assert_eq!(s.size_in_use, 0);
        assert!(s.max_size_in_use >= z.best_size(100_000));
        unsafe { z.destroy() };
    }

    #[test]
    fn print_reports_classes_and_events() {
        let z = zone();
        let p = z.allocate(64);
        z.set_log_address(Some(p as usize));
        unsafe { z.free(p) };
        let mut text = String::new();
        z.print(&mut text, true).unwrap();
        assert!(text.contains("tiny: 1 regions"));
        assert!(text.contains("watched_address"));
        assert!(text.contains("region_created"));
        unsafe { z.destroy() };
    }

    #[test]
    fn foreign_pointer_is_misuse_not_crash() {
        let z = zone();
        let mut local = 0u64;
        let foreign = &mut local as *mut u64 as *mut u8;
        unsafe { z.free(foreign) };
        assert_eq!(z.last_error(), Some(ZoneError::Misuse { ptr: foreign as usize }));
        assert_eq!(z.statistics().errors, 1);
        assert_eq!(unsafe { z.resize(foreign, 10) }, ptr::null_mut());
        unsafe { z.destroy() };
    }
}
