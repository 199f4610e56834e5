//! Lock-free zone enumeration.
//!
//! [`enumerate`] rebuilds the set of live ranges from raw zone memory. It
//! never takes the zone lock and keeps no state between calls: every
//! pointer is read through a [`MemoryReader`], so the zone may live in
//! another address space. Published counts are always loaded before the
//! pointers they bound, so a walk racing with the zone sees either the old
//! or the new table, never a table shorter than its count.
//!
//! Ranges are handed to a [`RangeRecorder`] in batches of at most
//! [`MAX_RANGES_PER_BATCH`], one batch per kind at a time.

use core::mem::size_of;
use core::slice;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use crate::error::ZoneError;
use crate::large::{HugeEntry, LargeEntry, huge_table_bytes, large_table_bytes};
use crate::page::round_up;
use crate::region::{REGION_ARRAY_HEADER_WORDS, RegionArrayHeader, RegionTable, region_array_bytes};
use crate::small::{NUM_SMALL_BLOCKS, SHIFT_SMALL_QUANTUM, SMALL_METADATA_OFFSET, SMALL_METADATA_SIZE, SMALL_REGION_SIZE, SmallTag};
use crate::tiny::{
    Bitmap, NUM_TINY_BLOCKS, SHIFT_TINY_QUANTUM, TINY_BITMAP_WORDS, TINY_METADATA_OFFSET, TINY_METADATA_SIZE,
    TINY_REGION_SIZE,
};
use crate::zone::{PublishedState, admin_uses_pages};

pub const MAX_RANGES_PER_BATCH: usize = 256;
/// Admin blocks living inside regions that one walk can tell apart.
const ADMIN_SET_CAPACITY: usize = 128;

/// A `[address, address + size)` range in the zone's address space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmRange {
    pub address: usize,
    pub size: usize,
}

/// What a reported range holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeKind {
    /// A block owned by the caller of `allocate`.
    InUse,
    /// A whole region or a large/huge extent.
    Region,
    /// Allocator bookkeeping: the zone itself, region metadata, tables.
    Admin,
}

impl RangeKind {
    const ALL: [Self; 3] = [Self::InUse, Self::Region, Self::Admin];

    const fn index(self) -> usize {
        match self {
            Self::InUse => 0,
            Self::Region => 1,
            Self::Admin => 2,
        }
    }

    #[must_use]
    pub const fn mask(self) -> EnumerateMask {
        match self {
            Self::InUse => EnumerateMask::IN_USE,
            Self::Region => EnumerateMask::REGIONS,
            Self::Admin => EnumerateMask::ADMIN,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InUse => "in_use",
            Self::Region => "region",
            Self::Admin => "admin",
        }
    }
}

/// Range kinds a caller wants reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumerateMask(u32);

impl EnumerateMask {
    pub const IN_USE: Self = Self(1 << 0);
    pub const REGIONS: Self = Self(1 << 1);
    pub const ADMIN: Self = Self(1 << 2);
    pub const ALL: Self = Self(0b111);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Maps zone memory into the current process.
pub trait MemoryReader {
    /// Return a local pointer to `size` bytes at zone address `address`.
    ///
    /// The mapping must stay valid until the enumeration returns.
    fn read(&mut self, address: usize, size: usize) -> Option<*const u8>;
}

/// Reader for a zone in the current address space.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReader;

impl MemoryReader for LocalReader {
    fn read(&mut self, address: usize, _size: usize) -> Option<*const u8> {
        (address != 0).then_some(address as *const u8)
    }
}

impl<F: FnMut(usize, usize) -> Option<*const u8>> MemoryReader for F {
    fn read(&mut self, address: usize, size: usize) -> Option<*const u8> {
        self(address, size)
    }
}

/// Receives batches of ranges.
pub trait RangeRecorder {
    fn record(&mut self, kind: RangeKind, ranges: &[VmRange]);
}

impl<F: FnMut(RangeKind, &[VmRange])> RangeRecorder for F {
    fn record(&mut self, kind: RangeKind, ranges: &[VmRange]) {
        self(kind, ranges);
    }
}

struct RangeBatch<'a> {
    recorder: &'a mut dyn RangeRecorder,
    mask: EnumerateMask,
    pending: [[VmRange; MAX_RANGES_PER_BATCH]; 3],
    lens: [usize; 3],
}

impl<'a> RangeBatch<'a> {
    fn new(recorder: &'a mut dyn RangeRecorder, mask: EnumerateMask) -> Self {
        Self {
            recorder,
            mask,
            pending: [[VmRange::default(); MAX_RANGES_PER_BATCH]; 3],
            lens: [0; 3],
        }
    }

    fn wants(&self, kind: RangeKind) -> bool {
        self.mask.contains(kind.mask())
    }

    fn push(&mut self, kind: RangeKind, address: usize, size: usize) {
        if !self.wants(kind) {
            return;
        }
        let k = kind.index();
        self.pending[k][self.lens[k]] = VmRange { address, size };
        self.lens[k] += 1;
        if self.lens[k] == MAX_RANGES_PER_BATCH {
            self.flush(kind);
        }
    }

    fn flush(&mut self, kind: RangeKind) {
        let k = kind.index();
        if self.lens[k] != 0 {
            self.recorder.record(kind, &self.pending[k][..self.lens[k]]);
            self.lens[k] = 0;
        }
    }

    fn finish(mut self) {
        for kind in RangeKind::ALL {
            self.flush(kind);
        }
    }
}

/// Start addresses of admin blocks carved from tiny or small regions.
struct AdminSet {
    blocks: [usize; ADMIN_SET_CAPACITY],
    len: usize,
}

impl AdminSet {
    const fn new() -> Self {
        Self {
            blocks: [0; ADMIN_SET_CAPACITY],
            len: 0,
        }
    }

    fn insert(&mut self, address: usize) {
        if address != 0 && self.len < ADMIN_SET_CAPACITY && !self.contains(address) {
            self.blocks[self.len] = address;
            self.len += 1;
        }
    }

    fn contains(&self, address: usize) -> bool {
        self.blocks[..self.len].contains(&address)
    }
}

fn read(reader: &mut dyn MemoryReader, address: usize, size: usize) -> Result<*const u8, ZoneError> {
    reader
        .read(address, size)
        .filter(|p| !p.is_null())
        .ok_or(ZoneError::ReadFailed { address, size })
}

/// Record an admin table: page-backed ones directly, region-carved ones
/// by start address so the region walk reports them as admin.
fn note_admin(out: &mut RangeBatch<'_>, admin: &mut AdminSet, address: usize, bytes: usize, page_size: usize) {
    if address == 0 {
        return;
    }
    if admin_uses_pages(bytes) {
        out.push(RangeKind::Admin, address, round_up(bytes, page_size));
    } else {
        admin.insert(address);
    }
}

/// Region bases published in `table`, as atomics in reader memory.
///
/// # Safety
/// Memory returned by `reader` must stay valid for the returned lifetime.
unsafe fn region_entries<'t, const N: usize>(
    table: &'t RegionTable<N>,
    reader: &mut dyn MemoryReader,
    out: &mut RangeBatch<'_>,
    admin: &mut AdminSet,
    page_size: usize,
) -> Result<&'t [AtomicUsize], ZoneError> {
    let count = table.count();
    let block = table.array_block();
    if block == 0 {
        return Ok(&table.inline_entries()[..count.min(N)]);
    }

    let header_ptr = read(reader, block, size_of::<RegionArrayHeader>())?;
    // SAFETY: a published array starts with its header.
    let header = unsafe { header_ptr.cast::<RegionArrayHeader>().read_unaligned() };
    let bytes = region_array_bytes(header.capacity);
    let base = read(reader, block, bytes)?;

    let mut link = Some((block, header));
    while let Some((address, header)) = link {
        note_admin(out, admin, address, region_array_bytes(header.capacity), page_size);
        link = if header.previous == 0 {
            None
        } else {
            let p = read(reader, header.previous, size_of::<RegionArrayHeader>())?;
            // SAFETY: every chained array starts with its header.
            Some((header.previous, unsafe { p.cast::<RegionArrayHeader>().read_unaligned() }))
        };
    }

    let entries = base.wrapping_add(REGION_ARRAY_HEADER_WORDS * size_of::<usize>());
    // SAFETY: the block holds `header.capacity` initialized entry words.
    Ok(unsafe { slice::from_raw_parts(entries.cast::<AtomicUsize>(), count.min(header.capacity)) })
}

fn walk_tiny_region(
    reader: &mut dyn MemoryReader,
    out: &mut RangeBatch<'_>,
    admin: &AdminSet,
    cached: usize,
    base: usize,
) -> Result<(), ZoneError> {
    out.push(RangeKind::Region, base, TINY_REGION_SIZE);
    out.push(RangeKind::Admin, base + TINY_METADATA_OFFSET, TINY_METADATA_SIZE);
    if !out.wants(RangeKind::InUse) && !out.wants(RangeKind::Admin) {
        return Ok(());
    }
    let meta = read(reader, base + TINY_METADATA_OFFSET, TINY_METADATA_SIZE)?;
    // SAFETY: `meta` maps both bitmaps for the rest of the walk.
    let (starts, in_use) = unsafe {
        (
            Bitmap::from_ptr(meta),
            Bitmap::from_ptr(meta.wrapping_add(TINY_BITMAP_WORDS * 4)),
        )
    };
    let mut i = 0;
    while i < NUM_TINY_BLOCKS {
        let next = starts.next_set_after(i, NUM_TINY_BLOCKS);
        if in_use.get(i) {
            let address = base + (i << SHIFT_TINY_QUANTUM);
            let size = (next - i) << SHIFT_TINY_QUANTUM;
            if admin.contains(address) {
                out.push(RangeKind::Admin, address, size);
            } else if address != cached {
                out.push(RangeKind::InUse, address, size);
            }
        }
        i = next;
    }
    Ok(())
}

fn walk_small_region(
    reader: &mut dyn MemoryReader,
    out: &mut RangeBatch<'_>,
    admin: &AdminSet,
    base: usize,
) -> Result<(), ZoneError> {
    out.push(RangeKind::Region, base, SMALL_REGION_SIZE);
    out.push(RangeKind::Admin, base + SMALL_METADATA_OFFSET, SMALL_METADATA_SIZE);
    if !out.wants(RangeKind::InUse) && !out.wants(RangeKind::Admin) {
        return Ok(());
    }
    let tags = read(reader, base + SMALL_METADATA_OFFSET, SMALL_METADATA_SIZE)?.cast::<AtomicU16>();
    let mut i = 0;
    while i < NUM_SMALL_BLOCKS {
        // SAFETY: i < NUM_SMALL_BLOCKS, inside the mapped tag array.
        let word = unsafe { (*tags.add(i)).load(Ordering::Relaxed) };
        match SmallTag::decode(word) {
            SmallTag::InUse(msize) => {
                let msize = msize.min(NUM_SMALL_BLOCKS - i);
                let address = base + (i << SHIFT_SMALL_QUANTUM);
                let kind = if admin.contains(address) {
                    RangeKind::Admin
                } else {
                    RangeKind::InUse
                };
                out.push(kind, address, msize << SHIFT_SMALL_QUANTUM);
                i += msize;
            }
            SmallTag::Free(msize) => i += msize,
            // Mid-update from a concurrent writer.
            SmallTag::Middle => i += 1,
        }
    }
    Ok(())
}

/// Enumerate the zone at `zone_address`.
///
/// # Safety
/// `zone_address` must be the address of a zone that stays mapped for the
/// duration of the call, as seen through `reader`.
pub unsafe fn enumerate(
    zone_address: usize,
    mask: EnumerateMask,
    reader: &mut dyn MemoryReader,
    recorder: &mut dyn RangeRecorder,
) -> Result<(), ZoneError> {
    let zone = read(reader, zone_address, size_of::<PublishedState>())?;
    // SAFETY: the zone starts with its published state.
    let published = unsafe { &*zone.cast::<PublishedState>() };
    if !published.is_valid() {
        return Err(ZoneError::InvariantViolation {
            what: "zone header magic",
            address: zone_address,
        });
    }
    let page_shift = published.page_shift;
    let page_size = 1usize << page_shift;
    let cached = published.last_free.peek().map_or(0, |(address, _)| address);

    let mut out = RangeBatch::new(recorder, mask);
    let mut admin = AdminSet::new();
    admin.insert(zone_address);

    let large_capacity = published.large.capacity();
    let large_storage = published.large.storage();
    note_admin(&mut out, &mut admin, large_storage, large_table_bytes(large_capacity), page_size);
    let huge_count = published.huge.count();
    let huge_capacity = published.huge.capacity();
    let huge_storage = published.huge.storage();
    note_admin(&mut out, &mut admin, huge_storage, huge_table_bytes(huge_capacity), page_size);

    // SAFETY: reader contract.
    let tiny = unsafe { region_entries(&published.tiny_regions, reader, &mut out, &mut admin, page_size)? };
    let small = unsafe { region_entries(&published.small_regions, reader, &mut out, &mut admin, page_size)? };

    for entry in tiny {
        walk_tiny_region(reader, &mut out, &admin, cached, entry.load(Ordering::Relaxed))?;
    }
    for entry in small {
        walk_small_region(reader, &mut out, &admin, entry.load(Ordering::Relaxed))?;
    }

    if large_storage != 0 && large_capacity != 0 {
        let slots = read(reader, large_storage, large_table_bytes(large_capacity))?.cast::<AtomicUsize>();
        for index in 0..large_capacity {
            // SAFETY: index < capacity words mapped above.
            let word = unsafe { (*slots.add(index)).load(Ordering::Acquire) };
            if let Some(entry) = LargeEntry::unpack(word, page_shift) {
                out.push(RangeKind::InUse, entry.address, entry.size(page_shift));
                out.push(RangeKind::Region, entry.address, entry.size(page_shift));
            }
        }
    }
    if huge_storage != 0 && huge_count != 0 {
        let count = huge_count.min(huge_capacity);
        let entries = read(reader, huge_storage, huge_table_bytes(count))?.cast::<HugeEntry>();
        for index in 0..count {
            // SAFETY: index < count entries mapped above.
            let entry = unsafe { &*entries.add(index) };
            let address = entry.address.load(Ordering::Relaxed);
            let size = entry.size.load(Ordering::Relaxed);
            out.push(RangeKind::InUse, address, size);
            out.push(RangeKind::Region, address, size);
        }
    }

    out.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_bits_match_kinds() {
        assert!(EnumerateMask::ALL.contains(EnumerateMask::IN_USE));
        assert!(!EnumerateMask::IN_USE.contains(EnumerateMask::ADMIN));
        assert_eq!(EnumerateMask::from_bits_truncate(0xff), EnumerateMask::ALL);
        assert_eq!(
            EnumerateMask::IN_USE.union(EnumerateMask::REGIONS).bits(),
            0b011
        );
        assert_eq!(RangeKind::Admin.mask(), EnumerateMask::ADMIN);
    }

    #[test]
    fn batches_are_capped_and_filtered() {
        let mut seen = Vec::new();
        let mut recorder = |kind: RangeKind, ranges: &[VmRange]| seen.push((kind, ranges.len()));
        let mut out = RangeBatch::new(&mut recorder, EnumerateMask::IN_USE);
        for i in 0..600 {
            out.push(RangeKind::InUse, i * 32, 32);
            out.push(RangeKind::Admin, i * 32, 32);
        }
        out.finish();
        assert_eq!(
            seen,
            vec![(RangeKind::InUse, 256), (RangeKind::InUse, 256), (RangeKind::InUse, 88)]
        );
    }

    #[test]
    fn admin_set_ignores_null_and_duplicates() {
        let mut set = AdminSet::new();
        set.insert(0);
        set.insert(0x1000);
        set.insert(0x1000);
        assert_eq!(set.len, 1);
        assert!(set.contains(0x1000));
        assert!(!set.contains(0x2000));
    }

    #[test]
    fn failed_read_is_reported() {
        let mut reader = |_: usize, _: usize| -> Option<*const u8> { None };
        let mut recorder = |_: RangeKind, _: &[VmRange]| {};
        let err = unsafe { enumerate(0x4000, EnumerateMask::ALL, &mut reader, &mut recorder) };
        assert_eq!(
            err,
            Err(ZoneError::ReadFailed {
                address: 0x4000,
                size: size_of::<PublishedState>()
            })
        );
    }
}
