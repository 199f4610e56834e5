//! Region bookkeeping shared by the tiny and small allocators.
//!
//! A [`RegionTable`] is the lock-free-readable list of region base
//! addresses. It starts with an inline array inside the zone and spills into
//! a separately allocated array block when full. The growth contract:
//!
//! 1. the new array block is fully written (header, copied entries);
//! 2. the array pointer is published, then the capacity;
//! 3. only later does `count` grow past the old capacity.
//!
//! A reader that loads `count` (Acquire) and then the array pointer
//! (Acquire) therefore always sees at least `count` valid entries. Old
//! array blocks are never released; each block links to its predecessor so
//! the enumerator can still report them as admin memory.

use core::mem::size_of;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Inline capacity of the tiny region table.
pub const INITIAL_TINY_REGIONS: usize = 16;
/// Inline capacity of the small region table.
pub const INITIAL_SMALL_REGIONS: usize = 4;

/// Words before the entries of a spilled array block.
pub const REGION_ARRAY_HEADER_WORDS: usize = 2;

/// Header of a spilled region array block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionArrayHeader {
    /// Previous spilled block, or 0 if the previous array was inline.
    pub previous: usize,
    /// Number of entry slots following the header.
    pub capacity: usize,
}

/// Bytes needed for a spilled array block holding `capacity` entries.
#[must_use]
pub const fn region_array_bytes(capacity: usize) -> usize {
    (REGION_ARRAY_HEADER_WORDS + capacity) * size_of::<usize>()
}

/// Growable table of region base addresses.
#[repr(C)]
#[derive(Debug)]
pub struct RegionTable<const N: usize> {
    array: AtomicUsize,
    capacity: AtomicUsize,
    count: AtomicUsize,
    inline: [AtomicUsize; N],
}

impl<const N: usize> Default for RegionTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RegionTable<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            array: AtomicUsize::new(0),
            capacity: AtomicUsize::new(N),
            count: AtomicUsize::new(0),
            inline: [const { AtomicUsize::new(0) }; N],
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Address of the current spilled array block, 0 while inline.
    #[must_use]
    pub fn array_block(&self) -> usize {
        self.array.load(Ordering::Acquire)
    }

    /// Every spilled array block, newest first, following the header links.
    ///
    /// Caller holds the zone lock or otherwise keeps the zone alive.
    pub fn array_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        let newest = self.array_block();
        core::iter::successors((newest != 0).then_some(newest), |&block| {
            // SAFETY: spilled blocks are never released and start with a header.
            let previous = unsafe { (*(block as *const RegionArrayHeader)).previous };
            (previous != 0).then_some(previous)
        })
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count.load(Ordering::Relaxed) >= self.capacity.load(Ordering::Relaxed)
    }

    fn entries(&self) -> *const AtomicUsize {
        let block = self.array.load(Ordering::Acquire);
        if block == 0 {
            self.inline.as_ptr()
        } else {
            // SAFETY: a published block holds the header followed by entries.
            unsafe { (block as *const AtomicUsize).add(REGION_ARRAY_HEADER_WORDS) }
        }
    }

    /// Iterate the published regions without locking.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let count = self.count();
        let entries = self.entries();
        // SAFETY: publish-then-count guarantees `count` initialized entries.
        (0..count).map(move |i| unsafe { (*entries.add(i)).load(Ordering::Relaxed) })
    }

    #[must_use]
    pub fn contains(&self, base: usize) -> bool {
        self.iter().any(|r| r == base)
    }

    /// Most recently added region.
    #[must_use]
    pub fn last(&self) -> Option<usize> {
        let count = self.count();
        let entries = self.entries();
        // SAFETY: as in `iter`.
        (count > 0).then(|| unsafe { (*entries.add(count - 1)).load(Ordering::Relaxed) })
    }

    /// Append a region. Caller holds the zone lock and has ensured room.
    pub fn push(&self, base: usize) {
        let count = self.count.load(Ordering::Relaxed);
        debug_assert!(count < self.capacity.load(Ordering::Relaxed));
        // SAFETY: count < capacity, so the slot exists in the current array.
        unsafe { (*self.entries().add(count)).store(base, Ordering::Relaxed) };
        self.count.store(count + 1, Ordering::Release);
    }

    /// Move the table into `block`, which can hold `new_capacity` entries.
    ///
    /// # Safety
    /// Caller holds the zone lock; `block` is writable for
    /// [`region_array_bytes`]`(new_capacity)`, word aligned, and never freed.
    pub unsafe fn grow_into(&self, block: NonNull<u8>, new_capacity: usize) {
        let count = self.count.load(Ordering::Relaxed);
        debug_assert!(new_capacity >= count);
        let header = block.as_ptr().cast::<RegionArrayHeader>();
        let entries = block.as_ptr().cast::<AtomicUsize>();
        // SAFETY: caller contract; nothing else sees the block yet.
        unsafe {
            header.write(RegionArrayHeader {
                previous: self.array.load(Ordering::Relaxed),
                capacity: new_capacity,
            });
            let old = self.entries();
            for i in 0..count {
                let value = (*old.add(i)).load(Ordering::Relaxed);
                (*entries.add(REGION_ARRAY_HEADER_WORDS + i)).store(value, Ordering::Relaxed);
            }
        }
        self.array.store(block.as_ptr() as usize, Ordering::Release);
        self.capacity.store(new_capacity, Ordering::Release);
    }

    /// Raw view of the inline slots, for readers working on a copied table.
    #[must_use]
    pub fn inline_entries(&self) -> &[AtomicUsize; N] {
        &self.inline
    }
}

/// Untouched space at the end of the newest region.
///
/// `start..num_blocks` has never been handed out since it was last merged
/// back; `pristine..` has never been written at all and is still zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tail {
    pub region: usize,
    pub start: usize,
    pub pristine: usize,
}

impl Tail {
    #[must_use]
    pub const fn new(region: usize) -> Self {
        Self {
            region,
            start: 0,
            pristine: 0,
        }
    }

    #[must_use]
    pub const fn available(&self, num_blocks: usize) -> usize {
        num_blocks - self.start
    }

    /// Quanta of the next `msize`-quanta carve that may hold old data.
    #[must_use]
    pub fn dirty_quanta(&self, msize: usize) -> usize {
        self.pristine.saturating_sub(self.start).min(msize)
    }

    /// Advance past a carved block of `msize` quanta.
    pub fn carve(&mut self, msize: usize) {
        self.start += msize;
        self.pristine = self.pristine.max(self.start);
    }
}

/// Base of the `region_size`-aligned region that would contain `addr`.
#[inline]
#[must_use]
pub const fn region_base(addr: usize, region_size: usize) -> usize {
    addr & !(region_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_then_spilled_preserves_entries() {
        let table: RegionTable<2> = RegionTable::new();
        table.push(0x1000);
        table.push(0x2000);
        assert!(table.is_full());
        assert_eq!(table.array_block(), 0);

        let mut storage = vec![0usize; REGION_ARRAY_HEADER_WORDS + 4];
        let block = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { table.grow_into(block, 4) };
        assert_eq!(table.capacity(), 4);
        assert_eq!(table.array_block(), block.as_ptr() as usize);
        assert_eq!(storage[0], 0, "first spill links to the inline array");
        assert_eq!(storage[1], 4);

        table.push(0x3000);
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(table.last(), Some(0x3000));
        assert!(table.contains(0x2000));
        assert!(!table.contains(0x4000));
        // Inline slots still hold the old entries for readers that raced.
        assert_eq!(table.inline_entries()[1].load(Ordering::Relaxed), 0x2000);
    }

    #[test]
    fn second_spill_links_previous_block() {
        let table: RegionTable<1> = RegionTable::new();
        table.push(1 << 21);
        let mut first = vec![0usize; REGION_ARRAY_HEADER_WORDS + 2];
        let mut second = vec![0usize; REGION_ARRAY_HEADER_WORDS + 4];
        let first_block = NonNull::new(first.as_mut_ptr().cast::<u8>()).unwrap();
        let second_block = NonNull::new(second.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { table.grow_into(first_block, 2) };
        table.push(2 << 21);
        unsafe { table.grow_into(second_block, 4) };
        assert_eq!(second[0], first_block.as_ptr() as usize);
        assert_eq!(table.iter().count(), 2);
        assert_eq!(
            table.array_blocks().collect::<Vec<_>>(),
            vec![second_block.as_ptr() as usize, first_block.as_ptr() as usize]
        );
    }

    #[test]
    fn tail_tracks_dirty_prefix() {
        let mut tail = Tail::new(0x20_0000);
        assert_eq!(tail.dirty_quanta(4), 0);
        tail.carve(4);
        assert_eq!((tail.start, tail.pristine), (4, 4));
        // Blocks 2..4 merge back into the tail.
        tail.start = 2;
        assert_eq!(tail.dirty_quanta(1), 1);
        assert_eq!(tail.dirty_quanta(5), 2);
        tail.carve(5);
        assert_eq!((tail.start, tail.pristine), (7, 7));
    }

    #[test]
    fn region_base_masks_low_bits() {
        assert_eq!(region_base(0x40_1234, 0x20_0000), 0x40_0000);
        assert_eq!(region_base(0x40_0000, 0x20_0000), 0x40_0000);
    }
}
