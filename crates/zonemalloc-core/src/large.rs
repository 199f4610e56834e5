//! Large and huge bookkeeping.
//!
//! Every large or huge allocation is its own page-provider extent. Large
//! blocks (fewer than `page_size` pages) are tracked in an open-addressed
//! hash table of packed `address | num_pages` words keyed by
//! `address >> page_shift`; a zero word is an empty slot. Huge blocks live
//! in a flat array of `(address, size)` pairs.
//!
//! Both tables are mutated only under the zone lock, but every word is an
//! atomic so the enumerator can read them concurrently. Growth writes the
//! new storage completely, publishes the storage pointer, then the
//! capacity; only then does the old storage get released by the caller.

use core::mem::size_of;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// First capacity of the large table.
pub const LARGE_TABLE_INITIAL_CAPACITY: usize = 63;
/// First capacity of the huge array.
pub const HUGE_TABLE_INITIAL_CAPACITY: usize = 8;

/// Whether a block of `num_pages` pages is huge.
#[inline]
#[must_use]
pub const fn is_huge(num_pages: usize, page_shift: u32) -> bool {
    num_pages >= 1 << page_shift
}

/// Decoded large-table word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeEntry {
    pub address: usize,
    pub num_pages: usize,
}

impl LargeEntry {
    #[must_use]
    pub const fn pack(self) -> usize {
        self.address | self.num_pages
    }

    #[must_use]
    pub const fn unpack(word: usize, page_shift: u32) -> Option<Self> {
        if word == 0 {
            return None;
        }
        let mask = (1usize << page_shift) - 1;
        Some(Self {
            address: word & !mask,
            num_pages: word & mask,
        })
    }

    #[must_use]
    pub const fn size(self, page_shift: u32) -> usize {
        self.num_pages << page_shift
    }
}

/// Bytes of storage for a large table of `capacity` slots.
#[must_use]
pub const fn large_table_bytes(capacity: usize) -> usize {
    capacity * size_of::<usize>()
}

fn home_slot(address: usize, page_shift: u32, capacity: usize) -> usize {
    (address >> page_shift) % capacity
}

/// # Safety
/// `slots` must hold `capacity` words and a free slot must exist.
unsafe fn insert_word(slots: *const AtomicUsize, capacity: usize, word: usize, page_shift: u32) {
    let mut index = home_slot(word, page_shift, capacity);
    loop {
        // SAFETY: index < capacity.
        let slot = unsafe { &*slots.add(index) };
        if slot.load(Ordering::Relaxed) == 0 {
            slot.store(word, Ordering::Release);
            return;
        }
        index = (index + 1) % capacity;
    }
}

/// Open-addressed large-entry table.
#[repr(C)]
#[derive(Debug, Default)]
pub struct LargeTable {
    entries: AtomicUsize,
    capacity: AtomicUsize,
    in_use: AtomicUsize,
}

impl LargeTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Address of the slot storage (0 before the first insert).
    #[must_use]
    pub fn storage(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    /// Capacity first, then storage: a reader never sees more slots than
    /// the storage it reads holds.
    fn slots(&self) -> (*const AtomicUsize, usize) {
        let capacity = self.capacity();
        (self.storage() as *const AtomicUsize, capacity)
    }

    fn slot(&self, index: usize) -> &AtomicUsize {
        let (slots, capacity) = self.slots();
        debug_assert!(index < capacity);
        // SAFETY: index < capacity and published storage holds `capacity` words.
        unsafe { &*slots.add(index) }
    }

    /// Whether one more insert would push occupancy past 25%.
    #[must_use]
    pub fn needs_growth(&self) -> bool {
        (self.in_use.load(Ordering::Relaxed) + 1) * 4 > self.capacity.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn next_capacity(&self) -> usize {
        match self.capacity.load(Ordering::Relaxed) {
            0 => LARGE_TABLE_INITIAL_CAPACITY,
            capacity => capacity * 2 + 1,
        }
    }

    /// Find the entry for `address`.
    #[must_use]
    pub fn lookup(&self, address: usize, page_shift: u32) -> Option<(usize, LargeEntry)> {
        let (slots, capacity) = self.slots();
        if capacity == 0 || slots.is_null() {
            return None;
        }
        let mut index = home_slot(address, page_shift, capacity);
        for _ in 0..capacity {
            // SAFETY: index < capacity.
            let word = unsafe { (*slots.add(index)).load(Ordering::Acquire) };
            let entry = LargeEntry::unpack(word, page_shift)?;
            if entry.address == address {
                return Some((index, entry));
            }
            index = (index + 1) % capacity;
        }
        None
    }

    /// Rehash every entry into `storage` and publish it.
    ///
    /// Returns the previous storage `(address, capacity)` for the caller to
    /// release, if there was one.
    ///
    /// # Safety
    /// Caller holds the zone lock; `storage` is zeroed, word aligned and
    /// holds `new_capacity` words.
    pub unsafe fn rehash_into(
        &self,
        storage: NonNull<u8>,
        new_capacity: usize,
        page_shift: u32,
    ) -> Option<(usize, usize)> {
        let (old, old_capacity) = self.slots();
        let new_slots = storage.as_ptr().cast::<AtomicUsize>().cast_const();
        for index in 0..old_capacity {
            // SAFETY: index < old capacity.
            let word = unsafe { (*old.add(index)).load(Ordering::Relaxed) };
            if word != 0 {
                // SAFETY: the new table is larger than the live entry count.
                unsafe { insert_word(new_slots, new_capacity, word, page_shift) };
            }
        }
        self.entries.store(storage.as_ptr() as usize, Ordering::Release);
        self.capacity.store(new_capacity, Ordering::Release);
        (!old.is_null()).then_some((old as usize, old_capacity))
    }

    /// Insert an entry. Caller holds the lock and has grown the table.
    pub fn insert(&self, entry: LargeEntry, page_shift: u32) {
        let (slots, capacity) = self.slots();
        debug_assert!(self.in_use.load(Ordering::Relaxed) < capacity);
        // SAFETY: growth ran first, so a free slot exists.
        unsafe { insert_word(slots, capacity, entry.pack(), page_shift) };
        self.in_use.fetch_add(1, Ordering::Release);
    }

    /// Overwrite the entry at `index` (same address, new page count).
    pub fn update(&self, index: usize, entry: LargeEntry) {
        self.slot(index).store(entry.pack(), Ordering::Release);
    }

    /// Remove the entry at `index`, then re-place the rest of its probe
    /// chain so lookups never stop early at the hole.
    pub fn remove_at(&self, index: usize, page_shift: u32) {
        let (slots, capacity) = self.slots();
        self.slot(index).store(0, Ordering::Release);
        self.in_use.fetch_sub(1, Ordering::Release);
        let mut next = (index + 1) % capacity;
        loop {
            let slot = self.slot(next);
            let word = slot.load(Ordering::Relaxed);
            if word == 0 {
                break;
            }
            slot.store(0, Ordering::Relaxed);
            // SAFETY: we just emptied a slot, so a free one exists.
            unsafe { insert_word(slots, capacity, word, page_shift) };
            next = (next + 1) % capacity;
        }
    }

    /// Live entries, in slot order.
    pub fn iter(&self, page_shift: u32) -> impl Iterator<Item = LargeEntry> + '_ {
        let (slots, capacity) = self.slots();
        let capacity = if slots.is_null() { 0 } else { capacity };
        (0..capacity).filter_map(move |index| {
            // SAFETY: index < capacity.
            let word = unsafe { (*slots.add(index)).load(Ordering::Acquire) };
            LargeEntry::unpack(word, page_shift)
        })
    }
}

/// One huge allocation.
#[repr(C)]
#[derive(Debug, Default)]
pub struct HugeEntry {
    pub address: AtomicUsize,
    pub size: AtomicUsize,
}

/// Bytes of storage for a huge array of `capacity` entries.
#[must_use]
pub const fn huge_table_bytes(capacity: usize) -> usize {
    capacity * size_of::<HugeEntry>()
}

/// Flat array of huge entries.
#[repr(C)]
#[derive(Debug, Default)]
pub struct HugeTable {
    entries: AtomicUsize,
    capacity: AtomicUsize,
    count: AtomicUsize,
}

impl HugeTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
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

    #[must_use]
    pub fn storage(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    fn entry(&self, index: usize) -> &HugeEntry {
        // SAFETY: callers only pass indices below the published count.
        unsafe { &*(self.storage() as *const HugeEntry).add(index) }
    }

    #[must_use]
    pub fn needs_growth(&self) -> bool {
        self.count.load(Ordering::Relaxed) >= self.capacity.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn next_capacity(&self) -> usize {
        (self.capacity.load(Ordering::Relaxed) * 2).max(HUGE_TABLE_INITIAL_CAPACITY)
    }

    /// Copy every entry into `storage` and publish it.
    ///
    /// # Safety
    /// Caller holds the zone lock; `storage` is word aligned and holds
    /// `new_capacity` entries.
    pub unsafe fn grow_into(&self, storage: NonNull<u8>, new_capacity: usize) -> Option<(usize, usize)> {
        let old = self.storage();
        let old_capacity = self.capacity.load(Ordering::Relaxed);
        let count = self.count.load(Ordering::Relaxed);
        let fresh = storage.as_ptr().cast::<HugeEntry>();
        for index in 0..count {
            let from = self.entry(index);
            // SAFETY: index < count <= new_capacity.
            let to = unsafe { &*fresh.add(index) };
            to.address.store(from.address.load(Ordering::Relaxed), Ordering::Relaxed);
            to.size.store(from.size.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.entries.store(storage.as_ptr() as usize, Ordering::Release);
        self.capacity.store(new_capacity, Ordering::Release);
        (old != 0).then_some((old, old_capacity))
    }

    /// Append an entry. Caller holds the lock and has grown the array.
    pub fn push(&self, address: usize, size: usize) {
        let count = self.count.load(Ordering::Relaxed);
        debug_assert!(count < self.capacity.load(Ordering::Relaxed));
        // SAFETY: count < capacity.
        let slot = unsafe { &*(self.storage() as *const HugeEntry).add(count) };
        slot.address.store(address, Ordering::Relaxed);
        slot.size.store(size, Ordering::Relaxed);
        self.count.store(count + 1, Ordering::Release);
    }

    #[must_use]
    pub fn find(&self, address: usize) -> Option<(usize, usize)> {
        (0..self.count()).find_map(|index| {
            let entry = self.entry(index);
            (entry.address.load(Ordering::Relaxed) == address)
                .then(|| (index, entry.size.load(Ordering::Relaxed)))
        })
    }

    pub fn set_size(&self, index: usize, size: usize) {
        self.entry(index).size.store(size, Ordering::Relaxed);
    }

    /// Remove by moving the last entry into `index`.
    pub fn swap_remove(&self, index: usize) {
        let last = self.count.load(Ordering::Relaxed) - 1;
        if index != last {
            let (to, from) = (self.entry(index), self.entry(last));
            to.address.store(from.address.load(Ordering::Relaxed), Ordering::Relaxed);
            to.size.store(from.size.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.count.store(last, Ordering::Release);
    }

    /// `(address, size)` of every huge block.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.count()).map(|index| {
            let entry = self.entry(index);
            (entry.address.load(Ordering::Relaxed), entry.size.load(Ordering::Relaxed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIFT: u32 = 12;

    fn storage(words: usize) -> (Vec<usize>, NonNull<u8>) {
        let mut v = vec![0usize; words];
        let p = NonNull::new(v.as_mut_ptr().cast::<u8>()).unwrap();
        (v, p)
    }

    fn entry(page: usize, num_pages: usize) -> LargeEntry {
        LargeEntry {
            address: page << SHIFT,
            num_pages,
        }
    }

    #[test]
    fn pack_round_trip_and_classification() {
        let e = entry(0x1234, 17);
        assert_eq!(LargeEntry::unpack(e.pack(), SHIFT), Some(e));
        assert_eq!(LargeEntry::unpack(0, SHIFT), None);
        assert_eq!(e.size(SHIFT), 17 * 4096);
        assert!(!is_huge(4095, SHIFT));
        assert!(is_huge(4096, SHIFT));
    }

    #[test]
    fn growth_keeps_occupancy_under_a_quarter() {
        let table = LargeTable::new();
        let mut keep = Vec::new();
        for page in 1..=40usize {
            if table.needs_growth() {
                let capacity = table.next_capacity();
                let (v, p) = storage(capacity);
                unsafe { table.rehash_into(p, capacity, SHIFT) };
                keep.push(v);
            }
            table.insert(entry(page, 1), SHIFT);
            assert!(table.in_use() * 4 <= table.capacity());
        }
        assert_eq!(table.capacity(), 255);
        for page in 1..=40usize {
            assert_eq!(table.lookup(page << SHIFT, SHIFT).map(|(_, e)| e), Some(entry(page, 1)));
        }
        assert_eq!(table.iter(SHIFT).count(), 40);
    }

    #[test]
    fn remove_rehashes_probe_chain() {
        let table = LargeTable::new();
        let (_v, p) = storage(LARGE_TABLE_INITIAL_CAPACITY);
        unsafe { table.rehash_into(p, LARGE_TABLE_INITIAL_CAPACITY, SHIFT) };
        // Three pages that share a home slot.
        let colliding: Vec<_> = (0..3).map(|k| 5 + k * LARGE_TABLE_INITIAL_CAPACITY).collect();
        for &page in &colliding {
            table.insert(entry(page, 2), SHIFT);
        }
        let (first, _) = table.lookup(colliding[0] << SHIFT, SHIFT).unwrap();
        table.remove_at(first, SHIFT);
        assert_eq!(table.in_use(), 2);
        assert!(table.lookup(colliding[0] << SHIFT, SHIFT).is_none());
        for &page in &colliding[1..] {
            assert!(table.lookup(page << SHIFT, SHIFT).is_some(), "chain broken for page {page}");
        }
    }

    #[test]
    fn update_changes_page_count_in_place() {
        let table = LargeTable::new();
        let (_v, p) = storage(LARGE_TABLE_INITIAL_CAPACITY);
        unsafe { table.rehash_into(p, LARGE_TABLE_INITIAL_CAPACITY, SHIFT) };
        table.insert(entry(9, 3), SHIFT);
        let (index, _) = table.lookup(9 << SHIFT, SHIFT).unwrap();
        table.update(index, entry(9, 8));
        assert_eq!(table.lookup(9 << SHIFT, SHIFT), Some((index, entry(9, 8))));
    }

    #[test]
    fn huge_array_grows_and_swap_removes() {
        let huge = HugeTable::new();
        let mut keep = Vec::new();
        for k in 1..=10usize {
            if huge.needs_growth() {
                let capacity = huge.next_capacity();
                let (v, p) = storage(capacity * 2);
                unsafe { huge.grow_into(p, capacity) };
                keep.push(v);
            }
            huge.push(k << 24, k << 20);
        }
        assert_eq!(huge.capacity(), 16);
        assert_eq!(huge.find(3 << 24), Some((2, 3 << 20)));
        huge.swap_remove(2);
        assert_eq!(huge.count(), 9);
        assert_eq!(huge.find(3 << 24), None);
        assert_eq!(huge.find(10 << 24), Some((2, 10 << 20)));
        huge.set_size(2, 1);
        assert!(huge.iter().any(|e| e == (10 << 24, 1)));
    }
}
