//! Tiny size class.
//!
//! Quantum of four machine words, blocks of 1..=31 quanta, served from
//! region-size-aligned regions. Each region ends with two bitmaps holding
//! one bit per quantum:
//!
//! | start | in use | meaning                                         |
//! |-------|--------|-------------------------------------------------|
//! | 1     | 1      | in-use block; size = distance to next start bit |
//! | 1     | 0      | free block (or the region's untouched tail)     |
//! | 0     | 0      | middle of the preceding block                   |
//!
//! A permanent start+in-use sentinel sits at `NUM_TINY_BLOCKS` so every
//! block is terminated. The bitmaps are atomics so the enumerator can walk
//! them while the zone mutates them.

use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::config::SCRIBBLE_BYTE;
use crate::error::{CorruptionKind, ZoneError};
use crate::free_list::{
    CATCH_ALL_SLOT, FreeLists, read_leading_msize, read_trailing_msize, slot_for,
    write_leading_msize, write_trailing_msize,
};
use crate::region::{Tail, region_base};

#[cfg(target_pointer_width = "64")]
pub const SHIFT_TINY_QUANTUM: usize = 5;
#[cfg(not(target_pointer_width = "64"))]
pub const SHIFT_TINY_QUANTUM: usize = 4;

pub const TINY_QUANTUM: usize = 1 << SHIFT_TINY_QUANTUM;
/// Largest msize handed out by the tiny class.
pub const TINY_MAX_MSIZE: usize = 31;
/// Largest request size served by the tiny class.
pub const TINY_LIMIT: usize = TINY_MAX_MSIZE * TINY_QUANTUM;
pub const TINY_REGION_SIZE: usize = 1 << (SHIFT_TINY_QUANTUM + 16);
pub const NUM_TINY_BLOCKS: usize = num_tiny_blocks();
pub const TINY_BITMAP_WORDS: usize = NUM_TINY_BLOCKS / 32 + 1;
/// Offset of the start bitmap inside a region.
pub const TINY_METADATA_OFFSET: usize = NUM_TINY_BLOCKS * TINY_QUANTUM;
/// Both bitmaps.
pub const TINY_METADATA_SIZE: usize = 2 * TINY_BITMAP_WORDS * 4;
/// Blocks below this msize go through the last-free cache.
pub const TINY_CACHE_MSIZE_LIMIT: usize = TINY_QUANTUM;

const _: () = assert!(TINY_METADATA_OFFSET + TINY_METADATA_SIZE <= TINY_REGION_SIZE);
const _: () = assert!(NUM_TINY_BLOCKS < u16::MAX as usize);

const fn num_tiny_blocks() -> usize {
    let mut n = TINY_REGION_SIZE / TINY_QUANTUM;
    while n * TINY_QUANTUM + 2 * (n / 32 + 1) * 4 > TINY_REGION_SIZE {
        n -= 1;
    }
    n
}

/// Quanta needed for `size` bytes (at least one).
#[inline]
#[must_use]
pub const fn tiny_msize_for(size: usize) -> usize {
    if size == 0 {
        1
    } else {
        (size + TINY_QUANTUM - 1) >> SHIFT_TINY_QUANTUM
    }
}

/// One-bit-per-quantum bitmap over atomic words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap(*const AtomicU32);

impl Bitmap {
    /// # Safety
    /// `words` must be 4-aligned and readable for [`TINY_BITMAP_WORDS`]
    /// words for as long as the bitmap is used.
    #[must_use]
    pub const unsafe fn from_ptr(words: *const u8) -> Self {
        Self(words.cast())
    }

    #[inline]
    fn word(self, w: usize) -> &'static AtomicU32 {
        debug_assert!(w < TINY_BITMAP_WORDS);
        // SAFETY: from_ptr contract.
        unsafe { &*self.0.add(w) }
    }

    #[inline]
    #[must_use]
    pub fn get(self, i: usize) -> bool {
        (self.word(i >> 5).load(Ordering::Relaxed) >> (i & 31)) & 1 != 0
    }

    #[inline]
    pub fn set(self, i: usize) {
        self.word(i >> 5).fetch_or(1 << (i & 31), Ordering::Relaxed);
    }

    #[inline]
    pub fn clear(self, i: usize) {
        self.word(i >> 5).fetch_and(!(1 << (i & 31)), Ordering::Relaxed);
    }

    /// First set bit in `(i, limit]`, or `limit` if there is none.
    #[must_use]
    pub fn next_set_after(self, i: usize, limit: usize) -> usize {
        let mut bit = i + 1;
        while bit <= limit {
            let bits = self.word(bit >> 5).load(Ordering::Relaxed) >> (bit & 31);
            if bits != 0 {
                return (bit + bits.trailing_zeros() as usize).min(limit);
            }
            bit = (bit | 31) + 1;
        }
        limit
    }

    /// Last set bit in `[0, i)`.
    #[must_use]
    pub fn prev_set_before(self, i: usize) -> Option<usize> {
        let mut end = i;
        while end > 0 {
            let w = (end - 1) >> 5;
            let keep = end - (w << 5);
            let mask = if keep == 32 { u32::MAX } else { (1u32 << keep) - 1 };
            let bits = self.word(w).load(Ordering::Relaxed) & mask;
            if bits != 0 {
                return Some((w << 5) + 31 - bits.leading_zeros() as usize);
            }
            end = w << 5;
        }
        None
    }
}

/// Handle to a live tiny region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TinyRegion(usize);

impl TinyRegion {
    /// # Safety
    /// `base` must be a mapped, [`TINY_REGION_SIZE`]-aligned tiny region
    /// that outlives every use of the handle.
    #[must_use]
    pub const unsafe fn from_base(base: usize) -> Self {
        Self(base)
    }

    /// Region containing `addr`, if `addr` lies in a tiny region.
    ///
    /// # Safety
    /// `regions` must only yield live tiny regions.
    #[must_use]
    pub unsafe fn containing(addr: usize, mut regions: impl Iterator<Item = usize>) -> Option<Self> {
        let base = region_base(addr, TINY_REGION_SIZE);
        regions.any(|r| r == base).then_some(Self(base))
    }

    #[must_use]
    pub const fn base(self) -> usize {
        self.0
    }

    pub fn start_bits(self) -> Bitmap {
        // SAFETY: the metadata area is inside the live region.
        unsafe { Bitmap::from_ptr((self.0 + TINY_METADATA_OFFSET) as *const u8) }
    }

    pub fn in_use_bits(self) -> Bitmap {
        // SAFETY: as above.
        unsafe { Bitmap::from_ptr((self.0 + TINY_METADATA_OFFSET + TINY_BITMAP_WORDS * 4) as *const u8) }
    }

    #[inline]
    pub fn is_start(self, i: usize) -> bool {
        self.start_bits().get(i)
    }

    #[inline]
    pub fn is_in_use(self, i: usize) -> bool {
        self.in_use_bits().get(i)
    }

    #[inline]
    fn set_in_use_at(self, i: usize) {
        self.in_use_bits().set(i);
    }

    #[inline]
    pub fn next_start(self, i: usize) -> usize {
        self.start_bits().next_set_after(i, NUM_TINY_BLOCKS)
    }

    #[inline]
    pub fn block(self, i: usize) -> *mut u8 {
        (self.0 + (i << SHIFT_TINY_QUANTUM)) as *mut u8
    }

    #[inline]
    pub fn index_of(self, addr: usize) -> usize {
        (addr - self.0) >> SHIFT_TINY_QUANTUM
    }

    /// Set up a freshly mapped (zeroed) region: sentinel plus a tail that
    /// covers every block.
    pub fn init(self) {
        self.start_bits().set(NUM_TINY_BLOCKS);
        self.in_use_bits().set(NUM_TINY_BLOCKS);
        self.start_bits().set(0);
    }

    /// Size in quanta of the in-use block at `addr`.
    pub fn in_use_msize(self, addr: usize) -> Result<usize, ZoneError> {
        let offset = addr - self.0;
        if offset % TINY_QUANTUM != 0 || offset >= TINY_METADATA_OFFSET {
            return Err(ZoneError::Misuse { ptr: addr });
        }
        let i = offset >> SHIFT_TINY_QUANTUM;
        if !self.is_start(i) {
            // Inside another block; if that block is free, `addr` was freed and merged.
            return match self.start_bits().prev_set_before(i) {
                Some(p) if !self.is_in_use(p) => Err(ZoneError::corruption(CorruptionKind::DoubleFree, addr)),
                _ => Err(ZoneError::Misuse { ptr: addr }),
            };
        }
        if !self.is_in_use(i) {
            return Err(ZoneError::corruption(CorruptionKind::DoubleFree, addr));
        }
        Ok(self.next_start(i) - i)
    }
}

/// One-entry cache of the most recently freed tiny block.
///
/// The packed word is `address | msize`; quantum alignment leaves the low
/// bits free. A cached block stays marked in-use in the bitmaps, so taking
/// it back is a single compare-and-swap that needs no lock. Whoever wins
/// the swap owns the block.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct LastFree(AtomicUsize);

const LAST_FREE_MSIZE_MASK: usize = TINY_CACHE_MSIZE_LIMIT - 1;

impl LastFree {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    fn unpack(word: usize) -> Option<(usize, usize)> {
        (word != 0).then_some((word & !LAST_FREE_MSIZE_MASK, word & LAST_FREE_MSIZE_MASK))
    }

    /// Current `(address, msize)` entry.
    #[must_use]
    pub fn peek(&self) -> Option<(usize, usize)> {
        Self::unpack(self.0.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn holds(&self, addr: usize) -> bool {
        self.peek().is_some_and(|(cached, _)| cached == addr)
    }

    /// Claim the cached block if it has exactly `msize` quanta.
    pub fn claim(&self, msize: usize) -> Option<usize> {
        let word = self.0.load(Ordering::Acquire);
        let (addr, cached_msize) = Self::unpack(word)?;
        if cached_msize != msize {
            return None;
        }
        self.0
            .compare_exchange(word, 0, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| addr)
    }

    /// Park `addr` in the cache, returning the entry it displaced.
    pub fn replace(&self, addr: usize, msize: usize) -> Option<(usize, usize)> {
        debug_assert!(msize > 0 && msize < TINY_CACHE_MSIZE_LIMIT);
        debug_assert_eq!(addr & LAST_FREE_MSIZE_MASK, 0);
        Self::unpack(self.0.swap(addr | msize, Ordering::AcqRel))
    }

    /// Empty the cache.
    pub fn take(&self) -> Option<(usize, usize)> {
        Self::unpack(self.0.swap(0, Ordering::AcqRel))
    }
}

/// A block handed out by a region allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carved {
    pub ptr: NonNull<u8>,
    pub msize: usize,
    /// Leading bytes that may hold stale data; the rest is still zero.
    pub dirty_bytes: usize,
}

/// Lock-protected tiny allocator state.
#[derive(Debug, Default)]
pub struct TinyAllocator {
    lists: FreeLists,
    tail: Option<Tail>,
}

impl TinyAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lists: FreeLists::new(),
            tail: None,
        }
    }

    #[must_use]
    pub fn lists(&self) -> &FreeLists {
        &self.lists
    }

    #[must_use]
    pub fn tail(&self) -> Option<Tail> {
        self.tail
    }

    fn region_of(block: *mut u8) -> TinyRegion {
        TinyRegion(region_base(block as usize, TINY_REGION_SIZE))
    }

    /// # Safety
    /// `region` is live, `[i, i + msize)` is free, unlisted, and its start bit
    /// is set with the in-use bit clear.
    unsafe fn insert_free(&mut self, region: TinyRegion, i: usize, msize: usize) -> Result<(), ZoneError> {
        let block = region.block(i);
        // SAFETY: caller contract; the block is at least one quantum.
        unsafe {
            self.lists.push(slot_for(msize), block)?;
            write_leading_msize(block, msize);
            write_trailing_msize(block.add(msize << SHIFT_TINY_QUANTUM), msize);
        }
        Ok(())
    }

    /// Serve `msize` quanta from the free lists or the tail.
    ///
    /// `Ok(None)` means a new region is needed.
    ///
    /// # Safety
    /// Caller holds the zone lock; all listed blocks are in live regions.
    pub unsafe fn allocate(&mut self, msize: usize) -> Result<Option<Carved>, ZoneError> {
        debug_assert!((1..=TINY_MAX_MSIZE).contains(&msize));
        let slot = slot_for(msize);
        // SAFETY: caller contract.
        if let Some(ptr) = unsafe { self.allocate_exact(msize)? } {
            return Ok(Some(Carved {
                ptr,
                msize,
                dirty_bytes: msize << SHIFT_TINY_QUANTUM,
            }));
        }

        if let Some(found) = self.lists.first_at_least(slot + 1) {
            let block = self.lists.head(found);
            // SAFETY: listed blocks are free tiny blocks.
            let total = unsafe { read_leading_msize(block) };
            if total <= msize {
                return Err(ZoneError::corruption(CorruptionKind::BadMetadata, block as usize));
            }
            unsafe { self.lists.remove(found, block)? };
            let region = Self::region_of(block);
            let i = region.index_of(block as usize);
            region.set_in_use_at(i);
            let leftover = i + msize;
            region.start_bits().set(leftover);
            // SAFETY: the leftover is the free remainder of the old block.
            unsafe { self.insert_free(region, leftover, total - msize)? };
            return Ok(NonNull::new(block).map(|ptr| Carved {
                ptr,
                msize,
                dirty_bytes: msize << SHIFT_TINY_QUANTUM,
            }));
        }

        Ok(self.carve_tail(msize))
    }

    /// Pop an exact-size block without splitting anything.
    ///
    /// # Safety
    /// As for [`allocate`](Self::allocate).
    pub unsafe fn allocate_exact(&mut self, msize: usize) -> Result<Option<NonNull<u8>>, ZoneError> {
        let slot = slot_for(msize);
        if slot == CATCH_ALL_SLOT {
            return Ok(None);
        }
        // SAFETY: caller contract.
        let Some(block) = (unsafe { self.lists.pop(slot)? }) else {
            return Ok(None);
        };
        if unsafe { read_leading_msize(block) } != msize {
            return Err(ZoneError::corruption(CorruptionKind::BadMetadata, block as usize));
        }
        let region = Self::region_of(block);
        region.set_in_use_at(region.index_of(block as usize));
        Ok(NonNull::new(block))
    }

    /// Carve `msize` quanta (any size) from the newest region's tail.
    pub fn carve_tail(&mut self, msize: usize) -> Option<Carved> {
        let tail = self.tail.as_mut()?;
        if tail.available(NUM_TINY_BLOCKS) < msize {
            return None;
        }
        // SAFETY: the tail always belongs to a live region.
        let region = unsafe { TinyRegion::from_base(tail.region) };
        let i = tail.start;
        let dirty_bytes = tail.dirty_quanta(msize) << SHIFT_TINY_QUANTUM;
        tail.carve(msize);
        if tail.start < NUM_TINY_BLOCKS {
            region.start_bits().set(tail.start);
        }
        region.set_in_use_at(i);
        NonNull::new(region.block(i)).map(|ptr| Carved {
            ptr,
            msize,
            dirty_bytes,
        })
    }

    /// Make `region` the newest region; the previous tail becomes a free block.
    ///
    /// # Safety
    /// Caller holds the zone lock; `region` is freshly mapped and zeroed.
    pub unsafe fn add_region(&mut self, region: TinyRegion) -> Result<(), ZoneError> {
        region.init();
        if let Some(old) = self.tail.take() {
            if old.start < NUM_TINY_BLOCKS {
                // SAFETY: the old tail is free, unlisted, start bit set.
                unsafe {
                    self.insert_free(TinyRegion(old.region), old.start, NUM_TINY_BLOCKS - old.start)?;
                }
            }
        }
        self.tail = Some(Tail::new(region.base()));
        Ok(())
    }

    /// Return an in-use block to the free lists, coalescing with free
    /// neighbours and with the tail.
    ///
    /// # Safety
    /// Caller holds the zone lock and has validated that block `i` of
    /// `region` is in use with `msize` quanta and not cached.
    pub unsafe fn release(
        &mut self,
        region: TinyRegion,
        i: usize,
        msize: usize,
        scribble: bool,
    ) -> Result<(), ZoneError> {
        let block = region.block(i);
        if scribble {
            // SAFETY: the caller owns the whole block.
            unsafe { ptr::write_bytes(block, SCRIBBLE_BYTE, msize << SHIFT_TINY_QUANTUM) };
        }
        region.in_use_bits().clear(i);

        let next = i + msize;
        let merges_tail = self
            .tail
            .is_some_and(|t| t.region == region.base() && t.start == next);
        let mut start = i;
        let mut total = msize;
        let mut node_kept = false;

        if i > 0 {
            // SAFETY: the quantum before `block` is inside the region.
            let prev_msize = unsafe { read_trailing_msize(block) };
            if prev_msize != 0 && prev_msize <= i {
                let p = i - prev_msize;
                let prev = region.block(p);
                // SAFETY: `p` is a quantum inside the region.
                if region.is_start(p) && !region.is_in_use(p) && unsafe { read_leading_msize(prev) } == prev_msize {
                    if !merges_tail && slot_for(prev_msize) == CATCH_ALL_SLOT {
                        node_kept = true;
                    } else {
                        unsafe { self.lists.remove(slot_for(prev_msize), prev)? };
                    }
                    region.start_bits().clear(i);
                    start = p;
                    total += prev_msize;
                }
            }
        }

        if merges_tail {
            if next < NUM_TINY_BLOCKS {
                region.start_bits().clear(next);
            }
            if let Some(tail) = self.tail.as_mut() {
                tail.start = start;
            }
            return Ok(());
        }

        if next < NUM_TINY_BLOCKS && region.is_start(next) && !region.is_in_use(next) {
            let following = region.block(next);
            // SAFETY: a start bit with in-use clear below the tail is a listed free block.
            let next_msize = unsafe { read_leading_msize(following) };
            if next_msize == 0 || next + next_msize > NUM_TINY_BLOCKS {
                return Err(ZoneError::corruption(CorruptionKind::BadMetadata, following as usize));
            }
            if !node_kept && slot_for(next_msize) == CATCH_ALL_SLOT {
                unsafe { self.lists.replace(CATCH_ALL_SLOT, following, region.block(start))? };
                node_kept = true;
            } else {
                unsafe { self.lists.remove(slot_for(next_msize), following)? };
            }
            region.start_bits().clear(next);
            total += next_msize;
        }

        let head = region.block(start);
        // SAFETY: `[start, start + total)` is now one free block.
        unsafe {
            if !node_kept {
                self.lists.push(slot_for(total), head)?;
            }
            write_leading_msize(head, total);
            write_trailing_msize(head.add(total << SHIFT_TINY_QUANTUM), total);
        }
        Ok(())
    }

    /// Grow block `i` from `old_msize` to `new_msize` quanta in place.
    ///
    /// # Safety
    /// Caller holds the zone lock; block `i` is in use with `old_msize`.
    pub unsafe fn try_grow(
        &mut self,
        region: TinyRegion,
        i: usize,
        old_msize: usize,
        new_msize: usize,
    ) -> Result<bool, ZoneError> {
        let next = i + old_msize;
        let need = new_msize - old_msize;

        if let Some(tail) = self.tail.as_mut() {
            if tail.region == region.base() && tail.start == next {
                if tail.available(NUM_TINY_BLOCKS) < need {
                    return Ok(false);
                }
                tail.carve(need);
                if tail.start < NUM_TINY_BLOCKS {
                    region.start_bits().set(tail.start);
                }
                region.start_bits().clear(next);
                return Ok(true);
            }
        }

        if next >= NUM_TINY_BLOCKS || !region.is_start(next) || region.is_in_use(next) {
            return Ok(false);
        }
        let following = region.block(next);
        // SAFETY: free, listed block.
        let next_msize = unsafe { read_leading_msize(following) };
        if next_msize < need {
            return Ok(false);
        }
        unsafe { self.lists.remove(slot_for(next_msize), following)? };
        region.start_bits().clear(next);
        if next_msize > need {
            let leftover = i + new_msize;
            region.start_bits().set(leftover);
            // SAFETY: remainder of the absorbed free block.
            unsafe { self.insert_free(region, leftover, next_msize - need)? };
        }
        Ok(true)
    }
}
