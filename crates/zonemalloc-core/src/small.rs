//! Small size class.
//!
//! 512-byte quanta in 8 MiB regions. Each region ends with one tagged
//! 16-bit word per quantum: the first quantum of a block holds its msize,
//! with [`SMALL_IS_FREE`] set when the block is free; every later quantum
//! of the block holds 0. The untouched tail of the newest region is tagged
//! like a free block but never sits on a free list.
//!
//! Growing the small region table is self-hosted: when the table is full,
//! the new array is carved from the first quanta of the region being added.

use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::config::SCRIBBLE_BYTE;
use crate::error::{CorruptionKind, ZoneError};
use crate::free_list::{CATCH_ALL_SLOT, FreeLists, read_trailing_msize, slot_for, write_trailing_msize};
use crate::region::{INITIAL_SMALL_REGIONS, RegionTable, Tail, region_array_bytes, region_base};
use crate::tiny::Carved;

pub const SHIFT_SMALL_QUANTUM: usize = 9;
pub const SMALL_QUANTUM: usize = 1 << SHIFT_SMALL_QUANTUM;
pub const SMALL_REGION_SIZE: usize = 1 << 23;
pub const NUM_SMALL_BLOCKS: usize = num_small_blocks();
/// Offset of the tag array inside a region.
pub const SMALL_METADATA_OFFSET: usize = NUM_SMALL_BLOCKS * SMALL_QUANTUM;
pub const SMALL_METADATA_SIZE: usize = NUM_SMALL_BLOCKS * 2;
/// Requests of this many bytes or more bypass the region allocators.
pub const LARGE_THRESHOLD: usize = 15 * 1024;
/// Largest msize handed out by the small class.
pub const SMALL_MAX_MSIZE: usize = (LARGE_THRESHOLD - 1) / SMALL_QUANTUM + 1;

/// Tag bit marking the first quantum of a free block.
pub const SMALL_IS_FREE: u16 = 1 << 15;
const SMALL_MSIZE_MASK: u16 = SMALL_IS_FREE - 1;

const _: () = assert!(SMALL_METADATA_OFFSET + SMALL_METADATA_SIZE <= SMALL_REGION_SIZE);
const _: () = assert!(NUM_SMALL_BLOCKS <= SMALL_MSIZE_MASK as usize);

const fn num_small_blocks() -> usize {
    SMALL_REGION_SIZE / (SMALL_QUANTUM + 2)
}

/// Quanta needed for `size` bytes (at least one).
#[inline]
#[must_use]
pub const fn small_msize_for(size: usize) -> usize {
    if size == 0 {
        1
    } else {
        (size + SMALL_QUANTUM - 1) >> SHIFT_SMALL_QUANTUM
    }
}

/// Decoded tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmallTag {
    Middle,
    InUse(usize),
    Free(usize),
}

impl SmallTag {
    #[must_use]
    pub const fn decode(word: u16) -> Self {
        let msize = (word & SMALL_MSIZE_MASK) as usize;
        if msize == 0 {
            Self::Middle
        } else if word & SMALL_IS_FREE != 0 {
            Self::Free(msize)
        } else {
            Self::InUse(msize)
        }
    }

    #[must_use]
    pub const fn encode(self) -> u16 {
        match self {
            Self::Middle => 0,
            Self::InUse(msize) => msize as u16,
            Self::Free(msize) => SMALL_IS_FREE | msize as u16,
        }
    }
}

/// Handle to a live small region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallRegion(usize);

impl SmallRegion {
    /// # Safety
    /// `base` must be a mapped, [`SMALL_REGION_SIZE`]-aligned small region
    /// that outlives every use of the handle.
    #[must_use]
    pub const unsafe fn from_base(base: usize) -> Self {
        Self(base)
    }

    /// Region containing `addr`, if it is one of `regions`.
    ///
    /// # Safety
    /// `regions` must only yield live small regions.
    #[must_use]
    pub unsafe fn containing(addr: usize, mut regions: impl Iterator<Item = usize>) -> Option<Self> {
        let base = region_base(addr, SMALL_REGION_SIZE);
        regions.any(|r| r == base).then_some(Self(base))
    }

    #[must_use]
    pub const fn base(self) -> usize {
        self.0
    }

    #[inline]
    fn tag_word(self, i: usize) -> &'static AtomicU16 {
        debug_assert!(i < NUM_SMALL_BLOCKS);
        // SAFETY: the tag array lies inside the live region and is 2-aligned.
        unsafe { &*((self.0 + SMALL_METADATA_OFFSET + 2 * i) as *const AtomicU16) }
    }

    #[inline]
    pub fn tag(self, i: usize) -> SmallTag {
        SmallTag::decode(self.tag_word(i).load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_tag(self, i: usize, tag: SmallTag) {
        self.tag_word(i).store(tag.encode(), Ordering::Relaxed);
    }

    #[inline]
    pub fn block(self, i: usize) -> *mut u8 {
        (self.0 + (i << SHIFT_SMALL_QUANTUM)) as *mut u8
    }

    #[inline]
    pub fn index_of(self, addr: usize) -> usize {
        (addr - self.0) >> SHIFT_SMALL_QUANTUM
    }

    pub fn init(self) {
        self.set_tag(0, SmallTag::Free(NUM_SMALL_BLOCKS));
    }

    /// Size in quanta of the in-use block at `addr`.
    pub fn in_use_msize(self, addr: usize) -> Result<usize, ZoneError> {
        let offset = addr - self.0;
        if offset % SMALL_QUANTUM != 0 || offset >= SMALL_METADATA_OFFSET {
            return Err(ZoneError::Misuse { ptr: addr });
        }
        let i = offset >> SHIFT_SMALL_QUANTUM;
        match self.tag(i) {
            SmallTag::InUse(msize) => Ok(msize),
            SmallTag::Free(_) => Err(ZoneError::corruption(CorruptionKind::DoubleFree, addr)),
            SmallTag::Middle => match self.enclosing_block(i) {
                Some(SmallTag::Free(_)) => Err(ZoneError::corruption(CorruptionKind::DoubleFree, addr)),
                _ => Err(ZoneError::Misuse { ptr: addr }),
            },
        }
    }

    /// Tag of the block whose body covers quantum `i`, found by walking
    /// back to the nearest header.
    fn enclosing_block(self, i: usize) -> Option<SmallTag> {
        let (j, tag) = (0..i)
            .rev()
            .map(|j| (j, self.tag(j)))
            .find(|(_, tag)| *tag != SmallTag::Middle)?;
        let msize = match tag {
            SmallTag::InUse(msize) | SmallTag::Free(msize) => msize,
            SmallTag::Middle => 0,
        };
        (j + msize > i).then_some(tag)
    }
}

/// Lock-protected small allocator state.
#[derive(Debug, Default)]
pub struct SmallAllocator {
    lists: FreeLists,
    tail: Option<Tail>,
}

impl SmallAllocator {
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

    fn region_of(block: *mut u8) -> SmallRegion {
        SmallRegion(region_base(block as usize, SMALL_REGION_SIZE))
    }

    /// # Safety
    /// `[i, i + msize)` of the live `region` is free and unlisted.
    unsafe fn insert_free(&mut self, region: SmallRegion, i: usize, msize: usize) -> Result<(), ZoneError> {
        region.set_tag(i, SmallTag::Free(msize));
        let block = region.block(i);
        // SAFETY: caller contract.
        unsafe {
            self.lists.push(slot_for(msize), block)?;
            write_trailing_msize(block.add(msize << SHIFT_SMALL_QUANTUM), msize);
        }
        Ok(())
    }

    fn listed_msize(block: *mut u8) -> Result<(SmallRegion, usize, usize), ZoneError> {
        let region = Self::region_of(block);
        let i = region.index_of(block as usize);
        match region.tag(i) {
            SmallTag::Free(msize) => Ok((region, i, msize)),
            _ => Err(ZoneError::corruption(CorruptionKind::BadMetadata, block as usize)),
        }
    }

    /// Serve `msize` quanta from the free lists or the tail.
    ///
    /// `Ok(None)` means a new region is needed.
    ///
    /// # Safety
    /// Caller holds the zone lock; listed blocks are in live regions.
    pub unsafe fn allocate(&mut self, msize: usize) -> Result<Option<Carved>, ZoneError> {
        let slot = slot_for(msize);
        if slot != CATCH_ALL_SLOT {
            // SAFETY: caller contract.
            if let Some(block) = unsafe { self.lists.pop(slot)? } {
                let (region, i, found) = Self::listed_msize(block)?;
                if found != msize {
                    return Err(ZoneError::corruption(CorruptionKind::BadMetadata, block as usize));
                }
                region.set_tag(i, SmallTag::InUse(msize));
                return Ok(NonNull::new(block).map(|ptr| Carved {
                    ptr,
                    msize,
                    dirty_bytes: msize << SHIFT_SMALL_QUANTUM,
                }));
            }
        }

        if let Some(found) = self.lists.first_at_least(slot + 1) {
            let block = self.lists.head(found);
            let (region, i, total) = Self::listed_msize(block)?;
            if total <= msize {
                return Err(ZoneError::corruption(CorruptionKind::BadMetadata, block as usize));
            }
            unsafe { self.lists.remove(found, block)? };
            // SAFETY: the remainder is the free tail of the old block.
            unsafe { self.insert_free(region, i + msize, total - msize)? };
            region.set_tag(i, SmallTag::InUse(msize));
            return Ok(NonNull::new(block).map(|ptr| Carved {
                ptr,
                msize,
                dirty_bytes: msize << SHIFT_SMALL_QUANTUM,
            }));
        }

        Ok(self.carve_tail(msize))
    }

    /// Carve `msize` quanta from the newest region's tail.
    pub fn carve_tail(&mut self, msize: usize) -> Option<Carved> {
        let tail = self.tail.as_mut()?;
        if tail.available(NUM_SMALL_BLOCKS) < msize {
            return None;
        }
        // SAFETY: the tail always belongs to a live region.
        let region = unsafe { SmallRegion::from_base(tail.region) };
        let i = tail.start;
        let dirty_bytes = tail.dirty_quanta(msize) << SHIFT_SMALL_QUANTUM;
        tail.carve(msize);
        if tail.start < NUM_SMALL_BLOCKS {
            region.set_tag(tail.start, SmallTag::Free(NUM_SMALL_BLOCKS - tail.start));
        }
        region.set_tag(i, SmallTag::InUse(msize));
        NonNull::new(region.block(i)).map(|ptr| Carved {
            ptr,
            msize,
            dirty_bytes,
        })
    }

    /// Make `region` the newest region and publish it in `table`.
    ///
    /// When `table` is full its new array is carved from `region` itself.
    ///
    /// # Safety
    /// Caller holds the zone lock; `region` is freshly mapped and zeroed.
    pub unsafe fn add_region(
        &mut self,
        table: &RegionTable<INITIAL_SMALL_REGIONS>,
        region: SmallRegion,
    ) -> Result<(), ZoneError> {
        region.init();
        if let Some(old) = self.tail.take() {
            if old.start < NUM_SMALL_BLOCKS {
                // SAFETY: the retired tail is free and unlisted.
                unsafe { self.insert_free(SmallRegion(old.region), old.start, NUM_SMALL_BLOCKS - old.start)? };
            }
        }
        self.tail = Some(Tail::new(region.base()));

        if table.is_full() {
            let capacity = table.capacity() * 2;
            let msize = small_msize_for(region_array_bytes(capacity));
            let carved = self
                .carve_tail(msize)
                .ok_or(ZoneError::InvariantViolation {
                    what: "small region array does not fit a fresh region",
                    address: region.base(),
                })?;
            // SAFETY: the block is fresh, word aligned, and stays allocated.
            unsafe { table.grow_into(carved.ptr, capacity) };
        }
        table.push(region.base());
        Ok(())
    }

    /// Return an in-use block, coalescing with free neighbours and the tail.
    ///
    /// # Safety
    /// Caller holds the zone lock and has validated block `i` as in use
    /// with `msize` quanta.
    pub unsafe fn release(
        &mut self,
        region: SmallRegion,
        i: usize,
        msize: usize,
        scribble: bool,
    ) -> Result<(), ZoneError> {
        let block = region.block(i);
        if scribble {
            // SAFETY: the caller owns the block.
            unsafe { ptr::write_bytes(block, SCRIBBLE_BYTE, msize << SHIFT_SMALL_QUANTUM) };
        }

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
            if prev_msize != 0 && prev_msize <= i && region.tag(i - prev_msize) == SmallTag::Free(prev_msize) {
                let p = i - prev_msize;
                if !merges_tail && slot_for(prev_msize) == CATCH_ALL_SLOT {
                    node_kept = true;
                } else {
                    unsafe { self.lists.remove(slot_for(prev_msize), region.block(p))? };
                }
                region.set_tag(i, SmallTag::Middle);
                start = p;
                total += prev_msize;
            }
        }

        if merges_tail {
            region.set_tag(start, SmallTag::Free(NUM_SMALL_BLOCKS - start));
            if start != i {
                region.set_tag(i, SmallTag::Middle);
            }
            if next < NUM_SMALL_BLOCKS {
                region.set_tag(next, SmallTag::Middle);
            }
            if let Some(tail) = self.tail.as_mut() {
                tail.start = start;
            }
            return Ok(());
        }

        if next < NUM_SMALL_BLOCKS {
            if let SmallTag::Free(next_msize) = region.tag(next) {
                if next + next_msize > NUM_SMALL_BLOCKS {
                    return Err(ZoneError::corruption(CorruptionKind::BadMetadata, region.block(next) as usize));
                }
                let following = region.block(next);
                if !node_kept && slot_for(next_msize) == CATCH_ALL_SLOT {
                    unsafe { self.lists.replace(CATCH_ALL_SLOT, following, region.block(start))? };
                    node_kept = true;
                } else {
                    unsafe { self.lists.remove(slot_for(next_msize), following)? };
                }
                region.set_tag(next, SmallTag::Middle);
                total += next_msize;
            }
        }

        let head = region.block(start);
        region.set_tag(start, SmallTag::Free(total));
        // SAFETY: `[start, start + total)` is one free block now.
        unsafe {
            if !node_kept {
                self.lists.push(slot_for(total), head)?;
            }
            write_trailing_msize(head.add(total << SHIFT_SMALL_QUANTUM), total);
        }
        Ok(())
    }

    /// Grow block `i` from `old_msize` to `new_msize` quanta in place.
    ///
    /// # Safety
    /// Caller holds the zone lock; block `i` is in use with `old_msize`.
    pub unsafe fn try_grow(
        &mut self,
        region: SmallRegion,
        i: usize,
        old_msize: usize,
        new_msize: usize,
    ) -> Result<bool, ZoneError> {
        let next = i + old_msize;
        let need = new_msize - old_msize;

        if let Some(tail) = self.tail.as_mut() {
            if tail.region == region.base() && tail.start == next {
                if tail.available(NUM_SMALL_BLOCKS) < need {
                    return Ok(false);
                }
                tail.carve(need);
                if tail.start < NUM_SMALL_BLOCKS {
                    region.set_tag(tail.start, SmallTag::Free(NUM_SMALL_BLOCKS - tail.start));
                }
                region.set_tag(next, SmallTag::Middle);
                region.set_tag(i, SmallTag::InUse(new_msize));
                return Ok(true);
            }
        }

        if next >= NUM_SMALL_BLOCKS {
            return Ok(false);
        }
        let SmallTag::Free(next_msize) = region.tag(next) else {
            return Ok(false);
        };
        if next_msize < need {
            return Ok(false);
        }
        unsafe { self.lists.remove(slot_for(next_msize), region.block(next))? };
        region.set_tag(next, SmallTag::Middle);
        if next_msize > need {
            // SAFETY: remainder of the absorbed block.
            unsafe { self.insert_free(region, i + new_msize, next_msize - need)? };
        }
        region.set_tag(i, SmallTag::InUse(new_msize));
        Ok(true)
    }
}
