//! Intrusive, checksummed free lists.
//!
//! A free block stores a [`FreeNode`] in its first three words. The node's
//! `checksum` is always `previous ^ next ^ FREE_LIST_MAGIC`, so a stray write
//! into a freed block or a second free of the same block is caught the next
//! time the node is touched.
//!
//! Aliasing contract: a node is only read or written while its block is free
//! and the zone lock is held. Nothing else (including the enumerator) ever
//! dereferences a node. All access goes through unaligned-tolerant raw
//! pointer reads/writes in this module.
//!
//! Size fields: every free block records its msize in its last two bytes
//! (the trailing size) so that the block after it can find its header.
//! Tiny blocks additionally keep a leading copy right after the node.

use core::mem::size_of;
use core::ptr;

use crate::error::{CorruptionKind, ZoneError};

/// Mixed into every node checksum.
pub const FREE_LIST_MAGIC: usize = 0x357B;

/// Number of free-list slots per size class.
pub const NUM_SLOTS: usize = 32;

/// Slot holding every free block of `NUM_SLOTS` quanta or more.
pub const CATCH_ALL_SLOT: usize = NUM_SLOTS - 1;

/// Overlay written into the first words of a free block.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FreeNode {
    checksum: usize,
    previous: *mut u8,
    next: *mut u8,
}

/// Offset of the leading msize (tiny only).
pub const LEADING_MSIZE_OFFSET: usize = size_of::<FreeNode>();

impl FreeNode {
    #[must_use]
    pub fn new(previous: *mut u8, next: *mut u8) -> Self {
        Self {
            checksum: previous as usize ^ next as usize ^ FREE_LIST_MAGIC,
            previous,
            next,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.checksum == self.previous as usize ^ self.next as usize ^ FREE_LIST_MAGIC
    }

    #[must_use]
    pub fn previous(&self) -> *mut u8 {
        self.previous
    }

    #[must_use]
    pub fn next(&self) -> *mut u8 {
        self.next
    }
}

/// Slot index for a free block of `msize` quanta.
#[inline]
#[must_use]
pub const fn slot_for(msize: usize) -> usize {
    if msize >= NUM_SLOTS {
        CATCH_ALL_SLOT
    } else {
        msize - 1
    }
}

/// # Safety
/// `block` must point at a free block of at least one quantum.
#[inline]
pub unsafe fn write_node(block: *mut u8, previous: *mut u8, next: *mut u8) {
    // SAFETY: caller contract; the block is at least node-sized.
    unsafe { ptr::write_unaligned(block.cast::<FreeNode>(), FreeNode::new(previous, next)) };
}

/// Read and verify the node stored in `block`.
///
/// # Safety
/// `block` must point at memory readable for a node.
#[inline]
pub unsafe fn read_node(block: *mut u8) -> Result<FreeNode, ZoneError> {
    // SAFETY: caller contract.
    let node = unsafe { ptr::read_unaligned(block.cast::<FreeNode>()) };
    if node.is_valid() {
        Ok(node)
    } else {
        Err(ZoneError::corruption(CorruptionKind::BadChecksum, block as usize))
    }
}

/// # Safety
/// `block` must point at a free tiny block.
#[inline]
pub unsafe fn write_leading_msize(block: *mut u8, msize: usize) {
    // SAFETY: a tiny quantum holds node + leading + trailing sizes.
    unsafe { ptr::write_unaligned(block.add(LEADING_MSIZE_OFFSET).cast::<u16>(), msize as u16) };
}

/// # Safety
/// `block` must point at a free tiny block.
#[inline]
#[must_use]
pub unsafe fn read_leading_msize(block: *const u8) -> usize {
    // SAFETY: caller contract.
    usize::from(unsafe { ptr::read_unaligned(block.add(LEADING_MSIZE_OFFSET).cast::<u16>()) })
}

/// Store `msize` in the last two bytes before `block_end`.
///
/// # Safety
/// `block_end` must be the end of a free block owned by the caller.
#[inline]
pub unsafe fn write_trailing_msize(block_end: *mut u8, msize: usize) {
    // SAFETY: caller contract.
    unsafe { ptr::write_unaligned(block_end.sub(2).cast::<u16>(), msize as u16) };
}

/// Read the trailing size of whatever block ends at `block_start`.
///
/// The value is only meaningful if that block is free; callers confirm
/// with the block's metadata before trusting it.
///
/// # Safety
/// The two bytes before `block_start` must be readable.
#[inline]
#[must_use]
pub unsafe fn read_trailing_msize(block_start: *const u8) -> usize {
    // SAFETY: caller contract.
    usize::from(unsafe { ptr::read_unaligned(block_start.sub(2).cast::<u16>()) })
}

/// Heads of the 32 size-segregated lists plus their occupancy bitmap.
///
/// Bit `s` of `occupancy` is set iff `heads[s]` is non-null.
#[derive(Debug)]
pub struct FreeLists {
    heads: [*mut u8; NUM_SLOTS],
    occupancy: u32,
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeLists {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heads: [ptr::null_mut(); NUM_SLOTS],
            occupancy: 0,
        }
    }

    #[must_use]
    pub fn head(&self, slot: usize) -> *mut u8 {
        self.heads[slot]
    }

    #[must_use]
    pub fn occupancy(&self) -> u32 {
        self.occupancy
    }

    /// Lowest non-empty slot at or above `slot`.
    #[must_use]
    pub fn first_at_least(&self, slot: usize) -> Option<usize> {
        if slot >= NUM_SLOTS {
            return None;
        }
        let masked = self.occupancy & (u32::MAX << slot);
        (masked != 0).then(|| masked.trailing_zeros() as usize)
    }

    /// Push `block` at the head of `slot`.
    ///
    /// # Safety
    /// `block` must be a free block not on any list; every node on the
    /// list must be valid.
    pub unsafe fn push(&mut self, slot: usize, block: *mut u8) -> Result<(), ZoneError> {
        let head = self.heads[slot];
        if !head.is_null() {
            // SAFETY: list members are free blocks.
            let node = unsafe { read_node(head)? };
            unsafe { write_node(head, block, node.next()) };
        } else {
            self.occupancy |= 1 << slot;
        }
        // SAFETY: caller contract.
        unsafe { write_node(block, ptr::null_mut(), head) };
        self.heads[slot] = block;
        Ok(())
    }

    /// Unlink `block` from `slot`.
    ///
    /// # Safety
    /// `block` must be readable as a node.
    pub unsafe fn remove(&mut self, slot: usize, block: *mut u8) -> Result<(), ZoneError> {
        // SAFETY: caller contract.
        let node = unsafe { read_node(block)? };
        let (previous, next) = (node.previous(), node.next());
        if previous.is_null() {
            if self.heads[slot] != block {
                return Err(ZoneError::corruption(CorruptionKind::BadMetadata, block as usize));
            }
            self.heads[slot] = next;
            if next.is_null() {
                self.occupancy &= !(1 << slot);
            }
        } else {
            // SAFETY: a valid node only links to other list members.
            let prev_node = unsafe { read_node(previous)? };
            unsafe { write_node(previous, prev_node.previous(), next) };
        }
        if !next.is_null() {
            // SAFETY: as above.
            let next_node = unsafe { read_node(next)? };
            unsafe { write_node(next, previous, next_node.next()) };
        }
        Ok(())
    }

    /// Move the node at `old` to `new`, keeping its position in `slot`.
    ///
    /// Used when a listed block grows downward during coalescing and stays
    /// in the same slot.
    ///
    /// # Safety
    /// `old` must be on `slot`; `new` must be writable for a node.
    pub unsafe fn replace(&mut self, slot: usize, old: *mut u8, new: *mut u8) -> Result<(), ZoneError> {
        // SAFETY: caller contract.
        let node = unsafe { read_node(old)? };
        let (previous, next) = (node.previous(), node.next());
        if previous.is_null() {
            if self.heads[slot] != old {
                return Err(ZoneError::corruption(CorruptionKind::BadMetadata, old as usize));
            }
            self.heads[slot] = new;
        } else {
            // SAFETY: list member.
            let prev_node = unsafe { read_node(previous)? };
            unsafe { write_node(previous, prev_node.previous(), new) };
        }
        if !next.is_null() {
            // SAFETY: list member.
            let next_node = unsafe { read_node(next)? };
            unsafe { write_node(next, new, next_node.next()) };
        }
        // SAFETY: caller contract.
        unsafe { write_node(new, previous, next) };
        Ok(())
    }

    /// Pop the head of `slot`.
    ///
    /// # Safety
    /// Every node on the list must be readable.
    pub unsafe fn pop(&mut self, slot: usize) -> Result<Option<*mut u8>, ZoneError> {
        let head = self.heads[slot];
        if head.is_null() {
            return Ok(None);
        }
        // SAFETY: caller contract.
        unsafe { self.remove(slot, head)? };
        Ok(Some(head))
    }

    /// Walk `slot` from its head, at most `limit` nodes.
    ///
    /// # Safety
    /// Must only be used under the zone lock; nodes are dereferenced.
    pub unsafe fn walk(&self, slot: usize, limit: usize) -> ListWalk {
        ListWalk {
            current: self.heads[slot],
            expected_previous: ptr::null_mut(),
            remaining: limit,
        }
    }
}

/// Iterator over one free list, verifying links as it goes.
#[derive(Debug)]
pub struct ListWalk {
    current: *mut u8,
    expected_previous: *mut u8,
    remaining: usize,
}

impl Iterator for ListWalk {
    type Item = Result<*mut u8, ZoneError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        let block = self.current;
        if self.remaining == 0 {
            self.current = ptr::null_mut();
            return Some(Err(ZoneError::InvariantViolation {
                what: "free list does not terminate",
                address: block as usize,
            }));
        }
        self.remaining -= 1;
        // SAFETY: `walk` is only created under the zone lock.
        let node = match unsafe { read_node(block) } {
            Ok(node) => node,
            Err(err) => {
                self.current = ptr::null_mut();
                return Some(Err(err));
            }
        };
        if node.previous() != self.expected_previous {
            self.current = ptr::null_mut();
            return Some(Err(ZoneError::InvariantViolation {
                what: "free list back link mismatch",
                address: block as usize,
            }));
        }
        self.expected_previous = block;
        self.current = node.next();
        Some(Ok(block))
    }
}

// SAFETY: the raw pointers are only dereferenced under the owning zone's lock.
unsafe impl Send for FreeLists {}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(32))]
    struct Block([u8; 32]);

    fn blocks(n: usize) -> Vec<Block> {
        (0..n).map(|_| Block([0; 32])).collect()
    }

    fn addr(b: &mut [Block], i: usize) -> *mut u8 {
        b[i].0.as_mut_ptr()
    }

    #[test]
    fn checksum_round_trip_and_tamper() {
        let mut b = blocks(2);
        let p = addr(&mut b, 0);
        let q = addr(&mut b, 1);
        unsafe {
            write_node(p, ptr::null_mut(), q);
            let node = read_node(p).expect("valid");
            assert_eq!(node.next(), q);
            assert!(node.previous().is_null());

            // Corrupt the `next` word.
            p.add(2 * size_of::<usize>()).write(0xEE);
            assert_eq!(
                read_node(p).err(),
                Some(ZoneError::corruption(CorruptionKind::BadChecksum, p as usize))
            );
        }
    }

    #[test]
    fn size_fields_fit_one_tiny_quantum() {
        let mut b = blocks(1);
        let p = addr(&mut b, 0);
        unsafe {
            write_node(p, ptr::null_mut(), ptr::null_mut());
            write_leading_msize(p, 31);
            write_trailing_msize(p.add(32), 31);
            assert_eq!(read_leading_msize(p), 31);
            assert_eq!(read_trailing_msize(p.add(32)), 31);
            assert!(read_node(p).is_ok());
        }
    }

    #[test]
    fn slot_mapping() {
        assert_eq!(slot_for(1), 0);
        assert_eq!(slot_for(31), 30);
        assert_eq!(slot_for(32), CATCH_ALL_SLOT);
        assert_eq!(slot_for(60_000), CATCH_ALL_SLOT);
    }

    #[test]
    fn push_remove_tracks_occupancy() {
        let mut b = blocks(3);
        let (p0, p1, p2) = (addr(&mut b, 0), addr(&mut b, 1), addr(&mut b, 2));
        let mut lists = FreeLists::new();
        unsafe {
            lists.push(3, p0).unwrap();
            lists.push(3, p1).unwrap();
            lists.push(7, p2).unwrap();
            assert_eq!(lists.occupancy(), (1 << 3) | (1 << 7));
            assert_eq!(lists.head(3), p1);

            // p0 is the tail of slot 3.
            lists.remove(3, p0).unwrap();
            assert_eq!(lists.head(3), p1);
            assert!(read_node(p1).unwrap().next().is_null());

            assert_eq!(lists.pop(3).unwrap(), Some(p1));
            assert_eq!(lists.occupancy(), 1 << 7);
            assert_eq!(lists.pop(3).unwrap(), None);
        }
    }

    #[test]
    fn first_at_least_scans_upward() {
        let mut b = blocks(2);
        let mut lists = FreeLists::new();
        unsafe {
            lists.push(4, addr(&mut b, 0)).unwrap();
            lists.push(CATCH_ALL_SLOT, addr(&mut b, 1)).unwrap();
        }
        assert_eq!(lists.first_at_least(0), Some(4));
        assert_eq!(lists.first_at_least(4), Some(4));
        assert_eq!(lists.first_at_least(5), Some(CATCH_ALL_SLOT));
        assert_eq!(lists.first_at_least(NUM_SLOTS), None);
    }

    #[test]
    fn replace_keeps_list_order() {
        let mut b = blocks(4);
        let (p0, p1, p2, moved) = (addr(&mut b, 0), addr(&mut b, 1), addr(&mut b, 2), addr(&mut b, 3));
        let mut lists = FreeLists::new();
        unsafe {
            lists.push(CATCH_ALL_SLOT, p0).unwrap();
            lists.push(CATCH_ALL_SLOT, p1).unwrap();
            lists.push(CATCH_ALL_SLOT, p2).unwrap();
            lists.replace(CATCH_ALL_SLOT, p1, moved).unwrap();
            let order: Vec<_> = lists
                .walk(CATCH_ALL_SLOT, 8)
                .map(|r| r.expect("valid list"))
                .collect();
            assert_eq!(order, vec![p2, moved, p0]);
        }
    }

    #[test]
    fn remove_of_unlisted_head_is_reported() {
        let mut b = blocks(2);
        let (p0, stray) = (addr(&mut b, 0), addr(&mut b, 1));
        let mut lists = FreeLists::new();
        unsafe {
            lists.push(2, p0).unwrap();
            write_node(stray, ptr::null_mut(), ptr::null_mut());
            assert!(matches!(
                lists.remove(2, stray),
                Err(ZoneError::CorruptionDetected {
                    kind: CorruptionKind::BadMetadata,
                    ..
                })
            ));
        }
    }
}
