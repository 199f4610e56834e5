//! Consistency checker.
//!
//! Runs with the zone lock held and walks every region and free list,
//! returning the first [`ZoneError::InvariantViolation`] (or the corruption
//! error a bad node produces). Only `Zone::check` calls this; the hot
//! allocate and free paths never do.

use crate::error::ZoneError;
use crate::free_list::{FreeLists, NUM_SLOTS, read_leading_msize, read_node, read_trailing_msize, slot_for};
use crate::region::Tail;
use crate::small::{NUM_SMALL_BLOCKS, SmallRegion, SmallTag};
use crate::tiny::{NUM_TINY_BLOCKS, TinyRegion};
use crate::zone::{Zone, ZoneState};

fn violation(what: &'static str, address: usize) -> ZoneError {
    ZoneError::InvariantViolation { what, address }
}

/// Tail start inside `base`, if the tail lives there.
fn tail_start(tail: Option<Tail>, base: usize) -> Option<usize> {
    tail.filter(|t| t.region == base).map(|t| t.start)
}

/// Free blocks found in one tiny region.
fn check_tiny_region(region: TinyRegion, tail: Option<Tail>) -> Result<usize, ZoneError> {
    let base = region.base();
    if !region.is_start(NUM_TINY_BLOCKS) || !region.is_in_use(NUM_TINY_BLOCKS) {
        return Err(violation("tiny region sentinel missing", base));
    }
    let tail_start = tail_start(tail, base);
    let mut free_blocks = 0;
    let mut previous_free = false;
    let mut i = 0;
    while i < NUM_TINY_BLOCKS {
        if tail_start == Some(i) {
            if previous_free {
                return Err(violation("free tiny block before the tail", region.block(i) as usize));
            }
            break;
        }
        let address = region.block(i) as usize;
        if !region.is_start(i) {
            return Err(violation("tiny block without start bit", address));
        }
        let next = region.next_start(i);
        if (i + 1..next).any(|j| region.is_in_use(j)) {
            return Err(violation("tiny in-use bit inside a block", address));
        }
        let msize = next - i;
        if region.is_in_use(i) {
            previous_free = false;
        } else {
            if previous_free {
                return Err(violation("adjacent free tiny blocks", address));
            }
            let block = region.block(i);
            // SAFETY: the block is free and the lock is held.
            unsafe {
                read_node(block)?;
                if read_leading_msize(block) != msize {
                    return Err(violation("tiny leading size mismatch", address));
                }
                if read_trailing_msize(region.block(next)) != msize {
                    return Err(violation("tiny trailing size mismatch", address));
                }
            }
            free_blocks += 1;
            previous_free = true;
        }
        i = next;
    }
    Ok(free_blocks)
}

/// Free blocks found in one small region.
fn check_small_region(region: SmallRegion, tail: Option<Tail>) -> Result<usize, ZoneError> {
    let base = region.base();
    let tail_start = tail_start(tail, base);
    let mut free_blocks = 0;
    let mut previous_free = false;
    let mut i = 0;
    while i < NUM_SMALL_BLOCKS {
        let address = region.block(i) as usize;
        if tail_start == Some(i) {
            if previous_free {
                return Err(violation("free small block before the tail", address));
            }
            if region.tag(i) != SmallTag::Free(NUM_SMALL_BLOCKS - i) {
                return Err(violation("small tail tag mismatch", address));
            }
            break;
        }
        let (msize, free) = match region.tag(i) {
            SmallTag::Middle => return Err(violation("small block without size tag", address)),
            SmallTag::InUse(msize) => (msize, false),
            SmallTag::Free(msize) => (msize, true),
        };
        if msize > NUM_SMALL_BLOCKS - i {
            return Err(violation("small block overruns region", address));
        }
        if (i + 1..i + msize).any(|j| region.tag(j) != SmallTag::Middle) {
            return Err(violation("small tag inside a block", address));
        }
        if free {
            if previous_free {
                return Err(violation("adjacent free small blocks", address));
            }
            let block = region.block(i);
            // SAFETY: the block is free and the lock is held.
            unsafe {
                read_node(block)?;
                if read_trailing_msize(region.block(i + msize)) != msize {
                    return Err(violation("small trailing size mismatch", address));
                }
            }
            free_blocks += 1;
        }
        previous_free = free;
        i += msize;
    }
    Ok(free_blocks)
}

/// Walk every list, calling `listed_msize` to size each node. Returns the
/// number of listed blocks.
fn check_lists(
    lists: &FreeLists,
    limit: usize,
    mut listed_msize: impl FnMut(*mut u8) -> Result<usize, ZoneError>,
) -> Result<usize, ZoneError> {
    let mut listed = 0;
    for slot in 0..NUM_SLOTS {
        let head = lists.head(slot);
        if (lists.occupancy() >> slot) & 1 != u32::from(!head.is_null()) {
            return Err(violation("free list occupancy bit mismatch", head as usize));
        }
        // SAFETY: the lock is held.
        for block in unsafe { lists.walk(slot, limit) } {
            let block = block?;
            if slot_for(listed_msize(block)?) != slot {
                return Err(violation("free block in the wrong slot", block as usize));
            }
            listed += 1;
        }
    }
    Ok(listed)
}

pub(crate) fn check_zone(zone: &Zone, st: &ZoneState) -> Result<(), ZoneError> {
    let published = zone.published();

    let tiny_tail = st.tiny.tail();
    let mut tiny_free = 0;
    for base in published.tiny_regions.iter() {
        // SAFETY: published regions are live.
        tiny_free += check_tiny_region(unsafe { TinyRegion::from_base(base) }, tiny_tail)?;
    }
    let tiny_listed = check_lists(st.tiny.lists(), tiny_free + 1, |block| {
        let addr = block as usize;
        // SAFETY: published regions are live.
        let region = unsafe { TinyRegion::containing(addr, published.tiny_regions.iter()) }
            .ok_or(violation("listed block outside tiny regions", addr))?;
        let i = region.index_of(addr);
        if !region.is_start(i) || region.is_in_use(i) {
            return Err(violation("listed tiny block is not free", addr));
        }
        Ok(region.next_start(i) - i)
    })?;
    if tiny_listed != tiny_free {
        return Err(violation("tiny free block missing from lists", 0));
    }

    let small_tail = st.small.tail();
    let mut small_free = 0;
    for base in published.small_regions.iter() {
        // SAFETY: published regions are live.
        small_free += check_small_region(unsafe { SmallRegion::from_base(base) }, small_tail)?;
    }
    let small_listed = check_lists(st.small.lists(), small_free + 1, |block| {
        let addr = block as usize;
        // SAFETY: published regions are live.
        let region = unsafe { SmallRegion::containing(addr, published.small_regions.iter()) }
            .ok_or(violation("listed block outside small regions", addr))?;
        match region.tag(region.index_of(addr)) {
            SmallTag::Free(msize) => Ok(msize),
            _ => Err(violation("listed small block is not free", addr)),
        }
    })?;
    if small_listed != small_free {
        return Err(violation("small free block missing from lists", 0));
    }

    if let Some((cached, msize)) = published.last_free.peek() {
        // SAFETY: published regions are live.
        let size = unsafe { TinyRegion::containing(cached, published.tiny_regions.iter()) }
            .and_then(|region| region.in_use_msize(cached).ok());
        if size != Some(msize) {
            return Err(violation("cached block is not an in-use tiny block", cached));
        }
    }

    let shift = zone.page_shift();
    let large = &published.large;
    let mut entries = 0;
    for entry in large.iter(shift) {
        if entry.address % zone.page_size() != 0 {
            return Err(violation("large entry not page aligned", entry.address));
        }
        if large.lookup(entry.address, shift).map(|(_, e)| e) != Some(entry) {
            return Err(violation("large entry unreachable by lookup", entry.address));
        }
        entries += 1;
    }
    if entries != large.in_use() || (entries != 0 && entries * 4 > large.capacity()) {
        return Err(violation("large table occupancy", large.storage()));
    }

    let huge = &published.huge;
    if huge.count() > huge.capacity() {
        return Err(violation("huge array overflow", huge.storage()));
    }
    for (address, size) in huge.iter() {
        if address % zone.page_size() != 0 || size < (zone.page_size() << shift) {
            return Err(violation("huge entry malformed", address));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneFlags;
    use crate::page::SystemPages;

    #[test]
    fn fresh_and_busy_zones_pass() {
        let zone = Zone::create(SystemPages::global(), ZoneFlags::NONE).unwrap();
        assert!(zone.check());
        let ptrs: Vec<_> = (1..200).map(|n| zone.allocate(n * 37)).collect();
        assert!(zone.check());
        for p in ptrs.iter().step_by(2) {
            unsafe { zone.free(*p) };
        }
        assert!(zone.check());
        for p in ptrs.iter().skip(1).step_by(2) {
            unsafe { zone.free(*p) };
        }
        assert!(zone.check());
        unsafe { zone.destroy() };
    }

    #[test]
    fn stomped_free_node_is_reported() {
        let zone = Zone::create(SystemPages::global(), ZoneFlags::NONE).unwrap();
        // Small blocks skip the last-free cache; the fence keeps the
        // victim from merging into the tail.
        let keep = zone.allocate(2000);
        let victim = zone.allocate(2000);
        let fence = zone.allocate(2000);
        unsafe {
            zone.free(victim);
            victim.cast::<usize>().write(0xdead_beef);
        }
        assert!(!zone.check());
        assert!(matches!(
            zone.last_error(),
            Some(ZoneError::CorruptionDetected { .. })
        ));
        let _ = (keep, fence);
        unsafe { zone.destroy() };
    }
}
