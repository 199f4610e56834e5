//! Seeded stress workloads.
//!
//! A [`Workload`] owns a private zone and a table of slots. Each step picks
//! an operation from a fixed mix (allocate, zeroed allocate, aligned
//! allocate, resize, free, batch) with a deterministic RNG. Every live block
//! is filled with a tag byte, and the tag is verified before the block is
//! resized or freed, so a block handed out twice or overwritten by the
//! allocator shows up as a [`HarnessError::ContentMismatch`].

#![allow(unsafe_code)]

use serde::{Deserialize, Serialize};

use zonemalloc_core::tiny::TINY_LIMIT;
use zonemalloc_core::{SystemPages, Zone, ZoneError, ZoneFlags};

use crate::error::HarnessError;

/// Blocks requested per batch operation.
const BATCH_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct WorkloadConfig {
    pub seed: u64,
    pub ops: u64,
    /// Largest single request.
    pub max_size: usize,
    /// Number of live-block slots.
    pub slots: usize,
    /// Run `Zone::check` every this many operations (0 = only at the end).
    pub check_every: u64,
    pub flags: ZoneFlags,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0xDEAD_BEEF,
            ops: 10_000,
            max_size: 64 * 1024,
            slots: 256,
            check_every: 1000,
            flags: ZoneFlags::NONE,
        }
    }
}

/// Operation counts of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub ops: u64,
    pub allocations: u64,
    pub zeroed_allocations: u64,
    pub aligned_allocations: u64,
    pub frees: u64,
    pub resizes: u64,
    pub resizes_in_place: u64,
    pub batch_requests: u64,
    pub batch_blocks: u64,
    pub checks: u64,
    pub live_blocks: usize,
    pub peak_live_blocks: usize,
    pub verified_bytes: u64,
}

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n.max(1) as u64) as usize
    }

    /// Mostly tiny, some small, a few large requests.
    fn gen_size(&mut self, max: usize) -> usize {
        let cap = match self.next_u64() % 10 {
            0..=5 => TINY_LIMIT,
            6..=8 => 15 * 1024,
            _ => max,
        };
        self.below(cap.min(max) + 1)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    ptr: *mut u8,
    len: usize,
    tag: u8,
}

pub struct Workload {
    zone: &'static Zone,
    config: WorkloadConfig,
    rng: XorShift64,
    slots: Vec<Option<Slot>>,
    summary: WorkloadSummary,
}

impl Workload {
    pub fn new(config: WorkloadConfig) -> Result<Self, HarnessError> {
        let zone = Zone::create(SystemPages::global(), config.flags).ok_or(HarnessError::CreateFailed)?;
        Ok(Self {
            zone,
            config,
            rng: XorShift64::new(config.seed),
            slots: vec![None; config.slots.max(1)],
            summary: WorkloadSummary::default(),
        })
    }

    #[must_use]
    pub fn zone(&self) -> &'static Zone {
        self.zone
    }

    #[must_use]
    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    #[must_use]
    pub fn summary(&self) -> &WorkloadSummary {
        &self.summary
    }

    /// Run the remaining operations, then a final check.
    pub fn run(&mut self) -> Result<&WorkloadSummary, HarnessError> {
        while self.summary.ops < self.config.ops {
            self.step()?;
        }
        self.check()?;
        Ok(&self.summary)
    }

    /// Perform one operation.
    pub fn step(&mut self) -> Result<(), HarnessError> {
        self.summary.ops += 1;
        let index = self.rng.below(self.slots.len());
        match (self.rng.next_u64() % 100, self.slots[index]) {
            (0..=39, None) => self.allocate(index)?,
            (40..=49, None) => self.allocate_zeroed(index)?,
            (50..=54, None) => self.allocate_aligned(index)?,
            (55..=74, Some(slot)) => self.resize(index, slot)?,
            (95..=99, _) => self.batch()?,
            (_, Some(slot)) => self.free(index, slot)?,
            (_, None) => self.allocate(index)?,
        }
        let live = self.slots.iter().flatten().count();
        self.summary.live_blocks = live;
        self.summary.peak_live_blocks = self.summary.peak_live_blocks.max(live);
        if self.config.check_every != 0 && self.summary.ops % self.config.check_every == 0 {
            self.check()?;
        }
        Ok(())
    }

    pub fn check(&mut self) -> Result<(), HarnessError> {
        self.summary.checks += 1;
        if self.zone.check() {
            return Ok(());
        }
        let cause = self
            .zone
            .last_error()
            .map_or_else(|| String::from("unknown"), |e| e.to_string());
        Err(HarnessError::CheckFailed {
            op: self.summary.ops,
            cause,
        })
    }

    fn next_tag(&self) -> u8 {
        // Never 0, so zeroed memory cannot pass for a filled block.
        (self.summary.ops % 255) as u8 + 1
    }

    fn out_of_memory(&self, requested: usize) -> HarnessError {
        HarnessError::Zone(
            self.zone
                .last_error()
                .unwrap_or(ZoneError::OutOfMemory { requested }),
        )
    }

    fn mismatch(&self, what: &'static str, ptr: *mut u8) -> HarnessError {
        HarnessError::ContentMismatch {
            op: self.summary.ops,
            what,
            ptr: ptr as usize,
        }
    }

    /// Check the usable size, then fill the block and store it.
    fn install(&mut self, index: usize, ptr: *mut u8, len: usize) -> Result<(), HarnessError> {
        if self.zone.size(ptr) < len {
            return Err(self.mismatch("usable size below request", ptr));
        }
        let tag = self.next_tag();
        // SAFETY: the block is live and at least `len` bytes.
        unsafe { ptr.write_bytes(tag, len) };
        self.slots[index] = Some(Slot { ptr, len, tag });
        Ok(())
    }

    fn verify(&mut self, slot: Slot, len: usize) -> Result<(), HarnessError> {
        // SAFETY: the block is live and holds at least `slot.len >= len`
        // bytes written by `install`.
        let bytes = unsafe { std::slice::from_raw_parts(slot.ptr, len) };
        if bytes.iter().any(|&b| b != slot.tag) {
            return Err(self.mismatch("block contents changed", slot.ptr));
        }
        self.summary.verified_bytes += len as u64;
        Ok(())
    }

    fn allocate(&mut self, index: usize) -> Result<(), HarnessError> {
        let len = self.rng.gen_size(self.config.max_size);
        let ptr = self.zone.allocate(len);
        if ptr.is_null() {
            return Err(self.out_of_memory(len));
        }
        self.summary.allocations += 1;
        self.install(index, ptr, len)
    }

    fn allocate_zeroed(&mut self, index: usize) -> Result<(), HarnessError> {
        let len = self.rng.gen_size(self.config.max_size);
        let ptr = self.zone.allocate_zeroed(1, len);
        if ptr.is_null() {
            return Err(self.out_of_memory(len));
        }
        // SAFETY: fresh block of at least `len` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        if bytes.iter().any(|&b| b != 0) {
            return Err(self.mismatch("zeroed block is dirty", ptr));
        }
        self.summary.zeroed_allocations += 1;
        self.install(index, ptr, len)
    }

    fn allocate_aligned(&mut self, index: usize) -> Result<(), HarnessError> {
        let len = self.rng.gen_size(self.config.max_size);
        let align = (1usize << (4 + self.rng.below(10))).min(self.zone.page_size());
        let ptr = self.zone.allocate_aligned(len, align);
        if ptr.is_null() {
            return Err(self.out_of_memory(len));
        }
        if ptr as usize % align != 0 {
            return Err(self.mismatch("misaligned block", ptr));
        }
        self.summary.aligned_allocations += 1;
        self.install(index, ptr, len)
    }

    fn resize(&mut self, index: usize, slot: Slot) -> Result<(), HarnessError> {
        let len = self.rng.gen_size(self.config.max_size * 2);
        self.verify(slot, slot.len)?;
        // SAFETY: `slot.ptr` is a live block of this zone.
        let ptr = unsafe { self.zone.resize(slot.ptr, len) };
        if ptr.is_null() {
            return Err(self.out_of_memory(len));
        }
        self.summary.resizes += 1;
        if ptr == slot.ptr {
            self.summary.resizes_in_place += 1;
        }
        let kept = Slot { ptr, ..slot };
        self.verify(kept, slot.len.min(len))?;
        self.install(index, ptr, len.max(slot.len))
    }

    fn free(&mut self, index: usize, slot: Slot) -> Result<(), HarnessError> {
        self.verify(slot, slot.len)?;
        self.slots[index] = None;
        // SAFETY: the slot held the only reference to this live block.
        unsafe { self.zone.free(slot.ptr) };
        self.summary.frees += 1;
        Ok(())
    }

    /// Take a batch of equal tiny blocks, fill and verify them, give them back.
    fn batch(&mut self) -> Result<(), HarnessError> {
        let size = 1 + self.rng.below(TINY_LIMIT);
        let mut out = [std::ptr::null_mut(); BATCH_WIDTH];
        let got = self.zone.batch_allocate(size, &mut out);
        self.summary.batch_requests += 1;
        self.summary.batch_blocks += got as u64;
        let tag = self.next_tag();
        for &ptr in &out[..got] {
            if self.zone.size(ptr) < size {
                return Err(self.mismatch("batch block too small", ptr));
            }
            // SAFETY: fresh block of at least `size` bytes.
            unsafe { ptr.write_bytes(tag, size) };
        }
        for &ptr in &out[..got] {
            self.verify(Slot { ptr, len: size, tag }, size)?;
        }
        // SAFETY: every non-null entry came from `batch_allocate` above.
        unsafe { self.zone.batch_free(&mut out[..got]) };
        Ok(())
    }

    /// Free every live block.
    pub fn release_all(&mut self) {
        for slot in self.slots.iter_mut().filter_map(Option::take) {
            // SAFETY: each slot owns its block.
            unsafe { self.zone.free(slot.ptr) };
        }
        self.summary.live_blocks = 0;
    }
}

impl Drop for Workload {
    fn drop(&mut self) {
        self.release_all();
        // SAFETY: the zone is private to this workload and nothing refers to
        // its blocks any more.
        unsafe { self.zone.destroy() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(seed: u64) -> WorkloadConfig {
        WorkloadConfig {
            seed,
            ops: 3000,
            max_size: 40 * 1024,
            slots: 64,
            check_every: 500,
            flags: ZoneFlags::NONE,
        }
    }

    #[test]
    fn same_seed_same_summary() {
        let a = Workload::new(small_config(7)).unwrap().run().unwrap().clone();
        let b = Workload::new(small_config(7)).unwrap().run().unwrap().clone();
        assert_eq!(a, b);
        assert_eq!(a.ops, 3000);
        assert_eq!(a.checks, 3000 / 500 + 1);
        assert!(a.allocations > 0 && a.frees > 0 && a.resizes > 0);
    }

    #[test]
    fn release_all_empties_the_zone() {
        let mut w = Workload::new(small_config(11)).unwrap();
        w.run().unwrap();
        w.release_all();
        assert_eq!(w.zone().statistics().blocks_in_use, 0);
        assert!(w.zone().check());
    }

    #[test]
    fn scribbling_zone_survives_the_mix() {
        let mut config = small_config(3);
        config.flags = ZoneFlags::DO_SCRIBBLE;
        let mut w = Workload::new(config).unwrap();
        let summary = w.run().unwrap();
        assert!(summary.verified_bytes > 0);
    }
}
