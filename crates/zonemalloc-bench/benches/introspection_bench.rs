//! Enumeration and check cost on a populated zone.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use zonemalloc_core::{EnumerateMask, RangeKind, SystemPages, VmRange, Zone, ZoneFlags};

fn populated(blocks: usize) -> (&'static Zone, Vec<*mut u8>) {
    let zone = Zone::create(SystemPages::global(), ZoneFlags::NONE).expect("zone");
    let ptrs = (0..blocks).map(|n| zone.allocate(16 + (n * 97) % 12_000)).collect();
    (zone, ptrs)
}

fn bench_enumerate(c: &mut Criterion) {
    let mut group = c.benchmark_group("enumerate");
    for blocks in [1_000usize, 10_000] {
        let (zone, ptrs) = populated(blocks);
        group.bench_with_input(BenchmarkId::new("in_use", blocks), &blocks, |b, _| {
            b.iter(|| {
                let mut seen = 0usize;
                let mut recorder = |_: RangeKind, ranges: &[VmRange]| seen += ranges.len();
                zone.enumerate(EnumerateMask::IN_USE, &mut recorder).expect("enumerate");
                criterion::black_box(seen);
            });
        });
        group.bench_with_input(BenchmarkId::new("check", blocks), &blocks, |b, _| {
            b.iter(|| criterion::black_box(zone.check()));
        });
        for p in ptrs {
            unsafe { zone.free(p) };
        }
        unsafe { zone.destroy() };
    }
    group.finish();
}

criterion_group!(benches, bench_enumerate);
criterion_main!(benches);
