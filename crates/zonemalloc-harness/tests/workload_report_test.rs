//! Integration test: harness workloads, reports and logs.
//!
//! Run: cargo test -p zonemalloc-harness --test workload_report_test

#![allow(unsafe_code)]

use zonemalloc_core::ZoneFlags;
use zonemalloc_harness::structured_log::{LogLevel, validate_log};
use zonemalloc_harness::{LogEmitter, Workload, WorkloadConfig, ZoneReport};

fn config(seed: u64, flags: ZoneFlags) -> WorkloadConfig {
    WorkloadConfig {
        seed,
        ops: 4000,
        max_size: 96 * 1024,
        slots: 128,
        check_every: 1000,
        flags,
    }
}

#[test]
fn guarded_and_scribbled_runs_stay_consistent() {
    for flags in [
        ZoneFlags::NONE,
        ZoneFlags::ADD_GUARD_PAGES,
        ZoneFlags::ADD_GUARD_PAGES | ZoneFlags::DONT_PROTECT_POSTLUDE,
        ZoneFlags::DO_SCRIBBLE,
    ] {
        let mut workload = Workload::new(config(0x1234, flags)).expect("zone");
        workload.run().expect("run");
        let report = ZoneReport::capture("flags", &workload).expect("report");
        assert!(report.is_consistent(), "flags {:#x}: {report:?}", flags.bits());
        assert_eq!(report.flags, flags.bits());
        assert_eq!(report.statistics.errors, 0);
    }
}

#[test]
fn different_seeds_take_different_paths() {
    let a = Workload::new(config(1, ZoneFlags::NONE)).unwrap().run().unwrap().clone();
    let b = Workload::new(config(2, ZoneFlags::NONE)).unwrap().run().unwrap().clone();
    assert_eq!(a.ops, b.ops);
    assert_ne!(a, b);
}

#[test]
fn zone_events_become_valid_log_lines() {
    let mut workload = Workload::new(config(9, ZoneFlags::NONE)).unwrap();
    workload.run().unwrap();
    // One deliberate misuse so the log carries an error record.
    let mut bogus = [0u8; 64];
    unsafe { workload.zone().free(bogus.as_mut_ptr()) };

    let mut records = [zonemalloc_core::ZoneLogRecord::EMPTY; 16];
    let n = workload.zone().recent_events(&mut records);
    assert!(n > 0);

    let mut emitter = LogEmitter::to_buffer("it");
    emitter.emit(LogLevel::Info, "begin").unwrap();
    emitter.emit_zone_records(&records[..n]).unwrap();
    let lines = emitter.lines();
    assert_eq!(lines.len(), n + 1);
    assert_eq!(validate_log(&lines.join("\n")), Ok(n + 1));
    assert!(lines.iter().any(|l| l.contains("\"error\"") && l.contains("\"symbol\":\"free\"")));
}
