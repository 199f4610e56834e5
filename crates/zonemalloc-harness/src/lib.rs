//! Stress and reporting harness for zonemalloc.
//!
//! This crate provides:
//! - Workloads: seeded alloc/free/resize/batch mixes over a private zone,
//!   with content verification and periodic consistency checks
//! - Reports: statistics plus enumeration tallies, as JSON or markdown
//! - Structured logs: JSONL records of harness and zone events

pub mod error;
pub mod report;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use report::ZoneReport;
pub use structured_log::{LogEmitter, LogEntry};
pub use workload::{Workload, WorkloadConfig, WorkloadSummary};
