//! CLI entrypoint for the zonemalloc harness.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use zonemalloc_core::ZoneFlags;
use zonemalloc_harness::structured_log::{LogLevel, Outcome};
use zonemalloc_harness::{HarnessError, LogEmitter, LogEntry, Workload, WorkloadConfig, ZoneReport};

/// Stress and reporting tooling for zonemalloc.
#[derive(Debug, Parser)]
#[command(name = "zonemalloc-harness")]
#[command(about = "Seeded stress runs and reports for zonemalloc")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Root seed (decimal or 0x...).
    #[arg(long, default_value = "0xDEAD_BEEF")]
    seed: String,
    /// Number of operations.
    #[arg(long, default_value_t = 100_000)]
    ops: u64,
    /// Largest single request in bytes.
    #[arg(long, default_value_t = 256 * 1024)]
    max_size: usize,
    /// Live-block slots.
    #[arg(long, default_value_t = 1024)]
    slots: usize,
    /// Check the zone every N operations (0 = only at the end).
    #[arg(long, default_value_t = 5000)]
    check_every: u64,
    /// Zone flags, e.g. `guard,scribble`.
    #[arg(long, default_value = "none")]
    flags: String,
}

impl RunArgs {
    fn config(&self) -> Result<WorkloadConfig, HarnessError> {
        Ok(WorkloadConfig {
            seed: parse_seed(&self.seed)?,
            ops: self.ops,
            max_size: self.max_size,
            slots: self.slots,
            check_every: self.check_every,
            flags: ZoneFlags::from_str_loose(&self.flags).ok_or_else(|| HarnessError::BadFlags(self.flags.clone()))?,
        })
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a seeded workload and fail on any inconsistency.
    Stress {
        #[command(flatten)]
        run: RunArgs,
        /// Write a JSONL log of the run and the zone's recent events.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Run a workload and write a report of the resulting zone.
    Report {
        #[command(flatten)]
        run: RunArgs,
        /// Output path for the markdown report; JSON is written alongside.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress { run, log } => {
            let config = run.config()?;
            let mut emitter = log
                .as_deref()
                .map(|path| LogEmitter::to_file(path, &format!("stress-{:x}", config.seed)))
                .transpose()?;
            if let Some(emitter) = emitter.as_mut() {
                emitter.emit_entry(
                    LogEntry::new("", LogLevel::Info, "stress_start").with_details(serde_json::json!({
                        "seed": config.seed,
                        "ops": config.ops,
                        "flags": config.flags.bits(),
                    })),
                )?;
            }

            let started = Instant::now();
            let mut workload = Workload::new(config)?;
            let result = workload.run().cloned();
            let elapsed = started.elapsed().as_millis() as u64;

            if let Some(emitter) = emitter.as_mut() {
                let mut records = [zonemalloc_core::ZoneLogRecord::EMPTY; zonemalloc_core::log::EVENT_LOG_CAPACITY];
                let n = workload.zone().recent_events(&mut records);
                emitter.emit_zone_records(&records[..n])?;
                let outcome = if result.is_ok() { Outcome::Pass } else { Outcome::Fail };
                let mut end = LogEntry::new("", LogLevel::Info, "stress_end")
                    .with_outcome(outcome)
                    .with_duration_ms(elapsed);
                if let Ok(summary) = &result {
                    end = end.with_details(serde_json::to_value(summary)?);
                }
                emitter.emit_entry(end)?;
                emitter.flush()?;
            }

            let summary = result?;
            eprintln!(
                "Stress complete: ops={}, allocations={}, frees={}, resizes={} ({} in place), checks={}, peak_live={}, {elapsed} ms",
                summary.ops,
                summary.allocations,
                summary.frees,
                summary.resizes,
                summary.resizes_in_place,
                summary.checks,
                summary.peak_live_blocks,
            );
        }
        Command::Report { run, output } => {
            let config = run.config()?;
            let mut workload = Workload::new(config)?;
            workload.run()?;
            let report = ZoneReport::capture("zonemalloc Zone Report", &workload)?;

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, report.to_markdown())?;
                    let json_path = path.with_extension("json");
                    std::fs::write(&json_path, report.to_json())?;
                    eprintln!("Wrote report to {} and {}", path.display(), json_path.display());
                }
                None => println!("{}", report.to_json()),
            }

            if !report.is_consistent() {
                return Err("enumeration disagrees with zone statistics".into());
            }
        }
    }

    Ok(())
}

fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let s = raw.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        s.replace('_', "").parse::<u64>()
    };
    parsed.map_err(|_| HarnessError::BadSeed(raw.to_string()))
}
