//! Run reports: statistics plus what an enumeration of the zone saw.

use serde::{Deserialize, Serialize};

use zonemalloc_core::{EnumerateMask, RangeKind, SizeClass, VmRange, Zone, ZoneError, ZoneLogRecord, ZoneStatistics};

use crate::error::HarnessError;
use crate::workload::{Workload, WorkloadSummary};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassReport {
    pub class: String,
    pub blocks_in_use: usize,
    pub size_in_use: usize,
}

/// Serializable view of [`ZoneStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub blocks_in_use: usize,
    pub size_in_use: usize,
    pub max_size_in_use: usize,
    pub size_allocated: usize,
    pub tiny_regions: usize,
    pub small_regions: usize,
    pub errors: usize,
    pub classes: Vec<ClassReport>,
}

impl From<&ZoneStatistics> for StatisticsReport {
    fn from(s: &ZoneStatistics) -> Self {
        let classes = SizeClass::ALL
            .iter()
            .zip([s.tiny, s.small, s.large, s.huge])
            .map(|(class, stats)| ClassReport {
                class: class.as_str().to_string(),
                blocks_in_use: stats.blocks_in_use,
                size_in_use: stats.size_in_use,
            })
            .collect();
        Self {
            blocks_in_use: s.blocks_in_use,
            size_in_use: s.size_in_use,
            max_size_in_use: s.max_size_in_use,
            size_allocated: s.size_allocated,
            tiny_regions: s.tiny_regions,
            small_regions: s.small_regions,
            errors: s.errors,
            classes,
        }
    }
}

/// Range counts from one full enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationTally {
    pub in_use_blocks: usize,
    pub in_use_bytes: usize,
    pub regions: usize,
    pub region_bytes: usize,
    pub admin_ranges: usize,
    pub admin_bytes: usize,
    pub batches: usize,
}

impl EnumerationTally {
    pub fn collect(zone: &Zone) -> Result<Self, ZoneError> {
        let mut tally = Self::default();
        let mut recorder = |kind: RangeKind, ranges: &[VmRange]| {
            tally.batches += 1;
            let bytes: usize = ranges.iter().map(|r| r.size).sum();
            let (count, total) = match kind {
                RangeKind::InUse => (&mut tally.in_use_blocks, &mut tally.in_use_bytes),
                RangeKind::Region => (&mut tally.regions, &mut tally.region_bytes),
                RangeKind::Admin => (&mut tally.admin_ranges, &mut tally.admin_bytes),
            };
            *count += ranges.len();
            *total += bytes;
        };
        zone.enumerate(EnumerateMask::ALL, &mut recorder)?;
        Ok(tally)
    }
}

/// A workload run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneReport {
    pub title: String,
    pub seed: u64,
    pub flags: u32,
    pub check_passed: bool,
    pub summary: WorkloadSummary,
    pub statistics: StatisticsReport,
    pub enumeration: EnumerationTally,
    /// Most recent zone events, oldest first.
    pub events: Vec<String>,
}

impl ZoneReport {
    /// Snapshot a workload's zone as it stands.
    pub fn capture(title: impl Into<String>, workload: &Workload) -> Result<Self, HarnessError> {
        let zone = workload.zone();
        let enumeration = EnumerationTally::collect(zone)?;
        let check_passed = zone.check();
        let mut records = [ZoneLogRecord::EMPTY; zonemalloc_core::log::EVENT_LOG_CAPACITY];
        let n = zone.recent_events(&mut records);
        Ok(Self {
            title: title.into(),
            seed: workload.config().seed,
            flags: zone.flags().bits(),
            check_passed,
            summary: workload.summary().clone(),
            statistics: StatisticsReport::from(&zone.statistics()),
            enumeration,
            events: records[..n].iter().map(ToString::to_string).collect(),
        })
    }

    /// Whether the live set seen by enumeration agrees with the counters.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.check_passed
            && self.enumeration.in_use_blocks == self.statistics.blocks_in_use
            && self.enumeration.in_use_bytes == self.statistics.size_in_use
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let s = &self.statistics;
        let e = &self.enumeration;
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Seed: {:#x}\n", self.seed));
        out.push_str(&format!("- Flags: {:#x}\n", self.flags));
        out.push_str(&format!("- Ops: {}\n", self.summary.ops));
        out.push_str(&format!("- Check: {}\n", if self.check_passed { "PASS" } else { "FAIL" }));
        out.push_str(&format!(
            "- In use: {} blocks, {} bytes (peak {} bytes)\n",
            s.blocks_in_use, s.size_in_use, s.max_size_in_use
        ));
        out.push_str(&format!("- Allocated: {} bytes\n", s.size_allocated));
        out.push_str(&format!(
            "- Enumerated: {} in use, {} regions, {} admin ranges\n\n",
            e.in_use_blocks, e.regions, e.admin_ranges
        ));

        out.push_str("| Class | Blocks | Bytes |\n");
        out.push_str("|-------|--------|-------|\n");
        for c in &s.classes {
            out.push_str(&format!("| {} | {} | {} |\n", c.class, c.blocks_in_use, c.size_in_use));
        }
        if !self.events.is_empty() {
            out.push_str("\n## Recent events\n\n");
            for event in &self.events {
                out.push_str(&format!("- `{event}`\n"));
            }
        }
        out
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::WorkloadConfig;

    #[test]
    fn report_agrees_with_counters() {
        let mut w = Workload::new(WorkloadConfig {
            ops: 2000,
            slots: 100,
            ..WorkloadConfig::default()
        })
        .unwrap();
        w.run().unwrap();
        let report = ZoneReport::capture("unit", &w).unwrap();
        assert!(report.is_consistent(), "{report:?}");
        assert_eq!(report.statistics.classes.len(), 4);
        assert!(report.enumeration.regions >= 1);
        assert!(report.enumeration.admin_ranges >= 1);

        let md = report.to_markdown();
        assert!(md.starts_with("# unit\n"));
        assert!(md.contains("| tiny |"));

        let back: ZoneReport = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(back.summary, report.summary);
        assert_eq!(back.enumeration, report.enumeration);
    }
}
