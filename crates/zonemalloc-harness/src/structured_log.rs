//! Structured JSONL logging for harness runs.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required and optional fields.
//! - [`LogEmitter`]: writes records to a file, stdout, or an in-memory buffer.
//! - [`validate_log_line`]: checks a single line against the schema.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use zonemalloc_core::ZoneLogRecord;

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<zonemalloc_core::LogLevel> for LogLevel {
    fn from(level: zonemalloc_core::LogLevel) -> Self {
        match level {
            zonemalloc_core::LogLevel::Trace => Self::Trace,
            zonemalloc_core::LogLevel::Debug => Self::Debug,
            zonemalloc_core::LogLevel::Info => Self::Info,
            zonemalloc_core::LogLevel::Warn => Self::Warn,
            zonemalloc_core::LogLevel::Error => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

/// Canonical log record.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Zone operation (`allocate`, `free`, ...) when the record came from a zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Zone error text, when one was reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Free-form context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            run_id: None,
            symbol: None,
            ptr: None,
            size: None,
            outcome: None,
            error: None,
            duration_ms: None,
            details: None,
        }
    }

    /// Convert a zone event-log record. The trace id is filled in on emit.
    #[must_use]
    pub fn from_zone_record(record: &ZoneLogRecord) -> Self {
        let mut entry = Self::new(String::new(), record.level.into(), record.event);
        entry.symbol = Some(record.symbol.to_string());
        entry.ptr = record.ptr;
        entry.size = record.size;
        entry.error = record.error.map(|e| e.to_string());
        entry.details = Some(serde_json::json!({
            "decision_id": record.decision_id,
            "zone_outcome": record.outcome,
        }));
        entry
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Writes JSONL records, numbering trace ids per run.
pub struct LogEmitter<W: Write> {
    writer: W,
    seq: u64,
    run_id: String,
}

impl LogEmitter<std::io::BufWriter<std::fs::File>> {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(std::io::BufWriter::new(file), run_id))
    }
}

impl LogEmitter<Vec<u8>> {
    /// Create an emitter over an in-memory buffer.
    #[must_use]
    pub fn to_buffer(run_id: &str) -> Self {
        Self::new(Vec::new(), run_id)
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.writer)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl<W: Write> LogEmitter<W> {
    pub fn new(writer: W, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{:05}", self.run_id, self.seq)
    }

    /// Emit a bare record with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let entry = LogEntry::new(String::new(), level, event);
        self.emit_entry(entry)
    }

    /// Emit `entry`, filling in the trace and run ids when unset.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<LogEntry> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.run_id.is_none() {
            entry.run_id = Some(self.run_id.clone());
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(entry)
    }

    /// Emit every zone record in order.
    pub fn emit_zone_records(&mut self, records: &[ZoneLogRecord]) -> std::io::Result<()> {
        for record in records {
            self.emit_entry(LogEntry::from_zone_record(record))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}: {}", self.line_number, self.field, self.message)
    }
}

/// Validate one JSONL line.
pub fn validate_log_line(line: &str, line_number: usize) -> Result<LogEntry, Vec<LogValidationError>> {
    let error = |field: &str, message: String| LogValidationError {
        line_number,
        field: field.to_string(),
        message,
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Err(vec![error("<json>", format!("invalid JSON: {e}"))]),
    };
    let Some(obj) = value.as_object() else {
        return Err(vec![error("<root>", "expected JSON object".to_string())]);
    };

    let mut errors = Vec::new();
    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(error(field, "required field missing".to_string()));
        }
    }
    if let Some(level) = obj.get("level").and_then(|v| v.as_str()) {
        if !["trace", "debug", "info", "warn", "error"].contains(&level) {
            errors.push(error("level", format!("invalid level: '{level}'")));
        }
    }
    if let Some(outcome) = obj.get("outcome").and_then(|v| v.as_str()) {
        if !["pass", "fail", "error"].contains(&outcome) {
            errors.push(error("outcome", format!("invalid outcome: '{outcome}'")));
        }
    }
    // Zone error records always name the operation.
    if obj.get("error").is_some() && obj.get("symbol").and_then(|v| v.as_str()).is_none() {
        errors.push(error("symbol", "error records must name a symbol".to_string()));
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value(value).map_err(|e| vec![error("<schema>", e.to_string())])
}

/// Validate every non-empty line of a JSONL document.
pub fn validate_log(body: &str) -> Result<usize, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let mut valid = 0;
    for (n, line) in body.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        match validate_log_line(line, n + 1) {
            Ok(_) => valid += 1,
            Err(mut errs) => errors.append(&mut errs),
        }
    }
    if errors.is_empty() { Ok(valid) } else { Err(errors) }
}

/// RFC 3339 UTC timestamp with millisecond precision.
fn now_utc() -> String {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        since_epoch.subsec_millis(),
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }

    #[test]
    fn emitted_lines_validate() {
        let mut emitter = LogEmitter::to_buffer("run");
        emitter.emit(LogLevel::Info, "start").unwrap();
        emitter
            .emit_entry(
                LogEntry::new("", LogLevel::Warn, "check")
                    .with_symbol("check")
                    .with_outcome(Outcome::Fail)
                    .with_details(serde_json::json!({ "op": 7 })),
            )
            .unwrap();
        let lines = emitter.lines();
        assert_eq!(lines.len(), 2);
        let first = validate_log_line(&lines[0], 1).unwrap();
        assert_eq!(first.trace_id, "run::00001");
        assert_eq!(first.run_id.as_deref(), Some("run"));
        let second = validate_log_line(&lines[1], 2).unwrap();
        assert_eq!(second.outcome, Some(Outcome::Fail));
        assert_eq!(validate_log(&lines.join("\n")), Ok(2));
    }

    #[test]
    fn bad_lines_are_rejected() {
        assert!(validate_log_line("not json", 1).is_err());
        assert!(validate_log_line("[1]", 1).is_err());
        let errs = validate_log_line(r#"{"timestamp":"t","level":"loud","event":"x"}"#, 3).unwrap_err();
        let fields: Vec<_> = errs.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, ["trace_id", "level"]);
        let errs =
            validate_log_line(r#"{"timestamp":"t","trace_id":"a","level":"error","event":"e","error":"x"}"#, 4)
                .unwrap_err();
        assert_eq!(errs[0].field, "symbol");
    }
}
