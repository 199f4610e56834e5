//! Zone event log.
//!
//! The zone cannot allocate while it is logging, so lifecycle records go
//! into a fixed ring inside the zone itself and diagnostics are formatted
//! into a stack buffer and written straight to stderr.

use core::fmt::{self, Write as _};

use crate::error::ZoneError;

/// Records kept in the ring.
pub const EVENT_LOG_CAPACITY: usize = 16;

/// Zone log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured zone lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    pub level: LogLevel,
    /// Zone operation (`allocate`, `free`, `resize`, `check`, ...).
    pub symbol: &'static str,
    /// Event kind (`region_created`, `table_grown`, `error`, ...).
    pub event: &'static str,
    /// Address involved in the event.
    pub ptr: Option<usize>,
    /// Size involved in the event.
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub error: Option<ZoneError>,
}

impl ZoneLogRecord {
    /// Placeholder for caller-provided buffers.
    pub const EMPTY: Self = Self {
        decision_id: 0,
        level: LogLevel::Trace,
        symbol: "",
        event: "",
        ptr: None,
        size: None,
        outcome: "",
        error: None,
    };
}

impl fmt::Display for ZoneLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {}:{} outcome={}",
            self.decision_id,
            self.level.as_str(),
            self.symbol,
            self.event,
            self.outcome
        )?;
        if let Some(ptr) = self.ptr {
            write!(f, " ptr={ptr:#x}")?;
        }
        if let Some(size) = self.size {
            write!(f, " size={size}")?;
        }
        if let Some(error) = self.error {
            write!(f, " error=\"{error}\"")?;
        }
        Ok(())
    }
}

/// Fixed-capacity ring of the most recent records.
#[derive(Debug)]
pub struct EventLog {
    records: [Option<ZoneLogRecord>; EVENT_LOG_CAPACITY],
    next: usize,
    next_decision_id: u64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: [None; EVENT_LOG_CAPACITY],
            next: 0,
            next_decision_id: 1,
        }
    }

    /// Append a record, overwriting the oldest once full.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        level: LogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        outcome: &'static str,
        error: Option<ZoneError>,
    ) -> u64 {
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        self.records[self.next % EVENT_LOG_CAPACITY] = Some(ZoneLogRecord {
            decision_id,
            level,
            symbol,
            event,
            ptr,
            size,
            outcome,
            error,
        });
        self.next = self.next.wrapping_add(1);
        decision_id
    }

    /// Total records ever written.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.next_decision_id - 1
    }

    /// Retained records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ZoneLogRecord> {
        let start = self.next.saturating_sub(EVENT_LOG_CAPACITY);
        (start..self.next).filter_map(|n| self.records[n % EVENT_LOG_CAPACITY].as_ref())
    }

    /// Most recent record that carries an error.
    #[must_use]
    pub fn last_error(&self) -> Option<ZoneError> {
        self.iter().filter_map(|r| r.error).last()
    }
}

/// `fmt::Write` sink over a stack buffer; output past the end is dropped.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> StackWriter<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Write the buffered bytes to file descriptor `fd`.
    pub fn flush_to_fd(&mut self, fd: i32) {
        let mut done = 0;
        while done < self.len {
            let rest = &self.buf[done..self.len];
            // SAFETY: `rest` is a live byte slice.
            let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
            if n <= 0 {
                break;
            }
            done += n as usize;
        }
        self.len = 0;
    }
}

impl<const N: usize> fmt::Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Write one `zonemalloc` diagnostic line to stderr without allocating.
pub fn write_diagnostic(zone_address: usize, error: &ZoneError) {
    let mut out = StackWriter::<256>::new();
    let _ = writeln!(out, "zonemalloc[{zone_address:#x}]: *** {error}");
    out.flush_to_fd(libc::STDERR_FILENO);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CorruptionKind;

    #[test]
    fn ring_keeps_latest_records_in_order() {
        let mut log = EventLog::new();
        for n in 0..(EVENT_LOG_CAPACITY + 3) {
            log.record(LogLevel::Debug, "allocate", "region_created", Some(n), None, "ok", None);
        }
        let ptrs: Vec<_> = log.iter().map(|r| r.ptr.unwrap()).collect();
        assert_eq!(ptrs.len(), EVENT_LOG_CAPACITY);
        assert_eq!(ptrs[0], 3);
        assert_eq!(*ptrs.last().unwrap(), EVENT_LOG_CAPACITY + 2);
        assert_eq!(log.total(), (EVENT_LOG_CAPACITY + 3) as u64);
    }

    #[test]
    fn last_error_skips_plain_records() {
        let mut log = EventLog::new();
        assert_eq!(log.last_error(), None);
        let err = ZoneError::corruption(CorruptionKind::DoubleFree, 0x40);
        log.record(LogLevel::Error, "free", "error", Some(0x40), None, "reported", Some(err));
        log.record(LogLevel::Debug, "allocate", "region_created", None, None, "ok", None);
        assert_eq!(log.last_error(), Some(err));
    }

    #[test]
    fn record_display_is_single_line() {
        let mut log = EventLog::new();
        log.record(LogLevel::Warn, "allocate", "error", None, Some(64), "null", Some(ZoneError::OutOfMemory { requested: 64 }));
        let line = log.iter().next().unwrap().to_string();
        assert!(line.starts_with("#1 warn allocate:error outcome=null size=64"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn stack_writer_truncates() {
        let mut out = StackWriter::<8>::new();
        write!(out, "0123456789").unwrap();
        assert_eq!(out.as_bytes(), b"01234567");
    }
}
