//! Zone error taxonomy.
//!
//! Errors never cross the zone boundary as panics. Internals return
//! `Result<_, ZoneError>` and the zone funnels every `Err` through one
//! reporting hook that logs, counts, and (optionally) aborts.

use thiserror::Error;

/// What kind of heap corruption was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionKind {
    /// The block was already free (or parked in the last-free cache).
    DoubleFree,
    /// A free-list node failed its `previous ^ next ^ MAGIC` check.
    BadChecksum,
    /// Block metadata disagrees with itself (sizes, list membership).
    BadMetadata,
}

impl CorruptionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DoubleFree => "double free",
            Self::BadChecksum => "bad free-list checksum",
            Self::BadMetadata => "bad block metadata",
        }
    }
}

impl core::fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors detected by a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ZoneError {
    #[error("out of memory: page provider refused {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("corruption detected ({kind}) at {ptr:#x}")]
    CorruptionDetected { kind: CorruptionKind, ptr: usize },
    #[error("invariant violated: {what} at {address:#x}")]
    InvariantViolation { what: &'static str, address: usize },
    #[error("pointer {ptr:#x} was not allocated by this zone")]
    Misuse { ptr: usize },
    #[error("reader could not map {size} bytes at {address:#x}")]
    ReadFailed { address: usize, size: usize },
}

impl ZoneError {
    pub(crate) const fn corruption(kind: CorruptionKind, ptr: usize) -> Self {
        Self::CorruptionDetected { kind, ptr }
    }

    /// Machine-readable label used in log records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::CorruptionDetected { .. } => "corruption_detected",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::Misuse { .. } => "misuse",
            Self::ReadFailed { .. } => "read_failed",
        }
    }

    /// Whether `ABORT_ON_CORRUPTION` applies to this error.
    #[must_use]
    pub const fn is_fatal_candidate(&self) -> bool {
        matches!(
            self,
            Self::CorruptionDetected { .. } | Self::Misuse { .. } | Self::InvariantViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_address() {
        let err = ZoneError::corruption(CorruptionKind::DoubleFree, 0x1000);
        assert_eq!(err.to_string(), "corruption detected (double free) at 0x1000");
        assert_eq!(err.label(), "corruption_detected");
    }

    #[test]
    fn out_of_memory_is_not_fatal() {
        assert!(!ZoneError::OutOfMemory { requested: 1 }.is_fatal_candidate());
        assert!(ZoneError::Misuse { ptr: 8 }.is_fatal_candidate());
    }
}
