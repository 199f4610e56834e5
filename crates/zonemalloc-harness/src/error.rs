use thiserror::Error;

use zonemalloc_core::ZoneError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown zone flag in '{0}'")]
    BadFlags(String),
    #[error("invalid seed '{0}'")]
    BadSeed(String),
    #[error("zone could not be created")]
    CreateFailed,
    #[error("zone: {0}")]
    Zone(#[from] ZoneError),
    #[error("op {op}: {what} for block {ptr:#x}")]
    ContentMismatch { op: u64, what: &'static str, ptr: usize },
    #[error("op {op}: consistency check failed ({cause})")]
    CheckFailed { op: u64, cause: String },
}
