//! # zonemalloc-core
//!
//! A size-class zone allocator.
//!
//! One [`Zone`] serves three classes of request behind a single mutex:
//! tiny blocks (quanta of [`tiny::TINY_QUANTUM`] bytes, bitmap metadata),
//! small blocks (512-byte quanta, tag-word metadata) and standalone page
//! extents for everything from [`small::LARGE_THRESHOLD`] up. Pages come
//! from a [`PageProvider`]; [`SystemPages`] maps them with `mmap`.
//!
//! Zone state that outside observers need is published through atomics,
//! so [`introspect::enumerate`] can walk a zone without its lock while
//! other threads allocate.

mod check;
pub mod config;
pub mod error;
pub mod free_list;
pub mod introspect;
pub mod large;
pub mod log;
pub mod page;
pub mod region;
pub mod small;
pub mod tiny;
pub mod zone;

pub use config::ZoneFlags;
pub use error::{CorruptionKind, ZoneError};
pub use introspect::{EnumerateMask, LocalReader, MemoryReader, RangeKind, RangeRecorder, VmRange};
pub use log::{LogLevel, ZoneLogRecord};
pub use page::{GuardPages, PageProvider, SystemPages};
pub use zone::{ClassStatistics, SizeClass, Zone, ZoneStatistics};
