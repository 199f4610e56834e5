//! # zonemalloc-abi
//!
//! C boundary for `zonemalloc-core`.
//!
//! # Architecture
//!
//! ```text
//! C caller ──► malloc_abi (malloc/free/...) ──► process zone ──► Zone
//!          └─► vtable (MallocZone function table) ─────────────► Zone
//! Rust     ──► ZoneAllocator (GlobalAlloc) ──► process zone
//! ```
//!
//! The process-wide zone is created lazily on first use with flags taken
//! from the `ZONEMALLOC_*` environment variables. Zones created through
//! [`vtable::zonemalloc_create_zone`] are independent of it.

// Unit tests run inside a binary that uses the system allocator; exporting
// `malloc` from that binary would shadow it.
#[cfg(not(test))]
pub mod malloc_abi;

pub mod global_alloc;
pub mod vtable;
pub mod zone_state;

pub use global_alloc::ZoneAllocator;
pub use vtable::{MallocIntrospection, MallocStatistics, MallocZone, zonemalloc_create_zone};
pub use zone_state::try_process_zone;
