//! Zone creation flags.
//!
//! Flags are fixed when a zone is created. They can be built directly,
//! parsed from a loose comma list (`"guard,scribble"`), or picked up from
//! `ZONEMALLOC_*` environment variables:
//! - `ZONEMALLOC_GUARD_EDGES`: bracket large extents with guard pages.
//! - `ZONEMALLOC_DO_NOT_PROTECT_PRELUDE` / `ZONEMALLOC_DO_NOT_PROTECT_POSTLUDE`:
//!   skip one of the two guard pages.
//! - `ZONEMALLOC_SCRIBBLE`: overwrite freed memory with `0x55`.
//! - `ZONEMALLOC_ABORT_ON_CORRUPTION`: abort after reporting corruption.

use core::ffi::CStr;
use core::ops::{BitOr, BitOrAssign};

use crate::page::GuardPages;

/// Byte written over freed blocks when scribbling is on.
pub const SCRIBBLE_BYTE: u8 = 0x55;

/// Bit-field of zone creation flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneFlags(u32);

impl ZoneFlags {
    pub const NONE: Self = Self(0);
    /// Bracket every large/huge extent with inaccessible pages.
    pub const ADD_GUARD_PAGES: Self = Self(1 << 0);
    /// With guard pages on, skip the page below the extent.
    pub const DONT_PROTECT_PRELUDE: Self = Self(1 << 3);
    /// With guard pages on, skip the page above the extent.
    pub const DONT_PROTECT_POSTLUDE: Self = Self(1 << 4);
    /// Overwrite freed memory with [`SCRIBBLE_BYTE`].
    pub const DO_SCRIBBLE: Self = Self(1 << 5);
    /// Abort the process after reporting corruption or misuse.
    pub const ABORT_ON_CORRUPTION: Self = Self(1 << 6);

    const ALL_BITS: u32 = Self::ADD_GUARD_PAGES.0
        | Self::DONT_PROTECT_PRELUDE.0
        | Self::DONT_PROTECT_POSTLUDE.0
        | Self::DO_SCRIBBLE.0
        | Self::ABORT_ON_CORRUPTION.0;

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keeps only the bits this crate knows about.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL_BITS)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn scribble(self) -> bool {
        self.contains(Self::DO_SCRIBBLE)
    }

    #[must_use]
    pub const fn abort_on_corruption(self) -> bool {
        self.contains(Self::ABORT_ON_CORRUPTION)
    }

    /// Guard-page layout for large and huge extents.
    #[must_use]
    pub const fn guard_pages(self) -> GuardPages {
        if !self.contains(Self::ADD_GUARD_PAGES) {
            return GuardPages::NONE;
        }
        GuardPages {
            prelude: !self.contains(Self::DONT_PROTECT_PRELUDE),
            postlude: !self.contains(Self::DONT_PROTECT_POSTLUDE),
        }
    }

    /// Parse a comma/space separated flag list (case-insensitive).
    ///
    /// Returns `None` if any word is unknown.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        let mut flags = Self::NONE;
        for word in s.split([',', ' ', '|']).filter(|w| !w.is_empty()) {
            flags |= match word.to_ascii_lowercase().as_str() {
                "none" | "default" => Self::NONE,
                "guard" | "guard-pages" | "guard_pages" => Self::ADD_GUARD_PAGES,
                "no-prelude" | "no_prelude" => Self::DONT_PROTECT_PRELUDE,
                "no-postlude" | "no_postlude" => Self::DONT_PROTECT_POSTLUDE,
                "scribble" => Self::DO_SCRIBBLE,
                "abort" | "abort-on-corruption" => Self::ABORT_ON_CORRUPTION,
                _ => return None,
            };
        }
        Some(flags)
    }

    /// Read flags from the environment.
    ///
    /// Uses `getenv` directly: this runs while the process allocator is being
    /// initialized, so it must not allocate.
    #[must_use]
    pub fn from_env() -> Self {
        let table: [(&CStr, Self); 5] = [
            (c"ZONEMALLOC_GUARD_EDGES", Self::ADD_GUARD_PAGES),
            (c"ZONEMALLOC_DO_NOT_PROTECT_PRELUDE", Self::DONT_PROTECT_PRELUDE),
            (c"ZONEMALLOC_DO_NOT_PROTECT_POSTLUDE", Self::DONT_PROTECT_POSTLUDE),
            (c"ZONEMALLOC_SCRIBBLE", Self::DO_SCRIBBLE),
            (c"ZONEMALLOC_ABORT_ON_CORRUPTION", Self::ABORT_ON_CORRUPTION),
        ];
        let mut flags = Self::NONE;
        for (name, flag) in table {
            if env_flag_set(name) {
                flags |= flag;
            }
        }
        flags
    }
}

impl BitOr for ZoneFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for ZoneFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

/// Set means present and not `"0"`.
fn env_flag_set(name: &CStr) -> bool {
    // SAFETY: `name` is NUL-terminated. The returned pointer is only read
    // while no other thread in this crate mutates the environment.
    let value = unsafe { libc::getenv(name.as_ptr()) };
    if value.is_null() {
        return false;
    }
    // SAFETY: getenv returned a NUL-terminated string.
    let value = unsafe { CStr::from_ptr(value) };
    value.to_bytes() != b"0"
}
