//! Cache entries and their role bits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::ResponseId;

/// Bitmask of the roles a URL plays inside one cache.
///
/// A single URL may be listed explicitly, be a fallback target and be a
/// master entry at the same time; the roles are merged rather than stored
/// as separate entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryKind(u8);

impl EntryKind {
    /// No role.
    pub const NONE: EntryKind = EntryKind(0);
    /// The manifest resource itself.
    pub const MANIFEST: EntryKind = EntryKind(1 << 0);
    /// Named in the CACHE section of the manifest.
    pub const EXPLICIT: EntryKind = EntryKind(1 << 1);
    /// Target of a FALLBACK namespace.
    pub const FALLBACK: EntryKind = EntryKind(1 << 2);
    /// Added because a host navigated to it.
    pub const MASTER: EntryKind = EntryKind(1 << 3);
    /// Master entry that turned out to declare a different manifest.
    pub const FOREIGN: EntryKind = EntryKind(1 << 4);

    /// Builds a kind from raw bits, dropping unknown bits.
    pub fn from_bits(bits: u8) -> Self {
        EntryKind(bits & 0b1_1111)
    }

    /// Raw bit representation.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set.
    pub fn contains(self, other: EntryKind) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when at least one bit of `other` is set.
    pub fn intersects(self, other: EntryKind) -> bool {
        self.0 & other.0 != 0
    }

    /// True when no bit is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns a copy with the bits of `other` cleared.
    pub fn without(self, other: EntryKind) -> Self {
        EntryKind(self.0 & !other.0)
    }
}

impl BitOr for EntryKind {
    type Output = EntryKind;

    fn bitor(self, rhs: EntryKind) -> EntryKind {
        EntryKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for EntryKind {
    fn bitor_assign(&mut self, rhs: EntryKind) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EntryKind, &str); 5] = [
            (EntryKind::MANIFEST, "manifest"),
            (EntryKind::EXPLICIT, "explicit"),
            (EntryKind::FALLBACK, "fallback"),
            (EntryKind::MASTER, "master"),
            (EntryKind::FOREIGN, "foreign"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(kind, _)| self.contains(*kind))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// One URL inside a cache.
///
/// `response_id` is `None` only while the entry is being assembled by an
/// update; entries of a complete cache always point at a stored response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCacheEntry {
    /// Roles of this URL.
    pub kind: EntryKind,
    /// Stored response, once known.
    pub response_id: Option<ResponseId>,
    /// Size in bytes of the stored body.
    pub response_size: u64,
}

impl AppCacheEntry {
    /// Creates an entry with no response yet.
    pub fn new(kind: EntryKind) -> Self {
        Self {
            kind,
            response_id: None,
            response_size: 0,
        }
    }

    /// Creates an entry pointing at a stored response.
    pub fn with_response(kind: EntryKind, response_id: ResponseId, response_size: u64) -> Self {
        Self {
            kind,
            response_id: Some(response_id),
            response_size,
        }
    }

    /// Merges additional role bits into this entry.
    pub fn add_kind(&mut self, kind: EntryKind) {
        self.kind |= kind;
    }

    /// True for the manifest entry.
    pub fn is_manifest(&self) -> bool {
        self.kind.contains(EntryKind::MANIFEST)
    }

    /// True for explicit entries.
    pub fn is_explicit(&self) -> bool {
        self.kind.contains(EntryKind::EXPLICIT)
    }

    /// True for fallback targets.
    pub fn is_fallback(&self) -> bool {
        self.kind.contains(EntryKind::FALLBACK)
    }

    /// True for master entries.
    pub fn is_master(&self) -> bool {
        self.kind.contains(EntryKind::MASTER)
    }

    /// True for entries marked foreign.
    pub fn is_foreign(&self) -> bool {
        self.kind.contains(EntryKind::FOREIGN)
    }

    /// True once the entry points at a stored response.
    pub fn has_response_id(&self) -> bool {
        self.response_id.is_some()
    }
}
