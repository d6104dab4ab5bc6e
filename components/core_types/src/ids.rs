//! Opaque numeric identifiers.
//!
//! Groups, caches and responses are identified by 64-bit ids handed out by
//! storage. Hosts are identified by ids handed out by the service.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw numeric value.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

numeric_id!(
    /// Identifies one cache group (one manifest URL).
    GroupId,
    "group"
);

numeric_id!(
    /// Identifies one cache snapshot.
    CacheId,
    "cache"
);

numeric_id!(
    /// Identifies one stored response (headers plus body).
    ResponseId,
    "response"
);

numeric_id!(
    /// Identifies one host (a page or frame using a cache).
    HostId,
    "host"
);
