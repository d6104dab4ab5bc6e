//! Core data model of the application cache.
//!
//! This crate provides the types shared by storage, fetching and the update
//! engine: identifiers, entry role bits, the parsed manifest, persistable
//! records and the slice of HTTP response metadata the engine interprets.
//!
//! # Overview
//!
//! - [`EntryKind`] / [`AppCacheEntry`] - roles of a URL inside one cache
//! - [`Manifest`] / [`ManifestParser`] - the resource list of one version
//! - [`GroupRecord`] / [`CacheRecord`] - what storage persists
//! - [`ResponseInfo`] / [`Headers`] - stored response metadata
//!
//! # Examples
//!
//! ```
//! use core_types::{parse_manifest, EntryKind};
//! use url::Url;
//!
//! let manifest_url = Url::parse("http://example.com/manifest").unwrap();
//! let manifest = parse_manifest(&manifest_url, b"CACHE MANIFEST\nindex.html\n").unwrap();
//! assert_eq!(manifest.explicit_urls.len(), 1);
//!
//! let kind = EntryKind::EXPLICIT | EntryKind::MASTER;
//! assert!(kind.contains(EntryKind::MASTER));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod entry;
mod error;
pub mod http;
mod ids;
mod manifest;
mod records;

pub use entry::{AppCacheEntry, EntryKind};
pub use error::{ManifestError, ManifestResult};
pub use http::{Headers, ResponseInfo};
pub use ids::{CacheId, GroupId, HostId, ResponseId};
pub use manifest::{parse_manifest, DefaultManifestParser, FallbackNamespace, Manifest, ManifestParser};
pub use records::{origin_of, AppCacheInfo, AppCacheInfoCollection, CacheRecord, GroupRecord};
