//! Persistence boundary of the application cache.
//!
//! Groups and caches are stored as [`GroupRecord`] / [`CacheRecord`]
//! values; response bodies are streamed through [`ResponseWriter`] and
//! [`ResponseReader`] keyed by an opaque [`ResponseId`]. Every operation is
//! asynchronous; implementations may complete immediately or after yielding.
//!
//! # Overview
//!
//! - [`ResponseStorage`] - the storage contract
//! - [`MemoryStorage`] - in-process working set with failure injection
//! - [`DiskStorage`] - JSON index plus per-response files on disk
//!
//! # Examples
//!
//! ```
//! use response_storage::{MemoryStorage, ResponseStorage};
//! use url::Url;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let storage = MemoryStorage::new();
//! let manifest_url = Url::parse("http://example.com/manifest").unwrap();
//! let loaded = storage.load_or_create_group(&manifest_url).await.unwrap();
//! assert!(loaded.newest_cache.is_none());
//! # });
//! ```
//!
//! [`GroupRecord`]: core_types::GroupRecord
//! [`CacheRecord`]: core_types::CacheRecord
//! [`ResponseId`]: core_types::ResponseId

#![warn(missing_docs)]
#![warn(clippy::all)]

mod disk;
mod error;
mod lookup;
mod memory;
mod traits;

pub use disk::DiskStorage;
pub use error::{StorageError, StorageResult};
pub use lookup::find_main_response;
pub use memory::MemoryStorage;
pub use traits::{read_all, LoadedGroup, MainResponse, ResponseReader, ResponseStorage, ResponseWriter};
