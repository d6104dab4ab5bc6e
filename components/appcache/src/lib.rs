//! The application cache update engine.
//!
//! Keeps an offline application cache (a manifest plus the resources it
//! names) in sync with its server while any number of hosts use the
//! installed version, ask for new master entries, or wait on an update
//! already in flight.
//!
//! # Overview
//!
//! - [`AppCacheService`] - entry point: hosts, groups, lookups, deletion
//! - [`AppCacheGroup`] - one manifest URL, its cache history and its update
//! - [`AppCache`] - one complete snapshot of entries
//! - [`AppCacheHost`] / [`AppCacheFrontend`] - consumers and their event sink
//! - [`UpdateConfig`] - retry ceiling, concurrency, restart delay
//!
//! An update runs as one spawned task per group. It fetches the manifest,
//! downloads what changed, re-validates the manifest and commits the new
//! cache through [`ResponseStorage`](response_storage::ResponseStorage).
//! Hosts observe it through [`AppCacheEvent`]s.
//!
//! # Examples
//!
//! ```
//! use appcache::{AppCacheService, RecordingFrontend, ServiceContext};
//! use resource_fetcher::{MockFetcher, MockResponse};
//! use response_storage::MemoryStorage;
//! use std::sync::Arc;
//! use url::Url;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let manifest_url = Url::parse("http://example.com/manifest").unwrap();
//! let fetcher = Arc::new(MockFetcher::new());
//! fetcher.set_response(&manifest_url, MockResponse::manifest("CACHE MANIFEST\n"));
//!
//! let context = ServiceContext::builder(Arc::new(MemoryStorage::new()), fetcher)
//!     .build()
//!     .unwrap();
//! let service = AppCacheService::new(context);
//! let frontend = RecordingFrontend::new();
//! let host = service.create_host(frontend.clone());
//!
//! let group = service.start_update(Some(&host), &manifest_url, None).await.unwrap();
//! group.wait_for_idle().await;
//! assert!(group.newest_complete_cache().is_some());
//! assert_eq!(
//!     frontend.event_names_for(host.host_id()),
//!     vec!["checking", "downloading", "progress", "cached"]
//! );
//! # });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod config;
mod error;
mod event;
mod group;
mod host;
mod service;
mod update_job;

pub use cache::AppCache;
pub use config::UpdateConfig;
pub use error::{AppCacheError, AppCacheResult};
pub use event::{AppCacheEvent, AppCacheFrontend, LogLevel, RecordingFrontend};
pub use group::{AppCacheGroup, UpdateStatus};
pub use host::AppCacheHost;
pub use service::{AppCacheService, CheckResponseResult, ServiceContext, ServiceContextBuilder};
pub use update_job::{InternalState, UpdateType};
