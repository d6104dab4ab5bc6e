//! Fetching manifests and resources for the application cache.
//!
//! The update engine issues exactly one GET per URL through a
//! [`ResourceFetcher`]. Redirects are surfaced as 3xx responses and never
//! followed. Dropping the returned future cancels the request.
//!
//! # Overview
//!
//! - [`ResourceFetcher`] - the fetch contract
//! - [`HttpFetcher`] - reqwest-backed implementation
//! - [`MockFetcher`] - scripted implementation for tests
//! - [`RetryTable`] - per-URL attempt counters and the 503 retry rule
//!
//! # Examples
//!
//! ```
//! use resource_fetcher::{FetchRequest, MockFetcher, MockResponse, ResourceFetcher};
//! use url::Url;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let url = Url::parse("http://example.com/manifest").unwrap();
//! let fetcher = MockFetcher::new();
//! fetcher.set_response(&url, MockResponse::manifest("CACHE MANIFEST\n"));
//!
//! let response = fetcher.fetch(FetchRequest::get(url.clone())).await.unwrap();
//! assert_eq!(response.status, 200);
//! assert_eq!(fetcher.request_count(&url), 1);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod http;
mod mock;
mod retry;
mod traits;
mod types;

pub use error::{FetchError, FetchResult};
pub use http::HttpFetcher;
pub use mock::{MockFetcher, MockReply, MockResponse};
pub use retry::{FetchAttempt, RetryDecision, RetryPolicy, RetryTable};
pub use traits::ResourceFetcher;
pub use types::{FetchRequest, FetchResponse, FetcherOptions, MANIFEST_MIME_TYPE};
