use async_trait::async_trait;

use crate::error::FetchResult;
use crate::types::{FetchRequest, FetchResponse};

/// Issues one GET request.
///
/// Implementations must not follow redirects and must not retry; both are
/// decisions of the caller. Dropping the returned future cancels the request
/// and no completion is observed afterwards.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetches `request.url` with `request.headers`.
    async fn fetch(&self, request: FetchRequest) -> FetchResult<FetchResponse>;
}
