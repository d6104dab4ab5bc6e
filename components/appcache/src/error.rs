use core_types::{CacheId, ManifestError};
use resource_fetcher::FetchError;
use response_storage::StorageError;
use thiserror::Error;

/// Failures surfaced by the service and group APIs.
///
/// Update failures are not reported here; they reach hosts as
/// [`AppCacheEvent::Error`](crate::AppCacheEvent::Error).
#[derive(Debug, Error, Clone)]
pub enum AppCacheError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Fetch failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Manifest URL or body not usable.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// The cache still has hosts associated with it.
    #[error("{0} is still in use by hosts")]
    CacheInUse(CacheId),
    /// No tokio runtime was available to run updates on.
    #[error("no tokio runtime available")]
    NoRuntime,
}

impl AppCacheError {
    /// Checks if the error reports a missing stored item.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppCacheError::Storage(e) if e.is_not_found())
    }
}

/// Result alias for service operations.
pub type AppCacheResult<T> = Result<T, AppCacheError>;
