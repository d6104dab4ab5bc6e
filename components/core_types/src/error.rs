//! Errors shared by the data model.

use thiserror::Error;

/// Failure to interpret manifest bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    /// The body does not start with `CACHE MANIFEST`.
    #[error("manifest signature not found")]
    MissingSignature,
    /// The manifest URL itself cannot host a cache.
    #[error("unsupported manifest url: {0}")]
    UnsupportedUrl(String),
}

impl ManifestError {
    /// Creates an unsupported-url error.
    pub fn unsupported_url(url: impl Into<String>) -> Self {
        Self::UnsupportedUrl(url.into())
    }
}

/// Result alias for manifest parsing.
pub type ManifestResult<T> = Result<T, ManifestError>;
