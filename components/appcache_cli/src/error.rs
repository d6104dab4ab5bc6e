//! Error types for the CLI

use appcache::AppCacheError;
use resource_fetcher::FetchError;
use response_storage::StorageError;
use std::fmt;

/// CLI-specific errors
#[derive(Debug)]
pub enum CliError {
    /// Engine failure
    AppCache(AppCacheError),

    /// Storage could not be opened
    Storage(StorageError),

    /// HTTP client could not be built
    Fetch(FetchError),

    /// File I/O error
    IoError(std::io::Error),

    /// Config file could not be decoded
    ConfigError(String),

    /// The update ended with an error event
    UpdateFailed(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::AppCache(e) => write!(f, "{}", e),
            CliError::Storage(e) => write!(f, "Storage error: {}", e),
            CliError::Fetch(e) => write!(f, "Fetch error: {}", e),
            CliError::IoError(e) => write!(f, "File error: {}", e),
            CliError::ConfigError(s) => write!(f, "Config error: {}", s),
            CliError::UpdateFailed(s) => write!(f, "Update failed: {}", s),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::AppCache(e) => Some(e),
            CliError::Storage(e) => Some(e),
            CliError::Fetch(e) => Some(e),
            CliError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AppCacheError> for CliError {
    fn from(err: AppCacheError) -> Self {
        CliError::AppCache(err)
    }
}

impl From<StorageError> for CliError {
    fn from(err: StorageError) -> Self {
        CliError::Storage(err)
    }
}

impl From<FetchError> for CliError {
    fn from(err: FetchError) -> Self {
        CliError::Fetch(err)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::IoError(err)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::ConfigError(err.to_string())
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
