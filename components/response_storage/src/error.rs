use thiserror::Error;

/// Failure of a storage operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The requested group, cache or response does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(String),
    /// Stored data could not be decoded.
    #[error("corrupt data: {0}")]
    Corrupt(String),
    /// A writer or reader was used out of order.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// The backend refused the operation.
    #[error("storage operation failed: {0}")]
    Failed(String),
}

impl StorageError {
    /// Creates a not-found error.
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a refusal error.
    pub fn failed<S: Into<String>>(msg: S) -> Self {
        Self::Failed(msg.into())
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Checks if the error reports a missing item.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(error.to_string())
        } else {
            Self::Io(error.to_string())
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Self::Corrupt(error.to_string())
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
