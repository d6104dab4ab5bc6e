use thiserror::Error;

/// Failure of a single fetch.
///
/// HTTP error statuses are not errors at this layer; they arrive as
/// [`FetchResponse`](crate::FetchResponse) values and are classified by the
/// caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transport failure: DNS, connect, reset, TLS.
    #[error("network error: {0}")]
    Network(String),
    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The request was cancelled before completing.
    #[error("request cancelled")]
    Cancelled,
    /// The response may not be stored under the cache's security policy.
    #[error("policy denied: {0}")]
    PolicyDenied(String),
    /// The response could not be read.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The HTTP client could not be constructed.
    #[error("client setup failed: {0}")]
    Client(String),
}

impl FetchError {
    /// Creates a network error.
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Creates a policy denial.
    pub fn policy_denied<S: Into<String>>(msg: S) -> Self {
        Self::PolicyDenied(msg.into())
    }

    /// Creates an invalid-response error.
    pub fn invalid_response<S: Into<String>>(msg: S) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Maps a reqwest error, keeping timeouts distinct.
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_builder() {
            Self::Client(error.to_string())
        } else if error.is_body() || error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }

    /// Checks if this error indicates a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout)
    }

    /// Checks if this error is a policy denial.
    pub fn is_policy_denied(&self) -> bool {
        matches!(self, FetchError::PolicyDenied(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::from_reqwest(error)
    }
}

/// Result alias for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;
