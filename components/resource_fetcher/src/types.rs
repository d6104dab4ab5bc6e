use bytes::Bytes;
use core_types::{http, Headers, ResponseInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// MIME type a manifest response must carry.
pub const MANIFEST_MIME_TYPE: &str = "text/cache-manifest";

/// One outgoing GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Target URL.
    pub url: Url,
    /// Extra request headers, typically conditional validators.
    pub headers: Headers,
}

impl FetchRequest {
    /// Plain GET of `url`.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            headers: Headers::new(),
        }
    }

    /// Replaces the request headers.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// True when the request carries `If-Modified-Since` or `If-None-Match`.
    pub fn is_conditional(&self) -> bool {
        self.headers.contains("if-modified-since") || self.headers.contains("if-none-match")
    }
}

/// A completed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// URL the response belongs to.
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// Full response body.
    pub body: Bytes,
}

impl FetchResponse {
    /// Creates a response.
    pub fn new(url: Url, status: u16, headers: Headers, body: Bytes) -> Self {
        Self {
            url,
            status,
            headers,
            body,
        }
    }

    /// 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 3xx status other than 304.
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status) && self.status != 304
    }

    /// 304 status.
    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// Lower-cased MIME type of the response.
    pub fn mime_type(&self) -> Option<String> {
        http::mime_type(&self.headers)
    }

    /// `Retry-After` in seconds; HTTP dates count as "later".
    pub fn retry_after(&self) -> Option<u64> {
        http::retry_after_seconds(&self.headers)
    }

    /// Metadata to store alongside the body.
    pub fn response_info(&self) -> ResponseInfo {
        let mut info = ResponseInfo::new(self.status, self.headers.clone());
        info.body_size = self.body.len() as u64;
        info
    }
}

/// Settings of the HTTP fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherOptions {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("appcache/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetcherOptions {
    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}
