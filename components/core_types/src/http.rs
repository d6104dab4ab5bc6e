//! HTTP response metadata stored alongside cached bodies.
//!
//! Only the handful of header semantics the update engine needs are
//! interpreted here: validators, freshness, `Vary`, `Retry-After` and the
//! MIME type.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Case-insensitive header map.
///
/// Names are stored lower-cased. Inserting a name twice joins the values
/// with `", "` the way repeated HTTP headers combine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value, combining with an existing one.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let value = value.into();
        self.0
            .entry(name.as_ref().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    /// Replaces any existing value.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Builder form of [`Headers::set`].
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Looks up a header by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// True when the header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Removes a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    /// Iterates `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no headers are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Status line and headers of a stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// When the request was issued.
    pub request_time: DateTime<Utc>,
    /// When the response arrived.
    pub response_time: DateTime<Utc>,
    /// Size of the body in bytes, filled in when the body is complete.
    pub body_size: u64,
}

impl ResponseInfo {
    /// Creates info for a response received now.
    pub fn new(status: u16, headers: Headers) -> Self {
        let now = Utc::now();
        Self {
            status,
            headers,
            request_time: now,
            response_time: now,
            body_size: 0,
        }
    }

    /// Overrides the response time.
    pub fn with_response_time(mut self, response_time: DateTime<Utc>) -> Self {
        self.response_time = response_time;
        self
    }

    /// `Last-Modified` header value.
    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified")
    }

    /// `ETag` header value.
    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    /// True when the response can be revalidated with a conditional request.
    pub fn has_validators(&self) -> bool {
        self.last_modified().is_some() || self.etag().is_some()
    }

    /// True when the response carries a `Vary` header.
    pub fn has_vary(&self) -> bool {
        self.headers.contains("vary")
    }

    /// Lower-cased MIME type without parameters.
    pub fn mime_type(&self) -> Option<String> {
        mime_type(&self.headers)
    }

    /// True when `Cache-Control` carries `directive`.
    pub fn has_cache_control(&self, directive: &str) -> bool {
        cache_control_directives(&self.headers).any(|(name, _)| name == directive)
    }

    /// `max-age` from `Cache-Control`, in seconds.
    pub fn max_age(&self) -> Option<i64> {
        cache_control_directives(&self.headers)
            .find(|(name, _)| *name == "max-age")
            .and_then(|(_, value)| value)
            .and_then(|value| value.trim_matches('"').parse().ok())
    }

    /// Parsed `Expires` header.
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.headers.get("expires").and_then(parse_http_date)
    }

    /// True when the stored response may be reused at `now` without
    /// revalidation.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.has_cache_control("no-cache") || self.has_cache_control("no-store") {
            return false;
        }
        if let Some(max_age) = self.max_age() {
            return match Duration::try_seconds(max_age) {
                Some(limit) => now - self.response_time < limit,
                None => true,
            };
        }
        match self.expires() {
            Some(expires) => now < expires,
            None => false,
        }
    }

    /// Request headers that revalidate this response.
    pub fn conditional_headers(&self) -> Headers {
        conditional_headers_for(&self.headers)
    }
}

/// Builds `If-Modified-Since` / `If-None-Match` from response validators.
pub fn conditional_headers_for(response_headers: &Headers) -> Headers {
    let mut headers = Headers::new();
    if let Some(last_modified) = response_headers.get("last-modified") {
        headers.set("if-modified-since", last_modified);
    }
    if let Some(etag) = response_headers.get("etag") {
        headers.set("if-none-match", etag);
    }
    headers
}

/// Lower-cased MIME type of `Content-Type` without parameters.
pub fn mime_type(headers: &Headers) -> Option<String> {
    headers.get("content-type").map(|value| {
        value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    })
}

/// Parses `Retry-After` as delta seconds.
///
/// HTTP-date values are reported as `Some(u64::MAX)`: they always ask for a
/// later retry.
pub fn retry_after_seconds(headers: &Headers) -> Option<u64> {
    let value = headers.get("retry-after")?.trim();
    Some(value.parse().unwrap_or(u64::MAX))
}

/// Parses an HTTP date (RFC 1123 form).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn cache_control_directives(headers: &Headers) -> impl Iterator<Item = (&str, Option<&str>)> {
    headers
        .get("cache-control")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(|directive| match directive.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (directive, None),
        })
}
