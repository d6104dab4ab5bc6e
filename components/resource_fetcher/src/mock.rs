//! Scripted fetcher for tests.

use async_trait::async_trait;
use bytes::Bytes;
use core_types::Headers;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use url::Url;

use crate::error::{FetchError, FetchResult};
use crate::traits::ResourceFetcher;
use crate::types::{FetchRequest, FetchResponse, MANIFEST_MIME_TYPE};

/// Canned response served by [`MockFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// Response body.
    pub body: Bytes,
}

impl MockResponse {
    /// 200 with `body`.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// 200 manifest response with the manifest MIME type.
    pub fn manifest(body: impl Into<Bytes>) -> Self {
        Self::ok(body).with_header("Content-Type", MANIFEST_MIME_TYPE)
    }

    /// Empty response with `status`.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Adds a response header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// One scripted outcome.
pub type MockReply = Result<MockResponse, FetchError>;

#[derive(Default)]
struct MockState {
    scripts: HashMap<Url, VecDeque<MockReply>>,
    gates: HashMap<Url, Arc<Semaphore>>,
    requests: Vec<FetchRequest>,
}

/// Fetcher answering from per-URL scripts.
///
/// A script is a sequence of replies; each request consumes one and the last
/// reply repeats forever. URLs without a script answer 404. A URL can be
/// *held* so its requests park until [`release`](MockFetcher::release).
#[derive(Default)]
pub struct MockFetcher {
    state: Mutex<MockState>,
    request_seen: Notify,
}

impl MockFetcher {
    /// Creates a fetcher with no scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `url` with `response`.
    pub fn set_response(&self, url: &Url, response: MockResponse) {
        self.set_sequence(url, vec![Ok(response)]);
    }

    /// Always fail `url` with `error`.
    pub fn set_error(&self, url: &Url, error: FetchError) {
        self.set_sequence(url, vec![Err(error)]);
    }

    /// Answer `url` with `replies` in order, repeating the last one.
    pub fn set_sequence(&self, url: &Url, replies: Vec<MockReply>) {
        self.state.lock().scripts.insert(url.clone(), replies.into());
    }

    /// Parks every request for `url` until released.
    pub fn hold(&self, url: &Url) {
        self.state
            .lock()
            .gates
            .insert(url.clone(), Arc::new(Semaphore::new(0)));
    }

    /// Lets parked and future requests for `url` proceed.
    pub fn release(&self, url: &Url) {
        if let Some(gate) = self.state.lock().gates.remove(url) {
            gate.close();
        }
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests received for `url`.
    pub fn requests_for(&self, url: &Url) -> Vec<FetchRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| &r.url == url)
            .cloned()
            .collect()
    }

    /// Number of requests received for `url`.
    pub fn request_count(&self, url: &Url) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| &r.url == url)
            .count()
    }

    /// Number of requests received in total.
    pub fn total_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Waits until at least `count` requests for `url` have been received.
    pub async fn wait_for_requests(&self, url: &Url, count: usize) {
        loop {
            let notified = self.request_seen.notified();
            if self.request_count(url) >= count {
                return;
            }
            notified.await;
        }
    }

    fn next_reply(&self, request: &FetchRequest) -> (MockReply, Option<Arc<Semaphore>>) {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        let gate = state.gates.get(&request.url).cloned();
        let reply = match state.scripts.get_mut(&request.url) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        };
        (reply.unwrap_or_else(|| Ok(MockResponse::status(404))), gate)
    }
}

#[async_trait]
impl ResourceFetcher for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> FetchResult<FetchResponse> {
        let (reply, gate) = self.next_reply(&request);
        self.request_seen.notify_waiters();

        if let Some(gate) = gate {
            // A closed semaphore means the URL was released.
            let _ = gate.acquire().await;
        }

        let response = reply?;
        Ok(FetchResponse::new(
            request.url,
            response.status,
            response.headers,
            response.body,
        ))
    }
}
