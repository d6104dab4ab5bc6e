use async_trait::async_trait;
use core_types::Headers;
use reqwest::{redirect, Client};

use crate::error::{FetchError, FetchResult};
use crate::traits::ResourceFetcher;
use crate::types::{FetchRequest, FetchResponse, FetcherOptions};

/// Fetcher backed by a shared `reqwest::Client`.
///
/// The client never follows redirects so the caller can reject redirected
/// manifests and resources.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    inner: Client,
    options: FetcherOptions,
}

impl HttpFetcher {
    /// Builds the underlying client.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Client`] when the TLS backend cannot be
    /// initialised.
    pub fn new(options: FetcherOptions) -> FetchResult<Self> {
        let inner = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(options.request_timeout)
            .user_agent(options.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { inner, options })
    }

    /// Options the fetcher was built with.
    pub fn options(&self) -> &FetcherOptions {
        &self.options
    }

    fn apply_headers(mut req: reqwest::RequestBuilder, headers: &Headers) -> reqwest::RequestBuilder {
        for (k, v) in headers.iter() {
            req = req.header(k, v);
        }
        req
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> FetchResult<FetchResponse> {
        let req = self.inner.get(request.url.clone());
        let req = Self::apply_headers(req, &request.headers);

        tracing::debug!(url = %request.url, conditional = request.is_conditional(), "fetching");
        let resp = req.send().await.map_err(FetchError::from)?;
        let status = resp.status().as_u16();

        let mut headers = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str(), v);
            }
        }

        let body = resp.bytes().await.map_err(FetchError::from)?;
        tracing::debug!(url = %request.url, status, bytes = body.len(), "fetched");
        Ok(FetchResponse::new(request.url, status, headers, body))
    }
}
