//! Dispatch of reassembled requests against the origin server.
//!
//! The pipeline never sees transport failures: every failure mode folds
//! into the synthetic 500 response, and route denials into the synthetic
//! 403, so a completed request always produces exactly one response.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// A request ready to be issued against the origin.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    /// Path (plus query) appended to the destination prefix.
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// The origin's answer, fully buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl OriginResponse {
    /// Synthetic response for any transport, timeout, or protocol failure.
    pub fn request_failed() -> Self {
        Self {
            status: 500,
            headers: HashMap::new(),
            body: b"Request failed".to_vec(),
        }
    }

    /// Synthetic response for a route the gate denies.
    pub fn forbidden_route() -> Self {
        Self {
            status: 403,
            headers: HashMap::new(),
            body: b"Forbidden route".to_vec(),
        }
    }
}

/// The injected origin HTTP client.
#[async_trait]
pub trait OriginClient: Send + Sync {
    /// Issue the request. Implementations must be total: failures come
    /// back as [`OriginResponse::request_failed`], never as errors.
    async fn fetch(&self, request: OriginRequest) -> OriginResponse;
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("invalid method")]
    Method,
    #[error("invalid header")]
    Header,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Production origin client over reqwest.
pub struct HttpOriginClient {
    destination: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpOriginClient {
    /// `destination` is the origin URL prefix (`http://` or `https://`);
    /// `timeout` bounds each request end to end.
    pub fn new(destination: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().use_rustls_tls().build()?;
        Ok(Self {
            destination: destination.trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    async fn try_fetch(&self, request: OriginRequest) -> Result<OriginResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FetchError::Method)?;
        let url = format!("{}{}", self.destination, request.url);

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| FetchError::Header)?;
            let value = HeaderValue::from_str(value).map_err(|_| FetchError::Header)?;
            headers.insert(name, value);
        }

        let resp = self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status().as_u16();
        // Multi-valued headers collapse to the first value.
        let mut out_headers = HashMap::new();
        for name in resp.headers().keys() {
            if let Some(value) = resp.headers().get(name) {
                if let Ok(value) = value.to_str() {
                    out_headers.insert(name.as_str().to_string(), value.to_string());
                }
            }
        }
        let body = resp.bytes().await?.to_vec();

        Ok(OriginResponse {
            status,
            headers: out_headers,
            body,
        })
    }
}

#[async_trait]
impl OriginClient for HttpOriginClient {
    async fn fetch(&self, request: OriginRequest) -> OriginResponse {
        let url = request.url.clone();
        match self.try_fetch(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, error = %err, "origin request failed");
                OriginResponse::request_failed()
            }
        }
    }
}
