//! The network call behind the transport.
//!
//! `Transport` builds fully-formed requests and hands them to an
//! `HttpBackend`; the production backend is a thin wrapper over
//! `reqwest::Client`.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Proxy, StatusCode};
use thiserror::Error;
use tracing::debug;

/// HTTP request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid proxy URL {url}: {reason}")]
    InvalidProxy { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Outbound proxying and certificate verification. The two move together:
/// a proxy is only ever used for interception, so setting one turns
/// verification off and clearing it turns verification back on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    pub proxy: Option<String>,
    pub verify_tls: bool,
}

impl NetworkOptions {
    pub fn proxied(url: impl Into<String>) -> Self {
        Self {
            proxy: Some(url.into()),
            verify_tls: false,
        }
    }
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            proxy: None,
            verify_tls: true,
        }
    }
}

#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, BackendError>;

    /// Apply new network options to subsequent requests.
    fn configure(&self, _options: &NetworkOptions) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Backend over `reqwest`.
/// Clone of the inner client is cheap - reqwest::Client uses Arc internally.
pub struct ReqwestBackend {
    client: RwLock<Client>,
    timeout: Duration,
}

impl ReqwestBackend {
    pub fn new(timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            client: RwLock::new(build_client(timeout, &NetworkOptions::default())?),
            timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else {
            BackendError::Network(err)
        }
    }
}

// reqwest sends no User-Agent unless one is configured, and the service
// rejects requests that present one. Never set it here.
fn build_client(timeout: Duration, options: &NetworkOptions) -> Result<Client, BackendError> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!options.verify_tls);
    if let Some(ref url) = options.proxy {
        let proxy = Proxy::https(url).map_err(|e| BackendError::InvalidProxy {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        builder = builder.proxy(proxy);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, BackendError> {
        let client = self.client.read().clone();

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;
        debug!(method = %request.method, url = %request.url, %status, "Response received");

        Ok(HttpResponse { status, body })
    }

    fn configure(&self, options: &NetworkOptions) -> Result<(), BackendError> {
        let client = build_client(self.timeout, options)?;
        *self.client.write() = client;
        Ok(())
    }
}
