//! Authenticated transport bound to a single credential.

use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::backend::{HttpBackend, HttpRequest, HttpResponse, NetworkOptions};
use super::envelope::{EnvelopeCodec, SymmetricKey};
use super::error::{ApiError, SERVICE_AUTH_EXPIRED_CODE};
use super::BackendError;
use crate::auth::{AuthError, Credential, Identity};

/// Header carrying the encrypted query envelope.
pub const PAYLOAD_HEADER: &str = "payload";

const ACCEPT_TEXT: &str = "text/plain";
const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

pub type ApiResult<T = Value> = Result<T, ApiError>;

/// Query or body fields sent inside an envelope.
pub type Payload = Map<String, Value>;

struct Binding {
    bearer: Credential,
    identity: Identity,
    network: NetworkOptions,
}

pub struct Transport {
    backend: Arc<dyn HttpBackend>,
    codec: EnvelopeCodec,
    binding: RwLock<Binding>,
}

impl Transport {
    /// Bind a new transport to `bearer`. Expired credentials are refused.
    pub fn new(
        bearer: &str,
        key: SymmetricKey,
        backend: Arc<dyn HttpBackend>,
    ) -> Result<Self, AuthError> {
        Self::with_credential(Credential::parse(bearer)?, key, backend)
    }

    pub fn with_credential(
        bearer: Credential,
        key: SymmetricKey,
        backend: Arc<dyn HttpBackend>,
    ) -> Result<Self, AuthError> {
        if bearer.is_expired() {
            return Err(AuthError::ExpiredCredential);
        }
        Ok(Self {
            backend,
            codec: EnvelopeCodec::new(key),
            binding: RwLock::new(Binding {
                identity: bearer.identity().clone(),
                bearer,
                network: NetworkOptions::default(),
            }),
        })
    }

    pub fn bearer(&self) -> Credential {
        self.binding.read().bearer.clone()
    }

    pub fn identity(&self) -> Identity {
        self.binding.read().identity.clone()
    }

    pub fn network(&self) -> NetworkOptions {
        self.binding.read().network.clone()
    }

    /// Swap in a new bearer. With `preserve_identity` the new credential must
    /// belong to the identity already bound; otherwise its identity is adopted.
    pub fn update_token(&self, raw: &str, preserve_identity: bool) -> Result<(), AuthError> {
        if self.binding.read().bearer.raw() == raw {
            return Ok(());
        }
        self.update_credential(Credential::parse(raw)?, preserve_identity)
    }

    pub fn update_credential(
        &self,
        credential: Credential,
        preserve_identity: bool,
    ) -> Result<(), AuthError> {
        let mut binding = self.binding.write();
        if binding.bearer.raw() == credential.raw() {
            return Ok(());
        }
        if credential.is_expired() {
            return Err(AuthError::ExpiredCredential);
        }
        if preserve_identity {
            binding.identity.ensure_matches(credential.identity())?;
        } else {
            binding.identity = credential.identity().clone();
        }
        debug!(identity = %binding.identity, expiry = credential.expiry(), "Bearer updated");
        binding.bearer = credential;
        Ok(())
    }

    /// Route requests through an HTTPS proxy. Certificate verification is
    /// switched off along with it.
    pub fn set_proxy(&self, url: &str) -> Result<(), BackendError> {
        self.apply_network(NetworkOptions::proxied(url))
    }

    /// Drop the proxy and switch certificate verification back on.
    pub fn clear_proxy(&self) -> Result<(), BackendError> {
        self.apply_network(NetworkOptions::default())
    }

    fn apply_network(&self, options: NetworkOptions) -> Result<(), BackendError> {
        self.backend.configure(&options)?;
        if options.proxy.is_some() {
            warn!("Proxy enabled; TLS certificate verification is off");
        }
        self.binding.write().network = options;
        Ok(())
    }

    pub async fn get(&self, url: &str, query: &Payload) -> ApiResult {
        let (bearer, identity) = self.snapshot();
        self.send(Method::GET, url, query, None, &bearer, &identity).await
    }

    pub async fn post(&self, url: &str, query: &Payload, body: &Payload) -> ApiResult {
        let (bearer, identity) = self.snapshot();
        self.send(Method::POST, url, query, Some(body), &bearer, &identity).await
    }

    /// POST authorized by `credential` instead of the bound bearer. The
    /// binding is neither read nor changed, so concurrent `get`/`post` calls
    /// keep using the bound credential.
    pub async fn post_as(
        &self,
        credential: &Credential,
        url: &str,
        query: &Payload,
        body: &Payload,
    ) -> ApiResult {
        self.send(
            Method::POST,
            url,
            query,
            Some(body),
            credential,
            credential.identity(),
        )
        .await
    }

    fn snapshot(&self) -> (Credential, Identity) {
        let binding = self.binding.read();
        (binding.bearer.clone(), binding.identity.clone())
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &Payload,
        body: Option<&Payload>,
        bearer: &Credential,
        identity: &Identity,
    ) -> ApiResult {
        if bearer.is_expired() {
            debug!(%url, "Bound credential expired, request not sent");
            return Err(ApiError::AuthExpired);
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(PAYLOAD_HEADER),
            header_value(self.codec.encode(query, identity)?.serialize())?,
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT_TEXT));
        headers.insert(
            header::AUTHORIZATION,
            header_value(format!("Bearer {}", bearer.raw()))?,
        );

        let body = match body {
            Some(fields) => {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(CONTENT_TYPE_JSON),
                );
                Some(self.codec.encode(fields, identity)?.serialize())
            }
            None => None,
        };

        let request = HttpRequest {
            method,
            url: url.to_string(),
            headers,
            body,
        };
        let response = self
            .backend
            .execute(request)
            .await
            .map_err(|e| ApiError::HttpFailed {
                status: None,
                body: e.to_string(),
            })?;

        self.classify(response)
    }

    fn classify(&self, response: HttpResponse) -> ApiResult {
        if !response.status.is_success() {
            warn!(status = %response.status, "HTTP request failed");
            return Err(ApiError::HttpFailed {
                status: Some(response.status.as_u16()),
                body: response.body,
            });
        }

        let body = self.codec.open(&response.body)?;
        if body.code == Some(SERVICE_AUTH_EXPIRED_CODE) {
            debug!(message = ?body.message, "Service reported expired access token");
            return Err(ApiError::ServiceAuthExpired);
        }
        Ok(body.into_data()?)
    }
}

fn header_value(value: String) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&value).map_err(|e| ApiError::Encoding(e.to_string()))
}
