//! Session over an access/refresh credential pair.
//!
//! A `Session` owns the transport and keeps it bound to a live access
//! credential. When the service reports that the access credential is no
//! longer accepted, the session exchanges its refresh credential for a new
//! access credential and replays the call once.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AuthError, Credential, Identity, RefreshError, TokenType};
use crate::api::{ApiResult, HttpBackend, Payload, ReqwestBackend, SymmetricKey, Transport};
use crate::config::Config;

/// Endpoint that trades a refresh credential for a new access credential.
pub const DEFAULT_REFRESH_URL: &str = "https://auth.universe-official.io/refresh/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Bound to an access credential and serving calls
    ActiveAccess,
    /// A refresh is in flight; callers that need it wait for its result
    RecoveringViaRefresh,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub key: SymmetricKey,
    pub refresh_url: String,
    pub proxy: Option<String>,
}

impl SessionSettings {
    pub fn new(key: SymmetricKey) -> Self {
        Self {
            key,
            refresh_url: DEFAULT_REFRESH_URL.to_string(),
            proxy: None,
        }
    }

    pub fn with_refresh_url(mut self, url: impl Into<String>) -> Self {
        self.refresh_url = url.into();
        self
    }

    pub fn with_proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy = Some(url.into());
        self
    }
}

pub struct Session {
    transport: Transport,
    access: RwLock<Credential>,
    refresh: RwLock<Option<Credential>>,
    refresh_url: String,
    /// Held for the duration of a refresh; at most one is in flight.
    refresh_gate: Mutex<()>,
}

impl Session {
    /// Build a session from raw credential strings. Either may be empty or
    /// unparseable as long as the other leads to a usable access credential.
    pub async fn new(
        access: &str,
        refresh: &str,
        settings: SessionSettings,
        backend: Arc<dyn HttpBackend>,
    ) -> Result<Self, AuthError> {
        let access = parse_supplied("access", access);
        let refresh = parse_supplied("refresh", refresh);

        if access.is_none() && refresh.is_none() {
            return Err(AuthError::InitializationFailed(
                "both access and refresh tokens are invalid".to_string(),
            ));
        }

        match access.filter(|a| !a.is_expired()) {
            Some(access) => Self::from_access(access, refresh, settings, backend),
            None => Self::from_refresh(refresh, settings, backend).await,
        }
    }

    /// Build a session that talks to the real platform using `config`.
    pub async fn connect(config: &Config, access: &str, refresh: &str) -> anyhow::Result<Self> {
        let backend = ReqwestBackend::new(config.timeout())
            .context("Failed to create HTTP client")?;
        let settings = config.session_settings()?;
        let session = Self::new(access, refresh, settings, Arc::new(backend)).await?;
        Ok(session)
    }

    fn from_access(
        access: Credential,
        refresh: Option<Credential>,
        settings: SessionSettings,
        backend: Arc<dyn HttpBackend>,
    ) -> Result<Self, AuthError> {
        let refresh = refresh.filter(|r| match check_refresh_pair(&access, r) {
            Ok(()) => true,
            Err(reason) => {
                warn!(%reason, "Refresh token will be ignored");
                false
            }
        });

        let transport = Transport::with_credential(access.clone(), settings.key, backend)
            .map_err(|e| AuthError::InitializationFailed(e.to_string()))?;
        apply_proxy(&transport, settings.proxy.as_deref())?;

        Ok(Self::assemble(transport, access, refresh, settings.refresh_url))
    }

    async fn from_refresh(
        refresh: Option<Credential>,
        settings: SessionSettings,
        backend: Arc<dyn HttpBackend>,
    ) -> Result<Self, AuthError> {
        warn!("Access token is missing or expired");
        let refresh = match refresh {
            Some(r) if !r.is_expired() => r,
            _ => {
                warn!("Refresh token is also invalid");
                return Err(AuthError::InitializationFailed(
                    "no usable access or refresh token".to_string(),
                ));
            }
        };

        let transport = Transport::with_credential(refresh.clone(), settings.key, backend)
            .map_err(|e| AuthError::InitializationFailed(e.to_string()))?;
        apply_proxy(&transport, settings.proxy.as_deref())?;

        let access = exchange(&transport, Some(&refresh), &settings.refresh_url)
            .await
            .map_err(|e| {
                let reason = format!("failed to issue a new access token: {}", e);
                AuthError::InitializationFailed(reason)
            })?;
        info!(identity = %access.identity(), expiry = access.expiry(), "Issued new access token");

        Ok(Self::assemble(transport, access, Some(refresh), settings.refresh_url))
    }

    fn assemble(
        transport: Transport,
        access: Credential,
        refresh: Option<Credential>,
        refresh_url: String,
    ) -> Self {
        Self {
            transport,
            access: RwLock::new(access),
            refresh: RwLock::new(refresh),
            refresh_url,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn access(&self) -> Credential {
        self.access.read().clone()
    }

    pub fn refresh_credential(&self) -> Option<Credential> {
        self.refresh.read().clone()
    }

    pub fn identity(&self) -> Identity {
        self.access.read().identity().clone()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        match self.refresh_gate.try_lock() {
            Ok(_) => SessionState::ActiveAccess,
            Err(_) => SessionState::RecoveringViaRefresh,
        }
    }

    /// Replace the refresh credential. Unlike construction, a credential for
    /// another identity is an error here rather than silently dropped.
    pub fn replace_refresh(&self, raw: &str) -> Result<(), AuthError> {
        let credential = Credential::parse(raw)?;
        if credential.token_type() != TokenType::Refresh {
            return Err(AuthError::malformed("not a refresh token"));
        }
        if credential.is_expired() {
            return Err(AuthError::ExpiredCredential);
        }
        self.identity().ensure_matches(credential.identity())?;
        *self.refresh.write() = Some(credential);
        Ok(())
    }

    /// Trade the refresh credential for a new access credential.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let _gate = self.refresh_gate.lock().await;
        self.run_refresh().await
    }

    /// `refresh` reduced to success or failure, with the reason logged.
    pub async fn refresh_flow(&self) -> bool {
        match self.refresh().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Refresh failed");
                false
            }
        }
    }

    pub async fn get(&self, url: &str, query: &Payload) -> ApiResult {
        self.with_recovery(|| self.transport.get(url, query)).await
    }

    pub async fn post(&self, url: &str, query: &Payload, body: &Payload) -> ApiResult {
        self.with_recovery(|| self.transport.post(url, query, body)).await
    }

    /// Run `call`; if the service rejects the access token, refresh and run
    /// it exactly once more.
    async fn with_recovery<F, Fut>(&self, call: F) -> ApiResult
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ApiResult<Value>>,
    {
        let bearer = self.access.read().raw().to_string();
        match call().await {
            Err(err) if err.is_auth_expiry() => {
                if !self.recover(&bearer).await {
                    return Err(err);
                }
                debug!("Retrying with refreshed access token");
                call().await
            }
            result => result,
        }
    }

    /// Refresh on behalf of a caller whose request was sent with
    /// `stale_bearer`. A caller that queued behind another caller's refresh
    /// reuses its result.
    async fn recover(&self, stale_bearer: &str) -> bool {
        let _gate = self.refresh_gate.lock().await;

        let already_refreshed = self.access.read().raw() != stale_bearer;
        if already_refreshed {
            debug!("Access token was refreshed by another caller");
            return true;
        }

        match self.run_refresh().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Refresh failed");
                false
            }
        }
    }

    /// Callers must hold `refresh_gate`.
    async fn run_refresh(&self) -> Result<(), RefreshError> {
        let refresh = self.refresh.read().clone();
        let access = exchange(&self.transport, refresh.as_ref(), &self.refresh_url).await?;
        info!(
            identity = %access.identity(),
            expiry = access.expiry(),
            "Refreshed access token"
        );
        *self.access.write() = access;
        Ok(())
    }
}

/// Call the refresh endpoint authorized by `refresh` and bind the issued
/// access credential. The transport stays bound to the current access
/// credential until the new one is accepted, so requests running alongside
/// the exchange never carry the refresh credential.
async fn exchange(
    transport: &Transport,
    refresh: Option<&Credential>,
    refresh_url: &str,
) -> Result<Credential, RefreshError> {
    let refresh = refresh.ok_or(RefreshError::Missing)?;
    if refresh.token_type() != TokenType::Refresh {
        return Err(RefreshError::NotRefreshToken);
    }
    if refresh.is_expired() {
        return Err(RefreshError::Expired);
    }

    let data = transport
        .post_as(refresh, refresh_url, &Payload::new(), &Payload::new())
        .await
        .map_err(RefreshError::Request)?;

    let raw = data
        .pointer("/auth/access_token")
        .and_then(Value::as_str)
        .ok_or(RefreshError::MissingAccessToken)?;
    let access = Credential::parse(raw).map_err(RefreshError::Rejected)?;
    transport
        .update_credential(access.clone(), true)
        .map_err(RefreshError::Rejected)?;

    Ok(access)
}

fn parse_supplied(kind: &'static str, raw: &str) -> Option<Credential> {
    if raw.is_empty() {
        return None;
    }
    match Credential::parse(raw) {
        Ok(credential) => Some(credential),
        Err(e) => {
            warn!(kind, error = %e, "Ignoring unparseable token");
            None
        }
    }
}

fn check_refresh_pair(access: &Credential, refresh: &Credential) -> Result<(), String> {
    if refresh.token_type() != TokenType::Refresh {
        return Err("given token is not a refresh token".to_string());
    }
    access
        .identity()
        .ensure_matches(refresh.identity())
        .map_err(|e| e.to_string())
}

fn apply_proxy(transport: &Transport, proxy: Option<&str>) -> Result<(), AuthError> {
    match proxy {
        Some(url) => transport
            .set_proxy(url)
            .map_err(|e| AuthError::InitializationFailed(e.to_string())),
        None => Ok(()),
    }
}
