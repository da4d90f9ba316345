use thiserror::Error;

use crate::api::ApiError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    #[error("Credential has expired")]
    ExpiredCredential,

    #[error("{field} doesn't match (bound {expected}, got {actual})")]
    IdentityMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Session initialization failed: {0}")]
    InitializationFailed(String),
}

impl AuthError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        AuthError::MalformedCredential(reason.into())
    }
}

/// Why a refresh attempt did not produce a new access credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token held")]
    Missing,

    #[error("Given token is not a refresh token")]
    NotRefreshToken,

    #[error("Refresh token has been expired")]
    Expired,

    #[error("Refresh request failed: {0}")]
    Request(ApiError),

    #[error("Refresh response carried no access token")]
    MissingAccessToken,

    #[error("Issued access token rejected: {0}")]
    Rejected(AuthError),
}
