use thiserror::Error;

use super::envelope::EnvelopeError;

/// Result code for a successful call.
pub const SUCCESS_CODE: i64 = 0;
/// Result code the service puts in a decrypted body once it stops accepting
/// the access token.
pub const SERVICE_AUTH_EXPIRED_CODE: i64 = 9999;

pub const AUTH_EXPIRED_CODE: i64 = 1099;
pub const HTTP_FAILED_CODE: i64 = 1098;
pub const DECRYPTION_FAILED_CODE: i64 = 1001;
pub const MALFORMED_RESPONSE_CODE: i64 = 1002;
pub const ENCODING_FAILED_CODE: i64 = 1003;

/// Outcome of a transport call that did not yield data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Token has been expired")]
    AuthExpired,

    #[error("Access token rejected by the service")]
    ServiceAuthExpired,

    #[error("HTTP request failed ({}): {}", status_label(.status), ApiError::truncate_body(.body))]
    HttpFailed { status: Option<u16>, body: String },

    #[error("Decryption failed")]
    DecryptionFailed { envelope: String },

    #[error("Abnormal API response")]
    MalformedResponse { plaintext: String },

    #[error("Failed to build request: {0}")]
    Encoding(String),
}

/// Maximum length for response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

fn status_label(status: &Option<u16>) -> String {
    status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "no response".to_string())
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Numeric result code, stable across releases.
    pub fn code(&self) -> i64 {
        match self {
            ApiError::AuthExpired => AUTH_EXPIRED_CODE,
            ApiError::ServiceAuthExpired => SERVICE_AUTH_EXPIRED_CODE,
            ApiError::HttpFailed { .. } => HTTP_FAILED_CODE,
            ApiError::DecryptionFailed { .. } => DECRYPTION_FAILED_CODE,
            ApiError::MalformedResponse { .. } => MALFORMED_RESPONSE_CODE,
            ApiError::Encoding(_) => ENCODING_FAILED_CODE,
        }
    }

    /// Raw material that explains the failure: the response body, the
    /// undecryptable envelope, or the decrypted plaintext.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            ApiError::HttpFailed { body, .. } => Some(body),
            ApiError::DecryptionFailed { envelope } => Some(envelope),
            ApiError::MalformedResponse { plaintext } => Some(plaintext),
            ApiError::AuthExpired | ApiError::ServiceAuthExpired | ApiError::Encoding(_) => None,
        }
    }

    /// Expiry signalled by the service itself. This is the only outcome a
    /// session tries to recover from.
    pub fn is_auth_expiry(&self) -> bool {
        matches!(self, ApiError::ServiceAuthExpired)
    }
}

impl From<EnvelopeError> for ApiError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::DecryptionFailed { envelope } => ApiError::DecryptionFailed { envelope },
            EnvelopeError::MalformedResponse { plaintext } => {
                ApiError::MalformedResponse { plaintext }
            }
            other @ (EnvelopeError::InvalidKey(_) | EnvelopeError::Encode(_)) => {
                ApiError::Encoding(other.to_string())
            }
        }
    }
}
