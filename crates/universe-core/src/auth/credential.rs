//! Bearer credential parsing.
//!
//! Credentials are three-segment tokens whose first segment is a fixed header
//! marker and whose second segment is base64url JSON carrying the claims the
//! client needs: expiry, account number, game account id and token type.
//! The signature segment is never verified client-side.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use serde_json::{Map, Value};

use super::AuthError;

/// First segment every credential issued by the platform starts with.
pub const HEADER_MARKER: &str = "eyJ0eXAiOiJKV1QiLCJhbGciOiJSUzI1NiJ9";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Access,
    Refresh,
    Unknown,
}

impl TokenType {
    fn from_claim(value: &str) -> Self {
        match value {
            "access" => TokenType::Access,
            "refresh" => TokenType::Refresh,
            _ => TokenType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::Unknown => "unknown",
        }
    }
}

/// The (account number, game account id) pair a credential is issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub account_id: i64,
    pub game_account_id: String,
}

impl Identity {
    /// Compare against another identity, naming the first field that differs.
    pub fn ensure_matches(&self, other: &Identity) -> Result<(), AuthError> {
        if self.account_id != other.account_id {
            return Err(AuthError::IdentityMismatch {
                field: "account_no",
                expected: self.account_id.to_string(),
                actual: other.account_id.to_string(),
            });
        }
        if self.game_account_id != other.game_account_id {
            return Err(AuthError::IdentityMismatch {
                field: "np_game_account_id",
                expected: self.game_account_id.clone(),
                actual: other.game_account_id.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.game_account_id)
    }
}

/// A parsed bearer credential. Immutable once parsed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    raw: String,
    expiry: i64,
    identity: Identity,
    token_type: TokenType,
}

impl Credential {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthError::malformed(format!(
                "expected 3 segments, got {}",
                parts.len()
            )));
        }
        if parts[0] != HEADER_MARKER {
            return Err(AuthError::malformed("invalid header"));
        }

        let claims = decode_claims(parts[1])?;

        let expiry = claims
            .get("exp")
            .and_then(integral)
            .ok_or_else(|| AuthError::malformed("missing or invalid claim: exp"))?;
        let account_id = claims
            .get("account_no")
            .and_then(coerce_account_no)
            .ok_or_else(|| AuthError::malformed("missing or invalid claim: account_no"))?;
        let game_account_id = claims
            .get("np_game_account_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::malformed("missing or invalid claim: np_game_account_id"))?
            .to_owned();
        let token_type = claims
            .get("type")
            .and_then(Value::as_str)
            .map(TokenType::from_claim)
            .ok_or_else(|| AuthError::malformed("missing or invalid claim: type"))?;

        Ok(Self {
            raw: raw.to_owned(),
            expiry,
            identity: Identity {
                account_id,
                game_account_id,
            },
            token_type,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Expiry as epoch seconds
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    pub fn account_id(&self) -> i64 {
        self.identity.account_id
    }

    pub fn game_account_id(&self) -> &str {
        &self.identity.game_account_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    /// A credential expiring exactly at `now` is already expired.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }

    /// Seconds left before expiry, zero once expired.
    pub fn seconds_until_expiry(&self) -> i64 {
        (self.expiry - Utc::now().timestamp()).max(0)
    }
}

impl FromStr for Credential {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// Bearer strings must not end up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("raw", &redact(&self.raw))
            .field("expiry", &self.expiry)
            .field("identity", &self.identity)
            .field("token_type", &self.token_type)
            .finish()
    }
}

fn redact(raw: &str) -> String {
    let tail_start = raw.len().saturating_sub(6);
    match raw.get(tail_start..) {
        Some(tail) => format!("…{}", tail),
        None => "…".to_string(),
    }
}

fn decode_claims(segment: &str) -> Result<Map<String, Value>, AuthError> {
    let mut padded = segment.to_owned();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = URL_SAFE
        .decode(padded.as_bytes())
        .map_err(|e| AuthError::malformed(format!("payload is not base64url: {}", e)))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AuthError::malformed("payload is not a JSON object")),
        Err(e) => Err(AuthError::malformed(format!("payload is not JSON: {}", e))),
    }
}

fn integral(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

fn coerce_account_no(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        other => integral(other),
    }
}
