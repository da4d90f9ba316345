//! Authenticated transport for the universe platform.
//!
//! The platform issues short-lived access tokens and longer-lived refresh
//! tokens, and expects every request payload wrapped in a signed and
//! encrypted envelope. This crate provides:
//! - `auth`: credential parsing and the refresh-and-retry `Session`
//! - `api`: the envelope codec and the `Transport` that sends requests
//! - `config`: endpoints, envelope key, proxy and timeout settings
//!
//! Callers normally build a `Session` and use `Session::get` and
//! `Session::post`; expiry handling happens underneath.

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
mod test_support;

pub use api::{ApiError, ApiResult, Payload, SymmetricKey, Transport};
pub use auth::{AuthError, Credential, Identity, RefreshError, Session, SessionSettings, TokenType};
pub use config::Config;
