//! Authentication module for bearer credentials and sessions.
//!
//! This module provides:
//! - `Credential`: parsed access/refresh bearer tokens
//! - `Session`: refresh-and-retry on top of a `Transport`
//!
//! Credentials are held in memory only.

pub mod credential;
pub mod error;
pub mod session;

pub use credential::{Credential, Identity, TokenType, HEADER_MARKER};
pub use error::{AuthError, RefreshError};
pub use session::{Session, SessionSettings, SessionState};
