//! Encrypted request/response transport for the universe platform.
//!
//! This module provides:
//! - `EnvelopeCodec`: the signed-then-encrypted wrapper around every payload
//! - `Transport`: GET/POST bound to one bearer credential
//! - `HttpBackend`: the seam the network call sits behind
//!
//! Every outcome other than decoded `data` is an `ApiError` with a stable
//! numeric code.

pub mod backend;
pub mod envelope;
pub mod error;
pub mod transport;

pub use backend::{
    BackendError, HttpBackend, HttpRequest, HttpResponse, NetworkOptions, ReqwestBackend,
};
pub use envelope::{EncryptedEnvelope, EnvelopeCodec, EnvelopeError, ResponseBody, SymmetricKey};
pub use error::ApiError;
pub use transport::{ApiResult, Payload, Transport, PAYLOAD_HEADER};
