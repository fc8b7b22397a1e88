//! REST API access for the coaching backend.
//!
//! This module provides the `ApiClient` request gateway, the `Transport`
//! seam it sends through, and the error normalizer that turns every raw
//! transport failure into a `NormalizedError`.
//!
//! The API uses bearer token authentication obtained through the OTP
//! verification endpoint.

pub mod client;
pub mod error;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ApiClient, RequestConfig};
pub use error::{normalize, ErrorKind, NormalizedError, TransportError};
pub use transport::{HttpRequest, HttpResponse, RequestBody, ReqwestTransport, Transport};
