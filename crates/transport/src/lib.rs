//! Transport boundary for the access scheduler
//!
//! The scheduler never talks HTTP itself. It only needs to read the status code
//! and headers of whatever a unit of work produced, which is what `ApiResponse`
//! exposes. `BearerTransport` is the reqwest-backed handle the proxy service
//! pairs with each credential; any other client type can be scheduled as long
//! as its responses implement `ApiResponse`.

pub mod bearer;

pub use bearer::{BearerTransport, HeaderInjection};
pub use reqwest;

use bytes::Bytes;
use reqwest::header::HeaderMap;

/// Read-only view of a completed upstream response.
pub trait ApiResponse {
    /// HTTP status code.
    fn status(&self) -> u16;

    /// Response headers. Names are case-insensitive.
    fn headers(&self) -> &HeaderMap;
}

impl ApiResponse for reqwest::Response {
    fn status(&self) -> u16 {
        reqwest::Response::status(self).as_u16()
    }

    fn headers(&self) -> &HeaderMap {
        reqwest::Response::headers(self)
    }
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Buffer a reqwest response, keeping status and headers.
    pub async fn read(response: reqwest::Response) -> Result<Self> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

impl ApiResponse for UpstreamResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Errors from sending a request through a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream timeout: {0}")]
    Timeout(String),

    #[error("upstream connection failed: {0}")]
    Connect(String),

    #[error("upstream response read error: {0}")]
    Body(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("upstream request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connection",
            TransportError::Body(_) => "body",
            TransportError::InvalidHeader(_) => "invalid_header",
            TransportError::Request(_) => "request",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
