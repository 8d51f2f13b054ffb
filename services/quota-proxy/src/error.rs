//! Service-specific error types

use thiserror::Error;

/// Startup errors for the proxy service.
///
/// Per-request failures (quota exhaustion, upstream timeouts) are turned into
/// HTTP responses by the proxy handler and never propagate as Rust errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("credential {0} has no resolved token")]
    MissingToken(String),

    #[error("failed to build upstream HTTP client: {0}")]
    HttpClient(String),

    #[error("scheduler setup failed: {0}")]
    Scheduler(#[from] access_pool::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
