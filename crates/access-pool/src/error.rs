//! Error types for scheduler operations

use std::time::Duration;

use crate::quota::ThrottleSignal;

/// Errors from building or acquiring from the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No credential will admit within the caller's patience window.
    #[error("quota exhausted: no credential admits {units} unit(s) within {max_wait:?}{}", describe_earliest(.earliest))]
    QuotaExhausted {
        units: u32,
        max_wait: Duration,
        /// Time until the earliest credential admits, when known. `None` when the
        /// request exceeds every capacity or every credential is leased out.
        earliest: Option<Duration>,
    },

    #[error("no credentials configured")]
    NoCredentials,

    #[error("duplicate credential id: {0}")]
    DuplicateCredential(String),

    #[error("invalid quota for credential {id}: {reason}")]
    InvalidQuota { id: String, reason: String },

    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
}

fn describe_earliest(earliest: &Option<Duration>) -> String {
    match earliest {
        Some(wait) => format!(" (earliest in {wait:?})"),
        None => " (no admission time known)".to_string(),
    }
}

/// Result alias for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from `AccessCoordinator::run`.
///
/// `E` is the unit of work's own error type, passed through untouched.
#[derive(Debug, thiserror::Error)]
pub enum RunError<E> {
    #[error(transparent)]
    Scheduler(#[from] Error),

    /// The server kept throttling after `attempts` reactive retries.
    #[error("rate limit backoff exceeded after {attempts} retries (credential {credential_id}, status {status})")]
    LimitBackoffExceeded {
        attempts: u32,
        credential_id: String,
        status: u16,
        signal: ThrottleSignal,
    },

    #[error("transport error: {0}")]
    Transport(#[source] E),
}

impl<E> RunError<E> {
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, RunError::Scheduler(Error::QuotaExhausted { .. }))
    }

    /// The unit of work's error, if that is what ended the run.
    pub fn into_transport(self) -> Option<E> {
        match self {
            RunError::Transport(e) => Some(e),
            _ => None,
        }
    }
}
