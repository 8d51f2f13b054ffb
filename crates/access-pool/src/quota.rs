//! Quota detection for upstream API responses
//!
//! Reads the server's own view of the quota from response headers and turns a
//! response into a typed `ThrottleSignal`. Primary limits are the hourly/daily
//! quota reported through `*-remaining`/`*-reset`; secondary limits are burst
//! protections announced with an explicit `Retry-After`.
//!
//! A plain 403 is a permission error, not a limit: it only counts as throttling
//! when it comes with an exhausted remaining quota or a `Retry-After`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use transport::ApiResponse;
use transport::reqwest::header::HeaderMap;

const LIMIT_HEADERS: &[&str] = &["x-ratelimit-limit", "x-rate-limit-limit", "ratelimit-limit"];
const REMAINING_HEADERS: &[&str] = &[
    "x-ratelimit-remaining",
    "x-rate-limit-remaining",
    "ratelimit-remaining",
];
const RESET_HEADERS: &[&str] = &["x-ratelimit-reset", "x-rate-limit-reset", "ratelimit-reset"];
const RESOURCE_HEADER: &str = "x-ratelimit-resource";
const RETRY_AFTER_HEADER: &str = "retry-after";

/// Reset values from this one up are Unix epoch seconds, below it a delta in seconds.
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// Ceiling for any wait read from `*-reset` or `Retry-After`.
pub const MAX_WAIT_HINT: Duration = Duration::from_secs(86_400);

/// Quota state reported by the server on one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaHeaders {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    /// Time from observation until the quota window resets.
    pub reset_after: Option<Duration>,
    pub retry_after: Option<Duration>,
    /// Resource class the quota applies to (e.g. `core`, `search`).
    pub resource: Option<String>,
}

impl QuotaHeaders {
    /// Parse quota headers against the current wall clock.
    pub fn parse(headers: &HeaderMap) -> Self {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self::parse_at(headers, now_unix)
    }

    /// Parse quota headers, resolving epoch resets relative to `now_unix`.
    pub fn parse_at(headers: &HeaderMap, now_unix: u64) -> Self {
        let reset_after = first_u64(headers, RESET_HEADERS).map(|reset| {
            if reset >= EPOCH_THRESHOLD {
                wait_hint(reset.saturating_sub(now_unix))
            } else {
                wait_hint(reset)
            }
        });

        Self {
            limit: first_u64(headers, LIMIT_HEADERS),
            remaining: first_u64(headers, REMAINING_HEADERS),
            reset_after,
            retry_after: header_u64(headers, RETRY_AFTER_HEADER).map(wait_hint),
            resource: headers
                .get(RESOURCE_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }

    /// Remaining quota as a fraction of the limit, when both are known.
    pub fn remaining_ratio(&self) -> Option<f64> {
        match (self.remaining, self.limit) {
            (Some(remaining), Some(limit)) if limit > 0 => {
                Some((remaining as f64 / limit as f64).min(1.0))
            }
            _ => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// Throttling evidence extracted from one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleSignal {
    /// Not throttled.
    None,
    /// Primary quota exhausted; usable again after `reset_after` when reported.
    Primary { reset_after: Option<Duration> },
    /// Burst/secondary limit with an explicit server-mandated wait.
    Secondary { retry_after: Duration },
}

impl ThrottleSignal {
    /// Detect a throttling signal from status and parsed quota headers.
    pub fn detect(status: u16, quota: &QuotaHeaders) -> Self {
        let limited = match status {
            429 => true,
            403 => quota.is_exhausted() || quota.retry_after.is_some(),
            _ => false,
        };
        if !limited {
            return ThrottleSignal::None;
        }
        match quota.retry_after {
            Some(retry_after) => ThrottleSignal::Secondary { retry_after },
            None => ThrottleSignal::Primary {
                reset_after: quota.reset_after,
            },
        }
    }

    /// Parse and detect in one step.
    pub fn from_response<R: ApiResponse + ?Sized>(response: &R) -> (Self, QuotaHeaders) {
        let quota = QuotaHeaders::parse(response.headers());
        (Self::detect(response.status(), &quota), quota)
    }

    pub fn is_limited(&self) -> bool {
        !matches!(self, ThrottleSignal::None)
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ThrottleSignal::None => "none",
            ThrottleSignal::Primary { .. } => "primary",
            ThrottleSignal::Secondary { .. } => "secondary",
        }
    }
}

/// Coarse outcome of one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Ok,
    PrimaryLimit,
    SecondaryLimit,
    /// Error status without throttling evidence (permission, not found, 5xx).
    NonLimitError,
}

impl ResponseClass {
    pub fn is_limit(self) -> bool {
        matches!(self, ResponseClass::PrimaryLimit | ResponseClass::SecondaryLimit)
    }
}

/// Classify a response by status and the signal detected for it.
pub fn classify(status: u16, signal: ThrottleSignal) -> ResponseClass {
    match signal {
        ThrottleSignal::Primary { .. } => ResponseClass::PrimaryLimit,
        ThrottleSignal::Secondary { .. } => ResponseClass::SecondaryLimit,
        ThrottleSignal::None if status >= 400 => ResponseClass::NonLimitError,
        ThrottleSignal::None => ResponseClass::Ok,
    }
}

fn wait_hint(secs: u64) -> Duration {
    Duration::from_secs(secs).min(MAX_WAIT_HINT)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn first_u64(headers: &HeaderMap, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|name| header_u64(headers, name))
}
