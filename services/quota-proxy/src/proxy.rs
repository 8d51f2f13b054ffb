//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, and forwards them
//! through the access coordinator: each request runs against whichever
//! credential the scheduler leases, and throttled attempts are retried on
//! another (or the same, once refilled) credential. Upstream responses are
//! relayed verbatim, including error statuses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use access_pool::{AccessCoordinator, RunError};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{error, info, instrument, warn};
use transport::{BearerTransport, TransportError, UpstreamResponse};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers the HTTP client regenerates for the upstream connection.
const REGENERATED_HEADERS: &[&str] = &["host", "content-length"];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub coordinator: Arc<AccessCoordinator<BearerTransport>>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being processed, reported when the drain times out.
    pub in_flight: Arc<AtomicU64>,
}

/// Decrements `in_flight` when the request finishes or is cancelled.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Retry-After value for a 503: whole seconds, rounded up, at least 1.
fn retry_after_secs(wait: Duration) -> u64 {
    wait.as_secs_f64().ceil().max(1.0) as u64
}

/// Proxy an inbound request to upstream through the access coordinator.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = InFlight::enter(&state.in_flight);
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && !is_regenerated(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body: Bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            let response = error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
            );
            metrics::record_request(400, method.as_str(), started.elapsed().as_secs_f64());
            return response;
        }
    };

    let result = state
        .coordinator
        .run(|transport: BearerTransport| {
            let method = method.clone();
            let headers = headers.clone();
            let body = body.clone();
            let path_and_query = path_and_query.clone();
            async move { transport.send(method, &path_and_query, headers, body).await }
        })
        .await;

    let response = match result {
        Ok(upstream) => relay(upstream, &request_id),
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            failure_response(e, &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Copy an upstream response back to the client, minus hop-by-hop headers.
fn relay(upstream: UpstreamResponse, request_id: &str) -> Response {
    let status = match StatusCode::from_u16(upstream.status) {
        Ok(s) => s,
        Err(e) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                &format!("upstream returned invalid status: {e}"),
                request_id,
            );
        }
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

/// Map a failed run to the client-facing response.
///
/// - quota exhausted: 503 with `Retry-After` when an admission time is known
/// - throttling persisted past the retry budget: 429
/// - upstream timeout: 504, any other transport failure: 502
fn failure_response(err: RunError<TransportError>, request_id: &str) -> Response {
    match err {
        RunError::Scheduler(access_pool::Error::QuotaExhausted { earliest, .. }) => {
            metrics::record_rejection("quota_exhausted");
            warn!(earliest_secs = earliest.map(|d| d.as_secs_f64()), "quota exhausted");
            let mut response = error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "quota_exhausted",
                &quota_message(earliest),
                request_id,
            );
            if let Some(wait) = earliest {
                response.headers_mut().insert(
                    axum::http::header::RETRY_AFTER,
                    HeaderValue::from(retry_after_secs(wait)),
                );
            }
            response
        }
        RunError::Scheduler(e) => {
            error!(error = %e, "scheduler error");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "proxy_error",
                &e.to_string(),
                request_id,
            )
        }
        RunError::LimitBackoffExceeded {
            attempts,
            credential_id,
            status,
            signal,
        } => {
            metrics::record_rejection("rate_limited");
            info!(
                attempts,
                credential_id = %credential_id,
                upstream_status = status,
                signal = signal.label(),
                "upstream kept throttling, giving up"
            );
            error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                &format!("upstream rate limit persisted after {attempts} retries"),
                request_id,
            )
        }
        RunError::Transport(e) => {
            metrics::record_upstream_error(e.kind());
            error!(error = %e, "upstream request failed");
            let status = match e {
                TransportError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(
                status,
                "proxy_error",
                &format!("upstream error: {e}"),
                request_id,
            )
        }
    }
}

/// Client-facing text for a quota rejection.
fn quota_message(earliest: Option<Duration>) -> String {
    match earliest {
        Some(wait) => format!(
            "all credentials are rate limited; retry in {}s",
            retry_after_secs(wait)
        ),
        None => "all credentials are rate limited or busy".to_string(),
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_regenerated(name: &str) -> bool {
    REGENERATED_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use access_pool::ThrottleSignal;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("X-RateLimit-Remaining"));
    }

    #[test]
    fn host_and_content_length_are_regenerated() {
        assert!(is_regenerated("Host"));
        assert!(is_regenerated("content-length"));
        assert!(!is_regenerated("content-type"));
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(60)), 60);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn quota_exhausted_maps_to_503_with_retry_after() {
        let err = RunError::Scheduler(access_pool::Error::QuotaExhausted {
            units: 1,
            max_wait: Duration::from_secs(10),
            earliest: Some(Duration::from_millis(42_300)),
        });
        let response = failure_response(err, "req_abc");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "43");

        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "quota_exhausted");
        assert_eq!(json["error"]["request_id"], "req_abc");
    }

    #[tokio::test]
    async fn quota_exhausted_without_estimate_has_no_retry_after() {
        let err = RunError::Scheduler(access_pool::Error::QuotaExhausted {
            units: 1,
            max_wait: Duration::from_secs(10),
            earliest: None,
        });
        let response = failure_response(err, "req_abc");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get("retry-after").is_none());
    }

    #[tokio::test]
    async fn backoff_exceeded_maps_to_429() {
        let err = RunError::LimitBackoffExceeded {
            attempts: 3,
            credential_id: "bot-1".into(),
            status: 429,
            signal: ThrottleSignal::Secondary {
                retry_after: Duration::from_secs(60),
            },
        };
        let response = failure_response(err, "req_abc");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "rate_limited");
    }

    #[test]
    fn transport_errors_map_to_gateway_statuses() {
        let timeout = failure_response(
            RunError::Transport(TransportError::Timeout("60s".into())),
            "req_abc",
        );
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let connect = failure_response(
            RunError::Transport(TransportError::Connect("refused".into())),
            "req_abc",
        );
        assert_eq!(connect.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn relay_strips_hop_by_hop_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("10"));
        let upstream = UpstreamResponse::new(404, headers, "missing");

        let response = relay(upstream, "req_abc");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.headers()["x-ratelimit-remaining"], "10");
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let counter = Arc::new(AtomicU64::new(0));
        let guard = InFlight::enter(&counter);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        drop(guard);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
