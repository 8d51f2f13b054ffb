//! Quota Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of upstream API credentials, each with its own quota
//! 2. Listens for incoming requests
//! 3. Leases a credential per request, injecting its bearer token
//! 4. Proxies to the upstream API, backing off and rotating when throttled

mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use access_pool::{AccessCoordinator, Credential, SchedulerConfig};
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::BearerTransport;

use crate::config::{Config, CredentialConfig, HeaderInjection, ProxyConfig};
use crate::proxy::ProxyState;

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` caps concurrently processed requests; excess requests
/// queue in the concurrency limit layer.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// One `BearerTransport` per credential, sharing a single connection pool.
fn build_coordinator(
    proxy: &ProxyConfig,
    scheduler: &SchedulerConfig,
    credentials: Vec<CredentialConfig>,
    headers: &[HeaderInjection],
) -> error::Result<AccessCoordinator<BearerTransport>> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| error::Error::HttpClient(e.to_string()))?;
    let injections: Vec<transport::HeaderInjection> =
        headers.iter().cloned().map(Into::into).collect();

    let credentials = credentials
        .into_iter()
        .map(|credential| {
            let token = credential
                .token
                .ok_or_else(|| error::Error::MissingToken(credential.id.clone()))?;
            let transport = BearerTransport::new(
                client.clone(),
                proxy.upstream_url.clone(),
                token,
                injections.clone(),
                proxy.timeout(),
            );
            Ok(Credential::new(credential.id, transport, credential.quota))
        })
        .collect::<error::Result<Vec<_>>>()?;

    Ok(AccessCoordinator::new(credentials, scheduler)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting quota-proxy");

    // Install before the scheduler records anything
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        credentials = config.credentials.len(),
        headers = config.headers.len(),
        max_wait_secs = config.scheduler.max_wait_secs,
        "configuration loaded"
    );

    let Config {
        proxy: proxy_config,
        scheduler,
        credentials,
        headers,
    } = config;

    let coordinator = Arc::new(
        build_coordinator(&proxy_config, &scheduler, credentials, &headers)
            .context("failed to build access coordinator")?,
    );
    let reporter =
        access_pool::spawn_status_reporter(Arc::clone(&coordinator), proxy_config.report_interval());

    let in_flight = Arc::new(AtomicU64::new(0));
    let app_state = AppState {
        proxy: ProxyState {
            coordinator,
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::clone(&in_flight),
        },
        started_at: Instant::now(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, proxy_config.max_connections);

    let listener = TcpListener::bind(proxy_config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", proxy_config.listen_addr))?;
    info!(addr = %proxy_config.listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    reporter.abort();
    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: scheduler status plus service counters.
///
/// Returns 503 when no credential can admit a request right now.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.proxy.coordinator.status();
    let status_code = if scheduler.is_unhealthy() {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": scheduler.status,
        "credentials_total": scheduler.credentials_total,
        "credentials_available": scheduler.credentials_available,
        "credentials": scheduler.credentials,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.proxy.requests_total.load(Ordering::Relaxed),
        "errors_total": state.proxy.errors_total.load(Ordering::Relaxed),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Catch-all handler that proxies all non-health requests to upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use access_pool::QuotaConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::Secret;
    use tower::ServiceExt;

    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn proxy_config(upstream_url: &str, timeout_secs: u64) -> ProxyConfig {
        ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_url: upstream_url.to_string(),
            timeout_secs,
            max_connections: 1000,
            report_interval_secs: 30,
        }
    }

    /// Credential `id` with token `token-{id}`.
    fn credential(id: &str, quota: QuotaConfig) -> CredentialConfig {
        CredentialConfig {
            id: id.to_string(),
            token_env: None,
            token_file: None,
            quota,
            token: Some(Secret::new(format!("token-{id}"))),
        }
    }

    fn roomy() -> QuotaConfig {
        QuotaConfig::TokenBucket {
            capacity: 100,
            refill_rate_per_second: 10.0,
        }
    }

    /// One unit, refilling roughly every 17 minutes.
    fn single_shot() -> QuotaConfig {
        QuotaConfig::TokenBucket {
            capacity: 1,
            refill_rate_per_second: 0.001,
        }
    }

    fn test_app_state_with(
        proxy: &ProxyConfig,
        scheduler: &SchedulerConfig,
        credentials: Vec<CredentialConfig>,
        headers: &[HeaderInjection],
    ) -> AppState {
        let coordinator = build_coordinator(proxy, scheduler, credentials, headers).unwrap();
        AppState {
            proxy: ProxyState {
                coordinator: Arc::new(coordinator),
                requests_total: Arc::new(AtomicU64::new(0)),
                errors_total: Arc::new(AtomicU64::new(0)),
                in_flight: Arc::new(AtomicU64::new(0)),
            },
            started_at: Instant::now(),
            prometheus: test_prometheus_handle(),
        }
    }

    fn test_app_state(upstream_url: &str, credentials: Vec<CredentialConfig>) -> AppState {
        test_app_state_with(
            &proxy_config(upstream_url, 5),
            &SchedulerConfig {
                max_wait_secs: 0.0,
                ..SchedulerConfig::default()
            },
            credentials,
            &[HeaderInjection {
                name: "accept".into(),
                value: "application/vnd.github+json".into(),
            }],
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn serve(app: axum::Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    /// Mock upstream that echoes back request headers, method, path, query and body as JSON.
    async fn start_echo_server() -> (String, tokio::task::JoinHandle<()>) {
        serve(
            axum::Router::new().fallback(|request: axum::http::Request<Body>| async move {
                let mut headers_map = serde_json::Map::new();
                for (name, value) in request.headers() {
                    headers_map.insert(
                        name.to_string(),
                        serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                    );
                }
                let method = request.method().to_string();
                let path = request.uri().path().to_string();
                let query = request.uri().query().unwrap_or("").to_string();
                let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
                    .await
                    .unwrap();
                let body = serde_json::json!({
                    "echoed_headers": headers_map,
                    "method": method,
                    "path": path,
                    "query": query,
                    "body": String::from_utf8_lossy(&body_bytes),
                });
                (
                    StatusCode::OK,
                    [("x-ratelimit-remaining", "4999"), ("connection", "close")],
                    axum::Json(body),
                )
            }),
        )
        .await
    }

    /// Mock upstream that throttles `token-bot-1` with `retry_after` and echoes
    /// the token for everyone else.
    async fn start_throttling_server(
        retry_after: &'static str,
    ) -> (String, tokio::task::JoinHandle<()>) {
        serve(
            axum::Router::new().fallback(move |request: axum::http::Request<Body>| async move {
                let token = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if token == "Bearer token-bot-1" {
                    return (
                        StatusCode::TOO_MANY_REQUESTS,
                        [("retry-after", retry_after)],
                        String::from("slow down"),
                    )
                        .into_response();
                }
                (StatusCode::OK, token).into_response()
            }),
        )
        .await
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_credentials() {
        let state = test_app_state(
            "http://unused",
            vec![credential("bot-1", roomy()), credential("bot-2", roomy())],
        );
        state.proxy.requests_total.fetch_add(5, Ordering::Relaxed);
        let app = build_router(state, 1000);

        let response = send(&app, get_req("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["credentials_total"], 2);
        assert_eq!(json["credentials_available"], 2);
        assert_eq!(json["credentials"][0]["id"], "bot-1");
        assert_eq!(json["requests_served"], 5);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_endpoint_unhealthy_when_every_credential_is_spent() {
        let (upstream_url, _server) = start_echo_server().await;
        let app = build_router(
            test_app_state(&upstream_url, vec![credential("bot-1", single_shot())]),
            1000,
        );

        let response = send(&app, get_req("/repos")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, get_req("/health")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["credentials_available"], 0);
        assert!(json["credentials"][0]["next_available_in_secs"].as_f64().unwrap() > 900.0);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let app = build_router(
            test_app_state("http://unused", vec![credential("bot-1", roomy())]),
            1000,
        );

        let response = send(&app, get_req("/metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn proxy_injects_bearer_token_and_headers() {
        let (upstream_url, _server) = start_echo_server().await;
        let app = build_router(
            test_app_state(&upstream_url, vec![credential("bot-1", roomy())]),
            1000,
        );

        let response = send(
            &app,
            Request::builder()
                .uri("/repos/rust-lang/rust")
                .header("authorization", "Bearer client-supplied")
                .header("accept", "text/html")
                .header("x-custom", "kept")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let headers = &json["echoed_headers"];
        assert_eq!(headers["authorization"], "Bearer token-bot-1");
        assert_eq!(headers["accept"], "application/vnd.github+json");
        assert_eq!(headers["x-custom"], "kept");
    }

    #[tokio::test]
    async fn proxy_forwards_method_path_query_and_body() {
        let (upstream_url, _server) = start_echo_server().await;
        let app = build_router(
            test_app_state(&upstream_url, vec![credential("bot-1", roomy())]),
            1000,
        );

        let response = send(
            &app,
            Request::builder()
                .uri("/search/issues?q=label:bug&page=2")
                .method("POST")
                .header("host", "client.example")
                .body(Body::from(r#"{"title":"x"}"#))
                .unwrap(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/search/issues");
        assert_eq!(json["query"], "q=label:bug&page=2");
        assert_eq!(json["body"], r#"{"title":"x"}"#);
        assert_ne!(json["echoed_headers"]["host"], "client.example");
    }

    #[tokio::test]
    async fn proxy_relays_upstream_headers_without_hop_by_hop() {
        let (upstream_url, _server) = start_echo_server().await;
        let app = build_router(
            test_app_state(&upstream_url, vec![credential("bot-1", roomy())]),
            1000,
        );

        let response = send(&app, get_req("/rate_limit")).await;
        assert_eq!(response.headers()["x-ratelimit-remaining"], "4999");
        assert!(response.headers().get("connection").is_none());
    }

    #[tokio::test]
    async fn proxy_rotates_to_next_credential_when_one_is_spent() {
        let (upstream_url, _server) = start_echo_server().await;
        let app = build_router(
            test_app_state(
                &upstream_url,
                vec![credential("bot-1", single_shot()), credential("bot-2", single_shot())],
            ),
            1000,
        );

        let mut tokens = Vec::new();
        for _ in 0..2 {
            let response = send(&app, get_req("/user")).await;
            assert_eq!(response.status(), StatusCode::OK);
            let json = body_json(response).await;
            tokens.push(json["echoed_headers"]["authorization"].as_str().unwrap().to_string());
        }
        assert_eq!(tokens, ["Bearer token-bot-1", "Bearer token-bot-2"]);
    }

    #[tokio::test]
    async fn proxy_returns_503_with_retry_after_when_quota_exhausted() {
        let (upstream_url, _server) = start_echo_server().await;
        let app = build_router(
            test_app_state(&upstream_url, vec![credential("bot-1", single_shot())]),
            1000,
        );

        assert_eq!(send(&app, get_req("/user")).await.status(), StatusCode::OK);

        let response = send(&app, get_req("/user")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let retry_after: u64 = response.headers()["retry-after"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((990..=1000).contains(&retry_after), "got {retry_after}");
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "quota_exhausted");
    }

    #[tokio::test]
    async fn throttled_credential_is_deferred_and_request_retried_elsewhere() {
        let (upstream_url, _server) = start_throttling_server("30").await;
        let state = test_app_state(
            &upstream_url,
            vec![credential("bot-1", roomy()), credential("bot-2", roomy())],
        );
        let coordinator = Arc::clone(&state.proxy.coordinator);
        let app = build_router(state, 1000);

        let response = send(&app, get_req("/user")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"Bearer token-bot-2");

        let status = coordinator.status();
        assert!(status.credentials[0].deferred);
        assert!(!status.credentials[1].deferred);
        assert_eq!(status.status, "degraded");
    }

    #[tokio::test]
    async fn persistent_throttling_returns_429() {
        let (upstream_url, _server) = start_throttling_server("0").await;
        let app = build_router(
            test_app_state_with(
                &proxy_config(&upstream_url, 5),
                &SchedulerConfig {
                    retry_budget: 1,
                    min_retry_after_secs: 0.0,
                    ..SchedulerConfig::default()
                },
                vec![credential("bot-1", roomy())],
                &[],
            ),
            1000,
        );

        let response = send(&app, get_req("/user")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "rate_limited");
    }

    #[tokio::test]
    async fn proxy_returns_502_for_dead_upstream() {
        let state = test_app_state("http://127.0.0.1:1", vec![credential("bot-1", roomy())]);
        let errors_total = Arc::clone(&state.proxy.errors_total);
        let app = build_router(state, 1000);

        let response = send(&app, get_req("/fail")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
        assert!(json["error"]["message"].is_string());
        let request_id = json["error"]["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req_"), "got: {request_id}");
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn proxy_timeout_returns_504() {
        let (upstream_url, _server) = serve(axum::Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "too late"
        }))
        .await;
        let app = build_router(
            test_app_state_with(
                &proxy_config(&upstream_url, 1),
                &SchedulerConfig::default(),
                vec![credential("bot-1", roomy())],
                &[],
            ),
            1000,
        );

        let response = send(&app, get_req("/slow")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn proxy_rejects_oversized_request_body() {
        let (upstream_url, _server) = start_echo_server().await;
        let app = build_router(
            test_app_state(&upstream_url, vec![credential("bot-1", roomy())]),
            1000,
        );

        let response = send(
            &app,
            Request::builder()
                .uri("/upload")
                .method("POST")
                .body(Body::from(vec![b'x'; 10 * 1024 * 1024 + 1]))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn proxy_tracks_requests_and_in_flight() {
        let (upstream_url, _server) = start_echo_server().await;
        let state = test_app_state(&upstream_url, vec![credential("bot-1", roomy())]);
        let requests_total = Arc::clone(&state.proxy.requests_total);
        let in_flight = Arc::clone(&state.proxy.in_flight);
        let app = build_router(state, 1000);

        send(&app, get_req("/a")).await;
        send(&app, get_req("/b")).await;
        assert_eq!(requests_total.load(Ordering::Relaxed), 2);
        assert_eq!(in_flight.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn build_coordinator_requires_resolved_tokens() {
        let mut unresolved = credential("bot-1", roomy());
        unresolved.token = None;
        let err = build_coordinator(
            &proxy_config("http://unused", 5),
            &SchedulerConfig::default(),
            vec![unresolved],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, error::Error::MissingToken(id) if id == "bot-1"));
    }
}
