//! Bearer-token transport handle
//!
//! One `BearerTransport` is built per configured credential. It injects the
//! static headers from config, then the credential's `Authorization: Bearer`
//! header, and forwards the request to the upstream base URL. Cloning is cheap
//! (the state sits behind an `Arc`), so the scheduler can hand a clone to each
//! unit of work.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::{Result, TransportError, UpstreamResponse};

/// Header injection rule (name + value pair from config).
#[derive(Debug, Clone)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

#[derive(Debug)]
struct Inner {
    client: reqwest::Client,
    base_url: String,
    token: Secret<String>,
    headers: Vec<HeaderInjection>,
    timeout: Duration,
}

/// Authenticated handle to one upstream API credential.
#[derive(Debug, Clone)]
pub struct BearerTransport {
    inner: Arc<Inner>,
}

impl BearerTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Secret<String>,
        headers: Vec<HeaderInjection>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                base_url: base_url.into(),
                token,
                headers,
                timeout,
            }),
        }
    }

    /// Upstream base URL, without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.inner.base_url.trim_end_matches('/')
    }

    /// Apply static header injections and this credential's bearer token.
    ///
    /// Any client-supplied `Authorization` header is replaced: the credential
    /// owns authentication. Static injections may not set `Authorization`;
    /// invalid names or values are skipped with a warning.
    pub fn prepare_headers(&self, headers: &mut HeaderMap) -> Result<()> {
        for injection in &self.inner.headers {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == AUTHORIZATION {
                warn!(header = %injection.name, "refusing to inject authorization header from config");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.insert(name, value);
        }

        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", self.inner.token.expose()))
            .map_err(|e| TransportError::InvalidHeader(format!("invalid token value: {e}")))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        Ok(())
    }

    /// Send one request to `base_url + path_and_query` and buffer the response.
    ///
    /// Non-2xx statuses are returned as responses, not errors; only failures to
    /// get any response at all become `TransportError`.
    pub async fn send(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        self.prepare_headers(&mut headers)?;
        let url = format!("{}{}", self.base_url(), path_and_query);
        debug!(%method, %url, "sending upstream request");

        let response = self
            .inner
            .client
            .request(method, &url)
            .headers(headers)
            .timeout(self.inner.timeout)
            .body(body)
            .send()
            .await?;

        UpstreamResponse::read(response).await
    }
}
