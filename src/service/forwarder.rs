//! Single-shot HTTP forwarder for the control handshake POST.

use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use url::Url;

use super::headers::{forward_request_headers, forward_response_headers};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::observability::RelayMetrics;

/// Upstream reply, ready to hand back to the client.
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    /// Upstream status code.
    pub status: StatusCode,
    /// Upstream end-to-end headers.
    pub headers: HeaderMap,
    /// Upstream body, unchanged.
    pub body: Bytes,
}

impl IntoResponse for ForwardedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Forwards requests to the upstream HTTP endpoint.
///
/// Holds no per-request state; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    target: Url,
    upgrade_token: Option<HeaderValue>,
    metrics: RelayMetrics,
}

impl Forwarder {
    /// Creates a forwarder for the upstream HTTP endpoint in `config`.
    ///
    /// Redirects from upstream are returned to the client, not followed,
    /// and proxy environment variables are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Internal`] if the HTTP client cannot be built.
    pub fn from_config(config: &RelayConfig, metrics: RelayMetrics) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            target: config.upstream_http_url(),
            upgrade_token: config.upgrade_token.clone(),
            metrics,
        })
    }

    /// URL requests are forwarded to, before the query string is applied.
    #[must_use]
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Forwards one POST upstream and collects the full reply.
    ///
    /// `query` is appended to the target URL unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UpstreamUnreachable`] if the request fails
    /// before a complete response is read.
    pub async fn forward(
        &self,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ForwardedResponse, RelayError> {
        let started = Instant::now();
        let request_bytes = body.len();

        let mut url = self.target.clone();
        url.set_query(query);

        let result = self.send(url, headers, body).await;
        match &result {
            Ok(response) => {
                self.metrics
                    .record_http(request_bytes, response.body.len(), started.elapsed());
                tracing::debug!(
                    status = %response.status,
                    request_bytes,
                    response_bytes = response.body.len(),
                    "forwarded request"
                );
            }
            Err(e) => {
                self.metrics.record_http_error(request_bytes, started.elapsed());
                tracing::error!(error = %e, target = %self.target, "forward failed");
            }
        }
        result
    }

    async fn send(
        &self,
        url: Url,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<ForwardedResponse, RelayError> {
        let response = self
            .client
            .post(url)
            .headers(forward_request_headers(headers, self.upgrade_token.as_ref()))
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))?;

        let status = response.status();
        let headers = forward_response_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))?;

        Ok(ForwardedResponse {
            status,
            headers,
            body,
        })
    }
}
