//! Relay path handlers: handshake forwarding and WebSocket upgrade.

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::error::{ErrorResponse, RelayError};
use crate::service::ForwardedResponse;
use crate::ws::handler::accept;

/// Body of the debug reply to a plain GET on the relay path.
#[derive(Debug, Serialize, ToSchema)]
pub struct DebugInfo {
    /// Always `"relay"`.
    pub service: &'static str,
    /// Path the relay is mounted on.
    pub relay_path: String,
    /// Upstream HTTP endpoint the POST handshake is forwarded to.
    pub upstream: String,
    /// Metrics run identifier.
    pub run_id: String,
}

/// `POST {relay_path}` — Forward the control handshake upstream.
///
/// The OpenAPI document lists the default `/ts2021`; the route itself is
/// mounted at the configured `RELAY_PATH`.
#[utoipa::path(
    post,
    path = "/ts2021",
    tag = "Relay",
    summary = "Forward control handshake",
    description = "Forwards the request to the upstream control server with the Upgrade \
                   header rewritten, and returns the upstream reply unchanged.",
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Upstream reply, any status is passed through"),
        (status = 502, description = "Upstream unreachable", body = ErrorResponse),
    )
)]
pub async fn forward_handler(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ForwardedResponse, RelayError> {
    state.forwarder.forward(query.as_deref(), &headers, body).await
}

/// `GET {relay_path}` — WebSocket relay, or a non-upgrade GET.
///
/// Documented at the default `/ts2021` like [`forward_handler`].
/// Upgrade requests start a relay session. Other requests get 418 with a
/// short description in debug mode and a redirect to `/` otherwise.
#[utoipa::path(
    get,
    path = "/ts2021",
    tag = "Relay",
    summary = "WebSocket relay",
    responses(
        (status = 101, description = "Switched to a relayed WebSocket"),
        (status = 303, description = "Not an upgrade request"),
        (status = 418, description = "Not an upgrade request, debug mode", body = DebugInfo),
    )
)]
pub async fn upgrade_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => accept(ws, headers, &state),
        Err(rejection) => {
            tracing::debug!(reason = %rejection, "plain GET on relay path");
            not_an_upgrade(&state)
        }
    }
}

fn not_an_upgrade(state: &AppState) -> Response {
    if state.config.debug {
        let info = DebugInfo {
            service: "relay",
            relay_path: state.config.relay_path.clone(),
            upstream: state.forwarder.target().to_string(),
            run_id: state.metrics.run_id().to_string(),
        };
        (StatusCode::IM_A_TEAPOT, Json(info)).into_response()
    } else {
        Redirect::to("/").into_response()
    }
}

/// Relay routes mounted at `relay_path`.
pub fn routes(relay_path: &str) -> Router<AppState> {
    Router::new().route(relay_path, get(upgrade_handler).post(forward_handler))
}
