//! Axum WebSocket upgrade handler for the relay path.

use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::Instrument;

use super::relay::RelaySession;
use crate::app_state::AppState;

/// Accepts the client's upgrade and runs one [`RelaySession`] on the
/// resulting socket.
///
/// The session runs detached from the request; its failures are logged and
/// never reach other sessions.
pub fn accept(ws: WebSocketUpgrade, headers: HeaderMap, state: &AppState) -> Response {
    let session = RelaySession::new(state);
    let session_id = session.id();
    let span = tracing::info_span!("relay_session", %session_id);

    ws.on_failed_upgrade(move |e| {
        tracing::warn!(%session_id, error = %e, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| {
        async move {
            let report = session.run(socket, headers).await;
            tracing::debug!(state = %report.state, "session finished");
        }
        .instrument(span)
    })
}
