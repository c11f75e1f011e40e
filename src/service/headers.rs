//! Header policy for forwarded requests and responses.
//!
//! End-to-end headers pass through untouched. Hop-by-hop headers, and the
//! ones the outgoing client regenerates for its own connection, are
//! dropped. The `Upgrade` header is then rewritten to the configured
//! control-protocol token, undoing the intermediary that turns it into
//! `websocket`.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Headers that describe a single connection and never cross the relay.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Regenerated by the HTTP client for the upstream request.
static REGENERATED_HTTP: [HeaderName; 2] = [header::HOST, header::CONTENT_LENGTH];

/// Regenerated by the upstream WebSocket handshake.
static REGENERATED_WS: [HeaderName; 6] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
    header::SEC_WEBSOCKET_PROTOCOL,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

/// Headers to send upstream with a forwarded HTTP request.
///
/// `Upgrade` and `Connection` are kept on this path: the control handshake
/// is an HTTP upgrade, and the upstream must see both.
#[must_use]
pub fn forward_request_headers(inbound: &HeaderMap, upgrade_token: Option<&HeaderValue>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if REGENERATED_HTTP.contains(name) {
            continue;
        }
        if is_hop_by_hop(name) && *name != header::UPGRADE && *name != header::CONNECTION {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    rewrite_upgrade(&mut headers, upgrade_token);
    headers
}

/// Headers to add to the upstream WebSocket handshake.
///
/// The handshake itself supplies `Connection`, `Sec-WebSocket-*` and `Host`;
/// only end-to-end headers from the client are carried over. The caller
/// rewrites `Upgrade` after the handshake request is built.
#[must_use]
pub fn forward_handshake_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if REGENERATED_WS.contains(name) || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Headers to return to the client from an upstream HTTP response.
///
/// `Content-Length` is dropped because the body is re-framed locally.
#[must_use]
pub fn forward_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Replaces the `Upgrade` header with `token`. No-op when `token` is `None`.
pub fn rewrite_upgrade(headers: &mut HeaderMap, token: Option<&HeaderValue>) {
    if let Some(token) = token {
        headers.insert(header::UPGRADE, token.clone());
    }
}
