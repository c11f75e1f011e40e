//! Relay error types with HTTP status and WebSocket close code mapping.
//!
//! [`RelayError`] is the central error type for the relay. Session-level
//! variants end one WebSocket session and are reported to the client as a
//! close frame; the forward handler reports them as a JSON error body.

use axum::extract::ws::close_code;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "upstream unreachable: connection refused",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`RelayError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Relay error enum with HTTP status and close code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category   | HTTP Status               |
/// |-----------|------------|---------------------------|
/// | 1000–1999 | Client     | 400 Bad Request           |
/// | 2000–2999 | Upstream   | 502 Bad Gateway           |
/// | 3000–3999 | Server     | 500 Internal Server Error |
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The upstream could not be reached (TCP, handshake or timeout).
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// A frame could not be written to the upstream connection.
    #[error("upstream send failed: {0}")]
    UpstreamSendFailed(String),

    /// Reading from the upstream connection failed mid-session.
    #[error("upstream receive failed: {0}")]
    UpstreamReceiveFailed(String),

    /// The upstream closed the connection cleanly.
    #[error("upstream closed the connection")]
    UpstreamClosed,

    /// The downstream client closed its connection.
    #[error("client disconnected")]
    ClientDisconnected,

    /// The client socket failed at the transport layer.
    #[error("client transport error: {0}")]
    ClientTransport(String),

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::ClientDisconnected => 1001,
            Self::ClientTransport(_) => 1002,
            Self::UpstreamUnreachable(_) => 2001,
            Self::UpstreamSendFailed(_) => 2002,
            Self::UpstreamReceiveFailed(_) => 2003,
            Self::UpstreamClosed => 2004,
            Self::Internal(_) => 3000,
            Self::InvalidConfig(_) => 3001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::ClientDisconnected | Self::ClientTransport(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnreachable(_)
            | Self::UpstreamSendFailed(_)
            | Self::UpstreamReceiveFailed(_)
            | Self::UpstreamClosed => StatusCode::BAD_GATEWAY,
            Self::InvalidConfig(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the WebSocket close code sent to the client when this error
    /// ends a session.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::UpstreamClosed | Self::ClientDisconnected => close_code::NORMAL,
            Self::UpstreamUnreachable(_) => close_code::AGAIN,
            Self::ClientTransport(_) => close_code::PROTOCOL,
            Self::UpstreamSendFailed(_)
            | Self::UpstreamReceiveFailed(_)
            | Self::InvalidConfig(_)
            | Self::Internal(_) => close_code::ERROR,
        }
    }

    /// Returns `true` if this error should increment error counters.
    ///
    /// Clean closes from either peer are informational.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::ClientDisconnected | Self::UpstreamClosed)
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
