//! # tailrelay
//!
//! HTTP and WebSocket relay for the Tailscale `ts2021` control handshake.
//!
//! Some reverse proxies rewrite the `Upgrade: tailscale-control-protocol`
//! header of the control handshake to `Upgrade: websocket`. This service
//! sits between such a proxy and the control server: it forwards the
//! handshake POST with the header restored, and relays WebSocket sessions
//! frame by frame to an upstream connection opened with the same rewrite.
//! Payloads are never inspected or modified.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP POST, WebSocket)
//!     │
//!     ├── Relay handlers (api/)
//!     ├── RelaySession (ws/)
//!     │       inbound ──▶ Broker (domain/) ──▶ outbound ──▶ upstream
//!     │       client  ◀────────── downstream ◀──────────── upstream
//!     │
//!     ├── Forwarder, UpstreamConnector (service/)
//!     │
//!     └── RelayMetrics, tracing (observability/)
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod server;
pub mod service;
pub mod ws;
