//! Service layer: connections and requests toward the upstream.
//!
//! - [`forwarder`]: single-shot HTTP forward of the handshake POST.
//! - [`upstream`]: per-session WebSocket connections.
//! - [`headers`]: which headers cross the relay and the `Upgrade` rewrite.

pub mod forwarder;
pub mod headers;
pub mod upstream;

pub use forwarder::{ForwardedResponse, Forwarder};
pub use upstream::{UpstreamConnection, UpstreamConnector, UpstreamReceiver, UpstreamSender};
