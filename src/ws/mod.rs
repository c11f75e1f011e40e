//! WebSocket layer: upgrade handling and the per-client relay session.
//!
//! A client upgrading on the relay path gets its own [`RelaySession`],
//! which owns one upstream WebSocket and one broker subscription for its
//! whole lifetime.

pub mod handler;
pub mod relay;

pub use relay::{RelaySession, SessionReport};
