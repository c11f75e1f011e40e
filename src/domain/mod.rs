//! Domain layer: session identity, frames, lifecycle, and the broker.
//!
//! Nothing here knows about HTTP or WebSockets. The WebSocket layer
//! converts transport messages into [`Frame`]s and drives a
//! [`SessionLifecycle`]; the [`Broker`] moves frames between the tasks of
//! a session.

pub mod broker;
pub mod frame;
pub mod session_id;
pub mod session_state;

pub use broker::{Broker, Subscription, SubscriptionId};
pub use frame::Frame;
pub use session_id::SessionId;
pub use session_state::{SessionLifecycle, SessionState};
