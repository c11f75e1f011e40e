//! Relay session lifecycle.
//!
//! ```text
//! Connecting ──▶ Relaying ──▶ Closing ──▶ Closed
//!      │                         ▲
//!      └─────────────────────────┘
//! ```

use std::fmt;

use crate::error::RelayError;

/// Lifecycle state of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Client accepted, upstream connect in flight.
    Connecting,
    /// Both peers connected, frames flowing in both directions.
    Relaying,
    /// Flows cancelled and resources being released.
    Closing,
    /// Terminal; nothing left to release.
    Closed,
}

impl SessionState {
    /// Returns `true` if moving from `self` to `next` is a valid transition.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Relaying)
                | (Self::Connecting, Self::Closing)
                | (Self::Relaying, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    /// Lower-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Relaying => "relaying",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks a session's state and the reason it ended.
///
/// The first recorded reason wins; later ones are consequences of the
/// teardown it triggered.
#[derive(Debug, Clone)]
pub struct SessionLifecycle {
    state: SessionState,
    reason: Option<RelayError>,
}

impl SessionLifecycle {
    /// Starts a lifecycle in [`SessionState::Connecting`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            reason: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Reason the session ended, if one has been recorded.
    #[must_use]
    pub const fn reason(&self) -> Option<&RelayError> {
        self.reason.as_ref()
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Internal`] and leaves the state unchanged if
    /// the transition is not allowed.
    pub fn advance(&mut self, next: SessionState) -> Result<(), RelayError> {
        if !self.state.can_advance_to(next) {
            return Err(RelayError::Internal(format!(
                "invalid session transition {} -> {next}",
                self.state
            )));
        }
        tracing::debug!(from = %self.state, to = %next, "session state change");
        self.state = next;
        Ok(())
    }

    /// Records why the session is ending and moves to
    /// [`SessionState::Closing`] if it is not already closing.
    pub fn begin_closing(&mut self, reason: RelayError) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
        if self.state.can_advance_to(SessionState::Closing) {
            self.state = SessionState::Closing;
            tracing::debug!(to = %self.state, "session state change");
        }
    }
}

impl Default for SessionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
