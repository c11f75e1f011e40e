//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::domain::Broker;
use crate::error::RelayError;
use crate::observability::RelayMetrics;
use crate::service::{Forwarder, UpstreamConnector};

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<RelayConfig>,
    /// Broker shared by every WebSocket session.
    pub broker: Broker,
    /// Opens upstream WebSocket connections.
    pub connector: UpstreamConnector,
    /// Forwards the handshake POST.
    pub forwarder: Forwarder,
    /// Process-wide metrics handle.
    pub metrics: RelayMetrics,
}

impl AppState {
    /// Builds every component from `config`, recording into `metrics`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Internal`] if the HTTP client cannot be built.
    pub fn new(config: RelayConfig, metrics: RelayMetrics) -> Result<Self, RelayError> {
        let broker = Broker::new(config.subscription_capacity);
        let connector = UpstreamConnector::from_config(&config);
        let forwarder = Forwarder::from_config(&config, metrics.clone())?;
        Ok(Self {
            config: Arc::new(config),
            broker,
            connector,
            forwarder,
            metrics,
        })
    }
}
