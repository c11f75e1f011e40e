//! Observability: structured logging setup and relay metrics.
//!
//! ```text
//! handlers / sessions
//!     → tracing events   → logging.rs (fmt or JSON subscriber)
//!     → RelayMetrics     → metrics.rs (Prometheus text at /metrics)
//! ```

pub mod logging;
pub mod metrics;

pub use logging::init_tracing;
pub use metrics::{Direction, RelayMetrics};
