//! Relay metrics and Prometheus exposition.
//!
//! [`RelayMetrics`] owns a private Prometheus recorder instead of the global
//! one. It is created once at startup, passed to every component that
//! records, and rendered by `GET /metrics`. Every series carries the
//! `run_id` label so restarts are distinguishable.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, SharedString};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

/// HTTP forward requests (counter).
pub const HTTP_REQUESTS_TOTAL: &str = "relay_http_requests_total";
/// HTTP forward failures (counter).
pub const HTTP_ERRORS_TOTAL: &str = "relay_http_errors_total";
/// Forwarded request body size (histogram).
pub const HTTP_REQUEST_SIZE_BYTES: &str = "relay_http_request_size_bytes";
/// Forwarded response body size (histogram).
pub const HTTP_RESPONSE_SIZE_BYTES: &str = "relay_http_response_size_bytes";
/// Forward round-trip latency (histogram).
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "relay_http_request_duration_seconds";
/// WebSocket sessions accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "relay_ws_connections_total";
/// WebSocket sessions that ended with a failure (counter).
pub const WS_ERRORS_TOTAL: &str = "relay_ws_errors_total";
/// WebSocket sessions currently open (gauge).
pub const WS_SESSIONS_ACTIVE: &str = "relay_ws_sessions_active";
/// Frames read from a peer (counter, labels: direction).
pub const WS_MESSAGES_TOTAL: &str = "relay_ws_messages_total";
/// Frames written to the other peer (counter, labels: direction).
pub const WS_MESSAGES_RELAYED_TOTAL: &str = "relay_ws_messages_relayed_total";
/// Frames dropped at teardown (counter).
pub const WS_MESSAGES_DISCARDED_TOTAL: &str = "relay_ws_messages_discarded_total";
/// Frame payload size (histogram, labels: direction).
pub const WS_MESSAGE_SIZE_BYTES: &str = "relay_ws_message_size_bytes";
/// Session lifetime (histogram).
pub const WS_SESSION_DURATION_SECONDS: &str = "relay_ws_session_duration_seconds";

/// Direction a frame travels through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to upstream.
    Upstream,
    /// Upstream to client.
    Downstream,
}

impl Direction {
    /// Label value used for the `direction` label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "client_to_upstream",
            Self::Downstream => "upstream_to_client",
        }
    }
}

#[derive(Clone)]
struct DirectionMetrics {
    received: Counter,
    relayed: Counter,
    size: Histogram,
}

/// Process-wide metrics handle.
///
/// Cheap to clone; clones record into the same series.
#[derive(Clone)]
pub struct RelayMetrics {
    run_id: Arc<str>,
    handle: PrometheusHandle,
    http_requests: Counter,
    http_errors: Counter,
    http_request_size: Histogram,
    http_response_size: Histogram,
    http_duration: Histogram,
    ws_connections: Counter,
    ws_errors: Counter,
    ws_active: Gauge,
    /// Mirrors `ws_active`; the gauge handle cannot be read back.
    active_sessions: Arc<AtomicUsize>,
    ws_discarded: Counter,
    ws_session_duration: Histogram,
    upstream: DirectionMetrics,
    downstream: DirectionMetrics,
}

impl RelayMetrics {
    /// Creates a recorder and registers every relay series labelled with
    /// `run_id`.
    #[must_use]
    pub fn new(run_id: &str) -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        describe(&recorder);

        let run_id: Arc<str> = Arc::from(run_id);
        let base = vec![Label::new("run_id", run_id.to_string())];
        let with_direction = |direction: Direction| {
            let mut labels = base.clone();
            labels.push(Label::new("direction", direction.as_str()));
            DirectionMetrics {
                received: counter(&recorder, WS_MESSAGES_TOTAL, labels.clone()),
                relayed: counter(&recorder, WS_MESSAGES_RELAYED_TOTAL, labels.clone()),
                size: histogram(&recorder, WS_MESSAGE_SIZE_BYTES, labels),
            }
        };
        let upstream = with_direction(Direction::Upstream);
        let downstream = with_direction(Direction::Downstream);

        Self {
            handle: recorder.handle(),
            http_requests: counter(&recorder, HTTP_REQUESTS_TOTAL, base.clone()),
            http_errors: counter(&recorder, HTTP_ERRORS_TOTAL, base.clone()),
            http_request_size: histogram(&recorder, HTTP_REQUEST_SIZE_BYTES, base.clone()),
            http_response_size: histogram(&recorder, HTTP_RESPONSE_SIZE_BYTES, base.clone()),
            http_duration: histogram(&recorder, HTTP_REQUEST_DURATION_SECONDS, base.clone()),
            ws_connections: counter(&recorder, WS_CONNECTIONS_TOTAL, base.clone()),
            ws_errors: counter(&recorder, WS_ERRORS_TOTAL, base.clone()),
            ws_active: gauge(&recorder, WS_SESSIONS_ACTIVE, base.clone()),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            ws_discarded: counter(&recorder, WS_MESSAGES_DISCARDED_TOTAL, base.clone()),
            ws_session_duration: histogram(&recorder, WS_SESSION_DURATION_SECONDS, base),
            upstream,
            downstream,
            run_id,
        }
    }

    /// Process run identifier attached to every series.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Sessions opened and not yet closed, from accept to the end of
    /// teardown.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Renders all series in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Compacts histogram storage. Call periodically.
    pub fn run_upkeep(&self) {
        self.handle.run_upkeep();
    }

    /// Records one forwarded HTTP request that got an upstream response.
    pub fn record_http(&self, request_bytes: usize, response_bytes: usize, elapsed: Duration) {
        self.http_requests.increment(1);
        self.http_request_size.record(request_bytes as f64);
        self.http_response_size.record(response_bytes as f64);
        self.http_duration.record(elapsed.as_secs_f64());
    }

    /// Records one forwarded HTTP request that failed before a response.
    pub fn record_http_error(&self, request_bytes: usize, elapsed: Duration) {
        self.http_requests.increment(1);
        self.http_errors.increment(1);
        self.http_request_size.record(request_bytes as f64);
        self.http_duration.record(elapsed.as_secs_f64());
    }

    /// Records an accepted WebSocket session.
    pub fn session_opened(&self) {
        self.ws_connections.increment(1);
        self.ws_active.increment(1.0);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the end of a WebSocket session.
    pub fn session_closed(&self, lifetime: Duration, failed: bool) {
        self.ws_active.decrement(1.0);
        // Saturating so a stray close can never wrap the count.
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.ws_session_duration.record(lifetime.as_secs_f64());
        if failed {
            self.ws_errors.increment(1);
        }
    }

    /// Records a frame read from one peer.
    pub fn frame_received(&self, direction: Direction, bytes: usize) {
        let metrics = self.direction(direction);
        metrics.received.increment(1);
        metrics.size.record(bytes as f64);
    }

    /// Records a frame successfully written to the other peer.
    pub fn frame_relayed(&self, direction: Direction) {
        self.direction(direction).relayed.increment(1);
    }

    /// Records frames dropped during teardown.
    pub fn frames_discarded(&self, count: usize) {
        if count > 0 {
            self.ws_discarded.increment(count as u64);
        }
    }

    fn direction(&self, direction: Direction) -> &DirectionMetrics {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }
}

impl fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayMetrics")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

fn counter(recorder: &PrometheusRecorder, name: &'static str, labels: Vec<Label>) -> Counter {
    recorder.register_counter(&Key::from_parts(name, labels), &metadata())
}

fn gauge(recorder: &PrometheusRecorder, name: &'static str, labels: Vec<Label>) -> Gauge {
    recorder.register_gauge(&Key::from_parts(name, labels), &metadata())
}

fn histogram(recorder: &PrometheusRecorder, name: &'static str, labels: Vec<Label>) -> Histogram {
    recorder.register_histogram(&Key::from_parts(name, labels), &metadata())
}

fn describe(recorder: &PrometheusRecorder) {
    let counters = [
        (HTTP_REQUESTS_TOTAL, "Forwarded HTTP requests."),
        (HTTP_ERRORS_TOTAL, "Forwarded HTTP requests that got no upstream response."),
        (WS_CONNECTIONS_TOTAL, "WebSocket sessions accepted."),
        (WS_ERRORS_TOTAL, "WebSocket sessions that ended with a failure."),
        (WS_MESSAGES_TOTAL, "Frames read from a peer."),
        (WS_MESSAGES_RELAYED_TOTAL, "Frames written to the other peer."),
        (WS_MESSAGES_DISCARDED_TOTAL, "Frames dropped during session teardown."),
    ];
    for (name, help) in counters {
        recorder.describe_counter(
            KeyName::from_const_str(name),
            None,
            SharedString::const_str(help),
        );
    }

    recorder.describe_gauge(
        KeyName::from_const_str(WS_SESSIONS_ACTIVE),
        None,
        SharedString::const_str("WebSocket sessions currently open."),
    );

    let histograms = [
        (HTTP_REQUEST_SIZE_BYTES, "Forwarded request body size."),
        (HTTP_RESPONSE_SIZE_BYTES, "Forwarded response body size."),
        (HTTP_REQUEST_DURATION_SECONDS, "Forward round-trip latency."),
        (WS_MESSAGE_SIZE_BYTES, "Relayed frame payload size."),
        (WS_SESSION_DURATION_SECONDS, "WebSocket session lifetime."),
    ];
    for (name, help) in histograms {
        recorder.describe_histogram(
            KeyName::from_const_str(name),
            None,
            SharedString::const_str(help),
        );
    }
}
