//! Relay session: one downstream client bridged to one upstream WebSocket.
//!
//! A session runs up to three tasks in a [`JoinSet`]:
//!
//! ```text
//! client ──inbound──▶ Broker::publish ─▶ Subscription ──outbound──▶ upstream
//! client ◀──────────────────downstream─────────────────────────── upstream
//! ```
//!
//! The inbound flow starts as soon as the client is accepted, so a client
//! that leaves while the upstream is still connecting is noticed. The first
//! flow to end decides why the session ends. Teardown then cancels the
//! remaining flows through the session's [`CancellationToken`], joins every
//! task, and only then closes the upstream and the client.
//!
//! # Buffered frames
//!
//! When the client disconnects, frames it already sent are still flushed to
//! the upstream (bounded by the drain timeout), and the upstream connection
//! is kept open until the upstream answers the close handshake, so frames it
//! has not processed yet are not cut off. When the upstream goes away first,
//! frames still queued for it have nowhere to go; they are dropped and
//! counted in `relay_ws_messages_discarded_total`, as are client frames read
//! after the subscription is gone. Frames from the upstream are written to
//! the client one at a time as they arrive, so none are held back when the
//! upstream closes.

use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::http::HeaderMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::app_state::AppState;
use crate::domain::{
    Broker, Frame, SessionId, SessionLifecycle, SessionState, Subscription, SubscriptionId,
};
use crate::error::RelayError;
use crate::observability::{Direction, RelayMetrics};
use crate::service::{UpstreamConnection, UpstreamConnector, UpstreamReceiver, UpstreamSender};

type ClientSink = SplitSink<WebSocket, Message>;
type ClientStream = SplitStream<WebSocket>;

/// Upper bound on each close handshake at teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Close reasons are limited to 123 bytes by the WebSocket protocol.
const MAX_CLOSE_REASON: usize = 123;

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Session identifier.
    pub session_id: SessionId,
    /// Final lifecycle state; always [`SessionState::Closed`].
    pub state: SessionState,
    /// Why the session ended.
    pub reason: Option<RelayError>,
    /// Frames written to the upstream.
    pub relayed_upstream: u64,
    /// Frames written to the client.
    pub relayed_downstream: u64,
    /// Frames dropped at teardown.
    pub discarded: usize,
    /// Time from accept to close.
    pub duration: Duration,
}

#[derive(Debug)]
enum FlowExit {
    Cancelled,
    /// The subscription was unsubscribed and every queued frame was sent.
    Drained,
    Ended(RelayError),
}

enum FlowOutcome {
    Inbound {
        exit: FlowExit,
        dropped: usize,
    },
    Outbound {
        subscription: Subscription,
        sender: UpstreamSender,
        exit: FlowExit,
        relayed: u64,
        dropped: usize,
    },
    Downstream {
        sink: ClientSink,
        receiver: UpstreamReceiver,
        exit: FlowExit,
        relayed: u64,
    },
}

/// Resources handed back by finished flows, released at teardown.
#[derive(Default)]
struct Parts {
    client: Option<ClientSink>,
    subscription: Option<Subscription>,
    upstream: Option<UpstreamSender>,
    upstream_receiver: Option<UpstreamReceiver>,
    relayed_upstream: u64,
    relayed_downstream: u64,
    discarded: usize,
}

impl Parts {
    /// Takes back whatever a finished flow owned and returns the reason it
    /// ended, if it ended on its own.
    fn absorb(&mut self, joined: Result<FlowOutcome, JoinError>) -> Option<RelayError> {
        let exit = match joined {
            Ok(FlowOutcome::Inbound { exit, dropped }) => {
                self.discarded += dropped;
                exit
            }
            Ok(FlowOutcome::Outbound {
                subscription,
                sender,
                exit,
                relayed,
                dropped,
            }) => {
                self.subscription = Some(subscription);
                self.upstream = Some(sender);
                self.relayed_upstream += relayed;
                self.discarded += dropped;
                exit
            }
            Ok(FlowOutcome::Downstream {
                sink,
                receiver,
                exit,
                relayed,
            }) => {
                self.client = Some(sink);
                self.upstream_receiver = Some(receiver);
                self.relayed_downstream += relayed;
                exit
            }
            Err(e) => FlowExit::Ended(RelayError::Internal(format!("relay task failed: {e}"))),
        };
        match exit {
            FlowExit::Ended(reason) => Some(reason),
            FlowExit::Cancelled | FlowExit::Drained => None,
        }
    }
}

/// One client-to-upstream relay instance.
#[derive(Debug)]
pub struct RelaySession {
    id: SessionId,
    broker: Broker,
    connector: UpstreamConnector,
    metrics: RelayMetrics,
    drain_timeout: Duration,
    cancel: CancellationToken,
    lifecycle: SessionLifecycle,
}

impl RelaySession {
    /// Creates a session wired to the shared components in `state`.
    #[must_use]
    pub fn new(state: &AppState) -> Self {
        Self {
            id: SessionId::new(),
            broker: state.broker.clone(),
            connector: state.connector.clone(),
            metrics: state.metrics.clone(),
            drain_timeout: state.config.drain_timeout,
            cancel: CancellationToken::new(),
            lifecycle: SessionLifecycle::new(),
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Relays between `socket` and a new upstream connection until either
    /// side ends, then releases everything.
    ///
    /// `client_headers` are the client's upgrade request headers; end-to-end
    /// ones are forwarded in the upstream handshake. Failures are contained
    /// to this session and reported in the returned [`SessionReport`].
    pub async fn run(mut self, socket: WebSocket, client_headers: HeaderMap) -> SessionReport {
        let started = Instant::now();
        self.metrics.session_opened();
        tracing::info!(upstream = %self.connector.url(), "session opened");

        let (client_sink, client_stream) = socket.split();
        let subscription = self.broker.subscribe(self.id);
        let subscription_id = subscription.id();
        let mut parts = Parts {
            client: Some(client_sink),
            subscription: Some(subscription),
            ..Parts::default()
        };

        let mut flows = JoinSet::new();
        let inbound = inbound_flow(
            client_stream,
            self.broker.clone(),
            self.id,
            self.cancel.clone(),
            self.metrics.clone(),
        );
        flows.spawn(inbound.in_current_span());

        let connected = tokio::select! {
            result = self.connector.connect(&client_headers) => result,
            Some(joined) = flows.join_next() => Err(parts
                .absorb(joined)
                .unwrap_or(RelayError::ClientDisconnected)),
        };

        match connected {
            Ok(connection) => {
                self.relay(connection, subscription_id, &mut flows, &mut parts)
                    .await;
            }
            Err(reason) => {
                if reason.is_failure() {
                    log_failure(&reason, "session failed before relaying");
                } else {
                    tracing::info!(reason = %reason, "client left before upstream connected");
                }
                self.lifecycle.begin_closing(reason);
            }
        }

        self.teardown(flows, parts, subscription_id, started).await
    }

    /// `Relaying` state: runs until the first flow ends.
    async fn relay(
        &mut self,
        connection: UpstreamConnection,
        subscription_id: SubscriptionId,
        flows: &mut JoinSet<FlowOutcome>,
        parts: &mut Parts,
    ) {
        let (Some(subscription), Some(client)) = (parts.subscription.take(), parts.client.take())
        else {
            self.lifecycle.begin_closing(RelayError::Internal(
                "session resources missing before relay".to_string(),
            ));
            return;
        };
        if let Err(e) = self.lifecycle.advance(SessionState::Relaying) {
            self.lifecycle.begin_closing(e);
            return;
        }

        let (sender, receiver) = connection.into_split();
        let outbound = outbound_flow(subscription, sender, self.cancel.clone(), self.metrics.clone());
        let downstream = downstream_flow(receiver, client, self.cancel.clone(), self.metrics.clone());
        flows.spawn(outbound.in_current_span());
        flows.spawn(downstream.in_current_span());

        let reason = match flows.join_next().await {
            Some(joined) => parts.absorb(joined).unwrap_or_else(|| {
                RelayError::Internal("relay flow stopped without a reason".to_string())
            }),
            None => RelayError::Internal("no relay flows running".to_string()),
        };
        if reason.is_failure() {
            log_failure(&reason, "relay ended with failure");
        } else {
            tracing::debug!(reason = %reason, "relay ended");
        }

        let client_left = reason == RelayError::ClientDisconnected;
        self.lifecycle.begin_closing(reason);
        if client_left {
            self.drain(subscription_id, flows, parts).await;
        }
    }

    /// Lets the outbound flow flush frames the client sent before leaving.
    async fn drain(
        &self,
        subscription_id: SubscriptionId,
        flows: &mut JoinSet<FlowOutcome>,
        parts: &mut Parts,
    ) {
        // With the registration gone the queue ends once it is empty.
        self.broker.unsubscribe(subscription_id);

        let deadline = tokio::time::sleep(self.drain_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = flows.join_next() => {
                    let Some(joined) = joined else { break };
                    let outbound_done = matches!(joined, Ok(FlowOutcome::Outbound { .. }));
                    if let Some(reason) = parts.absorb(joined) {
                        tracing::debug!(reason = %reason, "flow ended while draining");
                    }
                    if outbound_done {
                        break;
                    }
                }
                () = &mut deadline => {
                    tracing::debug!(timeout = ?self.drain_timeout, "drain timed out");
                    break;
                }
            }
        }
    }

    /// `Closing` → `Closed`: cancel and join every flow, then release the
    /// subscription, the upstream and the client.
    async fn teardown(
        mut self,
        mut flows: JoinSet<FlowOutcome>,
        mut parts: Parts,
        subscription_id: SubscriptionId,
        started: Instant,
    ) -> SessionReport {
        if self.lifecycle.state() != SessionState::Closing {
            self.lifecycle.begin_closing(RelayError::Internal(
                "session ended without a recorded reason".to_string(),
            ));
        }

        self.cancel.cancel();
        while let Some(joined) = flows.join_next().await {
            if let Some(reason) = parts.absorb(joined) {
                tracing::trace!(reason = %reason, "flow ended during teardown");
            }
        }

        if let Some(mut subscription) = parts.subscription.take() {
            subscription.close();
            parts.discarded += subscription.discard_pending();
        }
        self.broker.unsubscribe(subscription_id);

        parts.discarded +=
            close_upstream(parts.upstream.take(), parts.upstream_receiver.take()).await;
        self.metrics.frames_discarded(parts.discarded);

        let reason = self.lifecycle.reason().cloned();
        if let Some(client) = parts.client.take() {
            close_client(client, reason.as_ref()).await;
        }

        if let Err(e) = self.lifecycle.advance(SessionState::Closed) {
            tracing::error!(error = %e, "session did not reach closed state");
        }

        let duration = started.elapsed();
        let failed = reason.as_ref().is_some_and(RelayError::is_failure);
        self.metrics.session_closed(duration, failed);
        tracing::info!(
            reason = reason.as_ref().map(tracing::field::display),
            relayed_upstream = parts.relayed_upstream,
            relayed_downstream = parts.relayed_downstream,
            discarded = parts.discarded,
            duration_ms = duration.as_millis() as u64,
            "session closed"
        );

        SessionReport {
            session_id: self.id,
            state: self.lifecycle.state(),
            reason,
            relayed_upstream: parts.relayed_upstream,
            relayed_downstream: parts.relayed_downstream,
            discarded: parts.discarded,
            duration,
        }
    }
}

/// Reads client frames and publishes them on the session's topic.
async fn inbound_flow(
    mut client: ClientStream,
    broker: Broker,
    topic: SessionId,
    cancel: CancellationToken,
    metrics: RelayMetrics,
) -> FlowOutcome {
    let mut dropped = 0;
    let exit = loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break FlowExit::Cancelled,
            message = client.next() => message,
        };
        let frame = match message {
            Some(Ok(Message::Text(text))) => Frame::from(text.as_str().to_owned()),
            Some(Ok(Message::Binary(data))) => Frame::from(data),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                break FlowExit::Ended(RelayError::ClientDisconnected);
            }
            Some(Err(e)) => break FlowExit::Ended(RelayError::ClientTransport(e.to_string())),
        };
        metrics.frame_received(Direction::Upstream, frame.len());
        tracing::trace!(bytes = frame.len(), "client frame");

        tokio::select! {
            () = cancel.cancelled() => {
                dropped += 1;
                break FlowExit::Cancelled;
            }
            delivered = broker.publish(topic, frame) => {
                if delivered == 0 {
                    dropped += 1;
                    tracing::debug!("client frame arrived after unsubscribe");
                }
            }
        }
    };

    FlowOutcome::Inbound { exit, dropped }
}

/// Sends frames from the subscription to the upstream, in order.
async fn outbound_flow(
    mut subscription: Subscription,
    mut sender: UpstreamSender,
    cancel: CancellationToken,
    metrics: RelayMetrics,
) -> FlowOutcome {
    let mut relayed = 0;
    let mut dropped = 0;
    let exit = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break FlowExit::Cancelled,
            next = subscription.recv() => next,
        };
        let Some(frame) = next else {
            break FlowExit::Drained;
        };

        tokio::select! {
            () = cancel.cancelled() => {
                dropped += 1;
                break FlowExit::Cancelled;
            }
            result = sender.send(frame) => match result {
                Ok(()) => {
                    relayed += 1;
                    metrics.frame_relayed(Direction::Upstream);
                }
                Err(e) => {
                    dropped += 1;
                    break FlowExit::Ended(e);
                }
            },
        }
    };

    FlowOutcome::Outbound {
        subscription,
        sender,
        exit,
        relayed,
        dropped,
    }
}

/// Writes upstream frames to the client as they arrive.
async fn downstream_flow(
    mut receiver: UpstreamReceiver,
    mut client: ClientSink,
    cancel: CancellationToken,
    metrics: RelayMetrics,
) -> FlowOutcome {
    let mut relayed = 0;
    let exit = loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break FlowExit::Cancelled,
            next = receiver.receive() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break FlowExit::Ended(e),
            None => break FlowExit::Ended(RelayError::UpstreamClosed),
        };
        metrics.frame_received(Direction::Downstream, frame.len());
        tracing::trace!(bytes = frame.len(), "upstream frame");

        let message = match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(data) => Message::binary(data),
        };
        tokio::select! {
            () = cancel.cancelled() => break FlowExit::Cancelled,
            result = client.send(message) => match result {
                Ok(()) => {
                    relayed += 1;
                    metrics.frame_relayed(Direction::Downstream);
                }
                Err(_) => break FlowExit::Ended(RelayError::ClientDisconnected),
            },
        }
    };

    FlowOutcome::Downstream {
        sink: client,
        receiver,
        exit,
        relayed,
    }
}

/// Sends a close frame upstream and reads until the upstream answers it,
/// bounded by [`CLOSE_TIMEOUT`]. The connection is dropped only afterwards,
/// so the upstream can finish the frames it already received.
///
/// Returns how many upstream frames arrived with no client left to take
/// them.
async fn close_upstream(
    sender: Option<UpstreamSender>,
    receiver: Option<UpstreamReceiver>,
) -> usize {
    let mut unread = 0;
    let close = async {
        if let Some(mut sender) = sender {
            sender.close().await;
        }
        if let Some(mut receiver) = receiver {
            while let Some(Ok(_)) = receiver.receive().await {
                unread += 1;
            }
        }
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        tracing::debug!("upstream close handshake timed out");
    }
    unread
}

/// Client-side failures log at `warn`, upstream and internal ones at `error`.
fn log_failure(reason: &RelayError, message: &str) {
    match reason {
        RelayError::ClientTransport(_) | RelayError::ClientDisconnected => {
            tracing::warn!(error = %reason, "{message}");
        }
        _ => tracing::error!(error = %reason, "{message}"),
    }
}

/// Sends a close frame describing `reason` and closes the client sink.
async fn close_client(mut client: ClientSink, reason: Option<&RelayError>) {
    let close = async {
        if let Some(reason) = reason
            && *reason != RelayError::ClientDisconnected
        {
            let frame = CloseFrame {
                code: reason.close_code(),
                reason: Utf8Bytes::from(truncate_reason(&reason.to_string())),
            };
            let _ = client.send(Message::Close(Some(frame))).await;
        }
        let _ = client.close().await;
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        tracing::debug!("client close timed out");
    }
}

/// Cuts `text` to fit a close frame without splitting a character.
fn truncate_reason(text: &str) -> String {
    text.char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= MAX_CLOSE_REASON)
        .map(|(_, c)| c)
        .collect()
}
