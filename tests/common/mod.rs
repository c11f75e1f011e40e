//! Shared harness for relay integration tests.
//!
//! Starts the real router on an ephemeral port, plus mock upstreams:
//! a WebSocket server that speaks the handshake over raw TCP so it accepts
//! the rewritten `Upgrade` header, and an axum HTTP server that records what
//! it was sent.

#![allow(dead_code, clippy::panic, clippy::indexing_slicing)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::any;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;

use tailrelay::app_state::AppState;
use tailrelay::config::RelayConfig;
use tailrelay::observability::RelayMetrics;
use tailrelay::server::build_app;

/// Relay under test.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: AppState,
}

impl TestRelay {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ts2021", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Waits until every session has finished teardown and no broker
    /// subscription is left, or `within` elapses.
    pub async fn wait_idle(&self, within: Duration) -> bool {
        let idle = || {
            self.state.broker.subscription_count() == 0
                && self.state.metrics.active_sessions() == 0
        };
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if idle() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        idle()
    }

    /// Sum of the series of counter `name` whose labels contain every
    /// entry of `labels` (e.g. `direction="client_to_upstream"`).
    pub fn counter(&self, name: &str, labels: &[&str]) -> f64 {
        let prefix = format!("{name}{{");
        self.state
            .metrics
            .render()
            .lines()
            .filter(|line| line.starts_with(&prefix))
            .filter(|line| labels.iter().all(|label| line.contains(label)))
            .filter_map(|line| line.rsplit(' ').next()?.parse::<f64>().ok())
            .sum()
    }
}

/// Starts the relay against `upstream` (an `http://host:port` base URL).
pub async fn spawn_relay(upstream: &str, tweak: impl FnOnce(&mut RelayConfig)) -> TestRelay {
    let Ok(mut config) = RelayConfig::with_upstream(upstream) else {
        panic!("valid upstream url: {upstream}");
    };
    config.drain_timeout = Duration::from_millis(500);
    config.upstream_connect_timeout = Duration::from_secs(2);
    tweak(&mut config);

    let Ok(state) = AppState::new(config, RelayMetrics::new("e2e-run")) else {
        panic!("state should build");
    };
    let app = build_app(state.clone());

    let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local addr");
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestRelay { addr, state }
}

/// Address nobody listens on.
pub async fn closed_port() -> SocketAddr {
    let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local addr");
    };
    drop(listener);
    addr
}

/// Behaviour of the mock WebSocket upstream after the handshake.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamMode {
    /// Sends every data frame back.
    Echo,
    /// Sends a close frame right away.
    CloseImmediately,
    /// Accepts TCP but never answers the handshake.
    Silent,
    /// Completes the handshake, never reads, and closes after the delay.
    CloseUnread(Duration),
}

/// What the mock WebSocket upstream observed.
#[derive(Debug, Default)]
pub struct UpstreamLog {
    pub upgrades: Vec<String>,
    pub frames: Vec<Message>,
    pub closed: usize,
}

pub struct WsUpstream {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<UpstreamLog>>,
}

impl WsUpstream {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn upgrades(&self) -> Vec<String> {
        self.lock().upgrades.clone()
    }

    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    /// Text payloads received so far, in arrival order.
    pub fn texts(&self) -> Vec<String> {
        self.lock()
            .frames
            .iter()
            .filter_map(|message| match message {
                Message::Text(text) => Some(text.as_str().to_owned()),
                _ => None,
            })
            .collect()
    }

    /// Waits until `count` connections have finished, or `within` elapses.
    pub async fn wait_closed(&self, count: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.closed() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.closed() >= count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UpstreamLog> {
        self.log.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

pub async fn spawn_ws_upstream(mode: UpstreamMode) -> WsUpstream {
    let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local addr");
    };
    let log = Arc::new(Mutex::new(UpstreamLog::default()));

    let shared = Arc::clone(&log);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = Arc::clone(&shared);
            tokio::spawn(serve_ws(stream, mode, log));
        }
    });
    WsUpstream { addr, log }
}

async fn serve_ws(mut stream: TcpStream, mode: UpstreamMode, log: Arc<Mutex<UpstreamLog>>) {
    let request = read_head(&mut stream).await;
    if matches!(mode, UpstreamMode::Silent) {
        tokio::time::sleep(Duration::from_secs(30)).await;
        return;
    }

    let header = |name: &str| {
        request.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    };
    let Some(key) = header("sec-websocket-key") else {
        return;
    };
    if let Some(upgrade) = header("upgrade") {
        log.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .upgrades
            .push(upgrade);
    }

    let reply = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    );
    if stream.write_all(reply.as_bytes()).await.is_err() {
        return;
    }

    let mut ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    match mode {
        UpstreamMode::CloseImmediately => {
            let _ = ws.close(None).await;
        }
        UpstreamMode::CloseUnread(delay) => {
            tokio::time::sleep(delay).await;
            let _ = ws.close(None).await;
            log.lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .closed += 1;
            return;
        }
        UpstreamMode::Echo | UpstreamMode::Silent => {}
    }
    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                log.lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .frames
                    .push(message.clone());
                if ws.send(message).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => {
                // Flushes the close reply.
                let _ = ws.close(None).await;
                break;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }
    log.lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .closed += 1;
}

/// Reads up to the end of the HTTP request head.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// One request seen by the mock HTTP upstream.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

pub struct HttpUpstream {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl HttpUpstream {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// Mock control server that records requests and answers with a fixed
/// status, header and body.
pub async fn spawn_http_upstream() -> HttpUpstream {
    async fn record(
        State(requests): State<Arc<Mutex<Vec<RecordedRequest>>>>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
        body: Bytes,
    ) -> impl IntoResponse {
        requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(RecordedRequest {
                headers,
                query,
                body,
            });
        (StatusCode::ACCEPTED, [("x-upstream", "mock")], "upstream says hi")
    }

    let requests = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/ts2021", any(record))
        .with_state(Arc::clone(&requests));

    let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local addr");
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    HttpUpstream { addr, requests }
}

/// HTTP client that neither follows redirects nor uses proxies.
pub fn http_client() -> reqwest::Client {
    let Ok(client) = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
    else {
        panic!("client should build");
    };
    client
}
