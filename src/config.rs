//! Relay configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). [`RelayConfig::from_lookup`] accepts
//! any key lookup so the parsing rules can be exercised without touching
//! the process environment.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderValue;
use url::Url;

use crate::error::RelayError;

/// Default upstream host used when neither `UPSTREAM_URL` nor
/// `HEADSCALE_URL` is set.
pub const DEFAULT_UPSTREAM_HOST: &str = "controlplane.tailscale.com";

/// Default path of the control handshake endpoint.
pub const DEFAULT_RELAY_PATH: &str = "/ts2021";

/// `Upgrade` header value the control server expects.
pub const DEFAULT_UPGRADE_TOKEN: &str = "tailscale-control-protocol";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-field lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Top-level relay configuration.
///
/// Loaded once at startup via [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:5000`).
    pub listen_addr: SocketAddr,

    /// Base URL of the upstream control server (`http` or `https`).
    pub upstream_url: Url,

    /// Path of the relayed endpoint, both locally and upstream.
    pub relay_path: String,

    /// Value written into the `Upgrade` header before forwarding.
    /// `None` forwards the header untouched.
    pub upgrade_token: Option<HeaderValue>,

    /// Serve the informational page on plain `GET` instead of redirecting.
    pub debug: bool,

    /// Capacity of each session's broker subscription queue.
    pub subscription_capacity: usize,

    /// Deadline for opening the upstream WebSocket.
    pub upstream_connect_timeout: Duration,

    /// Deadline for one forwarded HTTP request.
    pub request_timeout: Duration,

    /// How long a closing session may spend flushing frames the client
    /// sent before it disconnected.
    pub drain_timeout: Duration,

    /// Log output format.
    pub log_format: LogFormat,
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] if a variable is set to a value
    /// that cannot be used (see [`RelayConfig::from_lookup`]).
    pub fn from_env() -> Result<Self, RelayError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    ///
    /// Falls back to defaults when a key is missing. Numeric values that
    /// fail to parse also fall back to their default.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] if `LISTEN_ADDR` is not a socket
    /// address, the upstream URL does not parse or has a scheme other than
    /// `http`/`https`, `RELAY_PATH` does not start with `/`,
    /// `UPGRADE_TOKEN` is not a valid header value, or
    /// `SUBSCRIPTION_CAPACITY` is zero.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:5000".to_string())
            .parse()
            .map_err(|e| RelayError::InvalidConfig(format!("LISTEN_ADDR: {e}")))?;

        let upstream_url = match lookup("UPSTREAM_URL") {
            Some(url) => url,
            None => {
                let host =
                    lookup("HEADSCALE_URL").unwrap_or_else(|| DEFAULT_UPSTREAM_HOST.to_string());
                format!("http://{host}:80")
            }
        };
        let upstream_url = parse_upstream_url(&upstream_url)?;

        let relay_path = lookup("RELAY_PATH").unwrap_or_else(|| DEFAULT_RELAY_PATH.to_string());
        if !relay_path.starts_with('/') || relay_path.len() < 2 {
            return Err(RelayError::InvalidConfig(format!(
                "RELAY_PATH must start with '/' and name a path, got {relay_path:?}"
            )));
        }

        let upgrade_token =
            match lookup("UPGRADE_TOKEN").unwrap_or_else(|| DEFAULT_UPGRADE_TOKEN.to_string()) {
                token if token.is_empty() => None,
                token => Some(HeaderValue::from_str(&token).map_err(|e| {
                    RelayError::InvalidConfig(format!("UPGRADE_TOKEN: {e}"))
                })?),
            };

        let subscription_capacity = parse_value(&lookup, "SUBSCRIPTION_CAPACITY", 256);
        if subscription_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "SUBSCRIPTION_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") | Some("JSON") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            listen_addr,
            upstream_url,
            relay_path,
            upgrade_token,
            debug: parse_bool(&lookup, "DEBUG", false),
            subscription_capacity,
            upstream_connect_timeout: Duration::from_secs(parse_value(
                &lookup,
                "UPSTREAM_CONNECT_TIMEOUT_SECS",
                10,
            )),
            request_timeout: Duration::from_secs(parse_value(&lookup, "REQUEST_TIMEOUT_SECS", 30)),
            drain_timeout: Duration::from_millis(parse_value(&lookup, "DRAIN_TIMEOUT_MS", 2_000)),
            log_format,
        })
    }

    /// Returns a configuration pointing at `upstream_url` with every other
    /// setting at its default.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] if `upstream_url` is not a
    /// valid `http`/`https` URL.
    pub fn with_upstream(upstream_url: &str) -> Result<Self, RelayError> {
        let upstream_url = upstream_url.to_string();
        Self::from_lookup(move |key| (key == "UPSTREAM_URL").then(|| upstream_url.clone()))
    }

    /// Full URL of the upstream HTTP endpoint (`{upstream}{relay_path}`).
    ///
    /// A base path in the upstream URL is kept: `http://h/control` with
    /// relay path `/ts2021` gives `http://h/control/ts2021`.
    #[must_use]
    pub fn upstream_http_url(&self) -> Url {
        let mut url = self.upstream_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}{}", self.relay_path));
        url
    }

    /// Full URL of the upstream WebSocket endpoint.
    ///
    /// Same as [`Self::upstream_http_url`] with `http` mapped to `ws` and
    /// `https` mapped to `wss`.
    #[must_use]
    pub fn upstream_ws_url(&self) -> Url {
        let mut url = self.upstream_http_url();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) -> ws(s) is an allowed special-scheme change.
        let _ = url.set_scheme(scheme);
        url
    }
}

/// Parses and validates the upstream base URL.
fn parse_upstream_url(raw: &str) -> Result<Url, RelayError> {
    let url = Url::parse(raw).map_err(|e| RelayError::InvalidConfig(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        scheme => Err(RelayError::InvalidConfig(format!(
            "upstream URL must be http(s) with a host, got scheme {scheme:?} in {raw}"
        ))),
    }
}

/// Parses a lookup value as `T`, returning `default` on missing or invalid
/// values.
fn parse_value<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses a lookup value as a boolean. Accepts `"true"`, `"1"`, `"t"`,
/// `"false"`, `"0"`, `"f"` (case-insensitive). Returns `default` otherwise.
fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true") | Some("1") | Some("t") => true,
        Some("false") | Some("0") | Some("f") => false,
        _ => default,
    }
}
