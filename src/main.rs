//! tailrelay server entry point.
//!
//! Loads configuration, starts the metrics upkeep task and serves the relay
//! until Ctrl-C or SIGTERM.

use std::time::Duration;

use anyhow::Context;
use uuid::Uuid;

use tailrelay::app_state::AppState;
use tailrelay::config::RelayConfig;
use tailrelay::observability::{RelayMetrics, init_tracing};
use tailrelay::server;

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("loading configuration")?;
    init_tracing(config.log_format);

    let run_id = Uuid::new_v4().to_string();
    let metrics = RelayMetrics::new(&run_id);
    tracing::info!(
        run_id = %run_id,
        addr = %config.listen_addr,
        upstream = %config.upstream_url,
        relay_path = %config.relay_path,
        debug = config.debug,
        "starting tailrelay"
    );

    let upkeep = metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
        loop {
            interval.tick().await;
            upkeep.run_upkeep();
        }
    });

    let listen_addr = config.listen_addr;
    let state = AppState::new(config, metrics).context("building application state")?;
    tracing::debug!(queue_capacity = state.broker.capacity(), "broker ready");
    let app = server::build_app(state);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "server listening");

    server::serve(listener, app).await.context("serving")?;
    Ok(())
}
