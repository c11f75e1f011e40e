//! End-to-end tests: real router, real sockets, mock upstreams.

#![allow(clippy::panic, clippy::indexing_slicing)]

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use common::{UpstreamMode, closed_port, http_client, spawn_http_upstream, spawn_relay, spawn_ws_upstream};

const TOKEN: &str = "tailscale-control-protocol";

async fn next_message<S>(ws: &mut S) -> Option<Message>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
        Ok(Some(Ok(message))) => Some(message),
        Ok(_) => None,
        Err(_) => panic!("no message within 5s"),
    }
}

#[tokio::test]
async fn echo_round_trip_preserves_order() {
    let upstream = spawn_ws_upstream(UpstreamMode::Echo).await;
    let relay = spawn_relay(&upstream.base_url(), |_| {}).await;

    let Ok((mut ws, _)) = connect_async(relay.ws_url()).await else {
        panic!("client should connect");
    };
    for text in ["a", "b", "c"] {
        let Ok(()) = ws.send(Message::text(text)).await else {
            panic!("send failed");
        };
    }
    let Ok(()) = ws.send(Message::binary(vec![0_u8, 1, 2])).await else {
        panic!("send failed");
    };

    let mut echoed = Vec::new();
    for _ in 0..4 {
        let Some(message) = next_message(&mut ws).await else {
            panic!("stream ended early");
        };
        echoed.push(message);
    }
    assert_eq!(
        echoed,
        vec![
            Message::text("a"),
            Message::text("b"),
            Message::text("c"),
            Message::binary(vec![0_u8, 1, 2]),
        ]
    );
    assert_eq!(upstream.upgrades(), vec![TOKEN.to_string()]);

    let _ = ws.close(None).await;
    assert!(relay.wait_idle(Duration::from_secs(3)).await);
}

#[tokio::test]
async fn upstream_close_ends_session_promptly() {
    let upstream = spawn_ws_upstream(UpstreamMode::CloseImmediately).await;
    let relay = spawn_relay(&upstream.base_url(), |_| {}).await;

    let Ok((mut ws, _)) = connect_async(relay.ws_url()).await else {
        panic!("client should connect");
    };
    match next_message(&mut ws).await {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 1000),
        Some(Message::Close(None)) | None => {}
        Some(other) => panic!("expected close, got {other:?}"),
    }
    assert!(relay.wait_idle(Duration::from_secs(3)).await);
    assert_eq!(relay.state.broker.topic_count(), 0);
}

#[tokio::test]
async fn frames_sent_before_client_leaves_reach_upstream() {
    let upstream = spawn_ws_upstream(UpstreamMode::Echo).await;
    let relay = spawn_relay(&upstream.base_url(), |_| {}).await;

    let Ok((mut ws, _)) = connect_async(relay.ws_url()).await else {
        panic!("client should connect");
    };
    // One round trip first so the session is relaying before the burst.
    let Ok(()) = ws.send(Message::text("warm-up")).await else {
        panic!("send failed");
    };
    assert_eq!(next_message(&mut ws).await, Some(Message::text("warm-up")));

    let burst: Vec<String> = (0..200).map(|i| format!("frame-{i}")).collect();
    for text in &burst {
        let Ok(()) = ws.send(Message::text(text.as_str())).await else {
            panic!("send failed");
        };
    }
    let _ = ws.close(None).await;
    while let Ok(Some(Ok(_))) = tokio::time::timeout(Duration::from_secs(5), ws.next()).await {}

    assert!(upstream.wait_closed(1, Duration::from_secs(5)).await);
    let mut received = upstream.texts();
    assert_eq!(received.first().map(String::as_str), Some("warm-up"));
    received.remove(0);
    assert_eq!(received, burst);
    assert!(relay.wait_idle(Duration::from_secs(3)).await);
    let to_upstream = relay.counter(
        "relay_ws_messages_relayed_total",
        &["direction=\"client_to_upstream\""],
    );
    assert_eq!(to_upstream, 201.0);
}

#[tokio::test]
async fn frames_queued_when_upstream_closes_are_counted_as_discarded() {
    let upstream = spawn_ws_upstream(UpstreamMode::CloseUnread(Duration::from_millis(500))).await;
    let relay = spawn_relay(&upstream.base_url(), |config| {
        config.subscription_capacity = 4;
    })
    .await;

    let Ok((ws, _)) = connect_async(relay.ws_url()).await else {
        panic!("client should connect");
    };
    let (mut sink, mut stream) = ws.split();
    // Far more than socket buffers hold, so frames pile up in the relay.
    let writer = tokio::spawn(async move {
        let payload = vec![7_u8; 1 << 20];
        for _ in 0..64 {
            if sink.send(Message::binary(payload.clone())).await.is_err() {
                break;
            }
        }
    });

    loop {
        match tokio::time::timeout(Duration::from_secs(10), stream.next()).await {
            Ok(Some(Ok(Message::Close(_))) | None | Some(Err(_))) => break,
            Ok(Some(Ok(_))) => {}
            Err(_) => panic!("relay did not close the client"),
        }
    }
    writer.abort();

    assert!(relay.wait_idle(Duration::from_secs(5)).await);
    assert!(relay.counter("relay_ws_messages_discarded_total", &[]) > 0.0);
}

#[tokio::test]
async fn client_leaving_during_connect_releases_subscription() {
    let upstream = spawn_ws_upstream(UpstreamMode::Silent).await;
    let relay = spawn_relay(&upstream.base_url(), |config| {
        config.upstream_connect_timeout = Duration::from_secs(10);
    })
    .await;

    let Ok((mut ws, _)) = connect_async(relay.ws_url()).await else {
        panic!("client should connect");
    };
    let Ok(()) = ws.send(Message::text("early")).await else {
        panic!("send failed");
    };
    let _ = ws.close(None).await;
    drop(ws);

    // Well under the connect timeout: the session must not wait for it.
    assert!(relay.wait_idle(Duration::from_secs(2)).await);
    let metrics = relay.state.metrics.render();
    assert!(metrics.contains("relay_ws_messages_discarded_total{run_id=\"e2e-run\"} 1"));
    assert_eq!(upstream.closed(), 0);
}

#[tokio::test]
async fn unreachable_upstream_closes_client_with_try_again() {
    let addr = closed_port().await;
    let relay = spawn_relay(&format!("http://{addr}"), |_| {}).await;

    let Ok((mut ws, _)) = connect_async(relay.ws_url()).await else {
        panic!("client should connect");
    };
    match next_message(&mut ws).await {
        Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), 1013),
        other => panic!("expected close 1013, got {other:?}"),
    }
    assert!(relay.wait_idle(Duration::from_secs(3)).await);
    assert!(relay.state.metrics.render().contains("relay_ws_errors_total"));
}

#[tokio::test]
async fn post_is_forwarded_with_rewritten_upgrade() {
    let upstream = spawn_http_upstream().await;
    let relay = spawn_relay(&upstream.base_url(), |_| {}).await;

    let Ok(response) = http_client()
        .post(relay.http_url("/ts2021?X-Tailscale-Handshake=1"))
        .header("upgrade", "websocket")
        .header("x-custom", "kept")
        .body("hello")
        .send()
        .await
    else {
        panic!("request should complete");
    };

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response.headers().get("x-upstream").map(|v| v.as_bytes()),
        Some(b"mock".as_slice())
    );
    let Ok(body) = response.text().await else {
        panic!("body should be readable");
    };
    assert_eq!(body, "upstream says hi");

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    let seen = &requests[0];
    assert_eq!(
        seen.headers.get("upgrade").map(|v| v.as_bytes()),
        Some(TOKEN.as_bytes())
    );
    assert_eq!(
        seen.headers.get("x-custom").map(|v| v.as_bytes()),
        Some(b"kept".as_slice())
    );
    assert_eq!(seen.query.as_deref(), Some("X-Tailscale-Handshake=1"));
    assert_eq!(seen.body.as_ref(), b"hello");
}

#[tokio::test]
async fn post_to_unreachable_upstream_is_bad_gateway() {
    let addr = closed_port().await;
    let relay = spawn_relay(&format!("http://{addr}"), |_| {}).await;

    let Ok(response) = http_client()
        .post(relay.http_url("/ts2021"))
        .body("hello")
        .send()
        .await
    else {
        panic!("request should complete");
    };
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let Ok(text) = response.text().await else {
        panic!("body should be readable");
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) else {
        panic!("error body should be JSON");
    };
    assert_eq!(json["error"]["code"], 2001);
}

#[tokio::test]
async fn plain_get_depends_on_debug_mode() {
    let addr = closed_port().await;
    let debug = spawn_relay(&format!("http://{addr}"), |config| config.debug = true).await;
    let normal = spawn_relay(&format!("http://{addr}"), |config| config.debug = false).await;
    let client = http_client();

    let Ok(response) = client.get(debug.http_url("/ts2021")).send().await else {
        panic!("request should complete");
    };
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);

    let Ok(response) = client.get(normal.http_url("/ts2021")).send().await else {
        panic!("request should complete");
    };
    assert!(response.status().is_redirection());
    assert_eq!(
        response.headers().get("location").map(|v| v.as_bytes()),
        Some(b"/".as_slice())
    );
}

#[tokio::test]
async fn metrics_carry_run_id_after_a_session() {
    let upstream = spawn_ws_upstream(UpstreamMode::Echo).await;
    let relay = spawn_relay(&upstream.base_url(), |_| {}).await;

    let Ok((mut ws, _)) = connect_async(relay.ws_url()).await else {
        panic!("client should connect");
    };
    let Ok(()) = ws.send(Message::text("ping")).await else {
        panic!("send failed");
    };
    let _ = next_message(&mut ws).await;
    let _ = ws.close(None).await;
    assert!(relay.wait_idle(Duration::from_secs(3)).await);

    let Ok(response) = http_client().get(relay.http_url("/metrics")).send().await else {
        panic!("request should complete");
    };
    let Ok(text) = response.text().await else {
        panic!("body should be readable");
    };
    assert!(text.contains("relay_ws_connections_total{run_id=\"e2e-run\"} 1"));
    assert!(text.contains("relay_ws_messages_relayed_total"));
    assert!(text.contains("direction=\"client_to_upstream\""));
}
