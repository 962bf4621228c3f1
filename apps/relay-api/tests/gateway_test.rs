mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use relay_api::gateway::registry::SubscriptionKey;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(ws_addr: SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{ws_addr}/"))
        .await
        .expect("ws connect");
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Read the next text frame as JSON, failing after a timeout.
async fn recv_json(ws: &mut WsStream) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Assert no text frame arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    match tokio::time::timeout(Duration::from_millis(200), ws.next()).await {
        Err(_) => {}
        Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {text}"),
        Ok(_) => {}
    }
}

async fn publish(http_addr: SocketAddr, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{http_addr}/"))
        .json(&body)
        .send()
        .await
        .expect("publish request")
}

#[tokio::test]
async fn closed_subscriber_stops_receiving() {
    let (http_addr, ws_addr, state) = common::start_servers().await;
    let key = SubscriptionKey::new("app1", "updated", "room1");
    let subscribe = json!({ "appKey": "app1", "event": "updated", "channel": "room1" });

    let mut a = connect(ws_addr).await;
    let mut b = connect(ws_addr).await;
    send_json(&mut a, subscribe.clone()).await;
    send_json(&mut b, subscribe).await;
    common::wait_for_subscribers(&state, &key, 2).await;

    let resp = publish(
        http_addr,
        json!({ "appKey": "app1", "channel": "room1", "event": "updated", "data": { "msg": "hi" } }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert!(resp.text().await.unwrap().is_empty());

    let expected = json!({ "event": "updated", "channel": "room1", "data": { "msg": "hi" } });
    assert_eq!(recv_json(&mut a).await, expected);
    assert_eq!(recv_json(&mut b).await, expected);

    a.close(None).await.unwrap();
    common::wait_for_subscribers(&state, &key, 1).await;

    let resp = publish(
        http_addr,
        json!({ "appKey": "app1", "channel": "room1", "event": "updated", "data": { "msg": "again" } }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let frame = recv_json(&mut b).await;
    assert_eq!(frame["data"], json!({ "msg": "again" }));
    assert_eq!(state.lifecycle.connection_count(), 1);
}

#[tokio::test]
async fn invalid_subscribe_gets_error_frame_and_stays_open() {
    let (http_addr, ws_addr, state) = common::start_servers().await;
    let mut ws = connect(ws_addr).await;

    send_json(&mut ws, json!({ "appKey": "app1", "channel": "room1" })).await;
    assert_eq!(recv_json(&mut ws).await, json!({ "error": "\"event\" is required" }));

    ws.send(Message::Text("{not json".into())).await.unwrap();
    assert_eq!(recv_json(&mut ws).await, json!({ "error": "Invalid message format" }));

    // Same socket can still subscribe and receive.
    send_json(&mut ws, json!({ "appKey": "app1", "event": "e", "channel": "room1" })).await;
    let key = SubscriptionKey::new("app1", "e", "room1");
    common::wait_for_subscribers(&state, &key, 1).await;

    publish(
        http_addr,
        json!({ "appKey": "app1", "channel": "room1", "event": "e", "data": 5 }),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["data"], 5);
}

#[tokio::test]
async fn channel_array_fans_out_once_per_channel() {
    let (http_addr, ws_addr, state) = common::start_servers().await;
    let mut ws = connect(ws_addr).await;

    for channel in ["c1", "c2"] {
        send_json(&mut ws, json!({ "appKey": "app1", "event": "e", "channel": channel })).await;
    }
    common::wait_for_subscribers(&state, &SubscriptionKey::new("app1", "e", "c2"), 1).await;
    common::wait_for_subscribers(&state, &SubscriptionKey::new("app1", "e", "c1"), 1).await;

    publish(
        http_addr,
        json!({ "appKey": "app1", "channel": ["c1", "c2", "c3"], "event": "e", "data": {} }),
    )
    .await;

    let mut channels = vec![
        recv_json(&mut ws).await["channel"].as_str().unwrap().to_string(),
        recv_json(&mut ws).await["channel"].as_str().unwrap().to_string(),
    ];
    channels.sort();
    assert_eq!(channels, vec!["c1", "c2"]);
    assert_silent(&mut ws).await;
}

#[tokio::test]
async fn event_separators_normalize_on_both_sides() {
    let (http_addr, ws_addr, state) = common::start_servers().await;
    let mut ws = connect(ws_addr).await;

    send_json(
        &mut ws,
        json!({ "appKey": "app1", "event": "App\\Events\\OrderShipped", "channel": "orders" }),
    )
    .await;
    let key = SubscriptionKey::new("app1", "App.Events.OrderShipped", "orders");
    common::wait_for_subscribers(&state, &key, 1).await;

    publish(
        http_addr,
        json!({
            "appKey": "app1",
            "channel": "orders",
            "event": "App//Events/OrderShipped",
            "data": { "id": 1, "socket": "abc" },
        }),
    )
    .await;

    assert_eq!(
        recv_json(&mut ws).await,
        json!({
            "event": "App.Events.OrderShipped",
            "channel": "orders",
            "data": { "id": 1 },
            "socket": "abc",
        })
    );
}

#[tokio::test]
async fn other_app_keys_are_isolated() {
    let (http_addr, ws_addr, state) = common::start_servers().await;
    let mut ws = connect(ws_addr).await;

    send_json(&mut ws, json!({ "appKey": "app1", "event": "e", "channel": "room1" })).await;
    common::wait_for_subscribers(&state, &SubscriptionKey::new("app1", "e", "room1"), 1).await;

    publish(
        http_addr,
        json!({ "appKey": "app2", "channel": "room1", "event": "e", "data": {} }),
    )
    .await;
    assert_silent(&mut ws).await;
}

#[tokio::test]
async fn shutdown_closes_subscribers_normally() {
    let (_http_addr, ws_addr, state) = common::start_servers().await;
    let mut ws = connect(ws_addr).await;

    send_json(&mut ws, json!({ "appKey": "app1", "event": "e", "channel": "room1" })).await;
    common::wait_for_subscribers(&state, &SubscriptionKey::new("app1", "e", "room1"), 1).await;

    state.lifecycle.shutdown().await;

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("ws error");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1000);
            assert_eq!(frame.reason.as_str(), "Server shutting down");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn handshake_negotiates_no_extensions() {
    let (_http_addr, ws_addr, _state) = common::start_servers().await;

    let (_ws, response) = tokio_tungstenite::connect_async(format!("ws://{ws_addr}/any/path"))
        .await
        .expect("ws connect");

    assert_eq!(response.status(), 101);
    assert!(response.headers().get("sec-websocket-extensions").is_none());
}
