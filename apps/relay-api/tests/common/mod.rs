#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;

use relay_api::config::Config;
use relay_api::gateway::registry::SubscriptionKey;
use relay_api::AppState;

/// Config for tests: wildcard allow-list, no env vars involved.
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ws_port: 0,
        protocol: "http".to_string(),
        allowed_ips: vec!["*".to_string()],
        blacklisted_ips: vec![],
        cleanup_interval: Duration::from_secs(3600),
        max_inactive_time: Duration::from_secs(3600),
        max_payload_size_mb: 1,
    }
}

/// Build an AppState. Must be called inside a Tokio runtime.
pub fn test_state_with(config: Config) -> AppState {
    AppState::new(config)
}

pub fn test_state() -> AppState {
    test_state_with(test_config())
}

/// Build the publisher router wired to the given state.
pub fn test_app_with(state: AppState) -> Router {
    relay_api::routes::router(&state.config).with_state(state)
}

pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    (test_app_with(state.clone()), state)
}

/// Start both listeners on ephemeral ports. Returns (http_addr, ws_addr, state).
pub async fn start_servers() -> (SocketAddr, SocketAddr, AppState) {
    let state = test_state();

    let http_app = relay_api::routes::router(&state.config).with_state(state.clone());
    let ws_app = relay_api::gateway::server::router().with_state(state.clone());

    let http_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind http");
    let ws_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ws");
    let http_addr = http_listener.local_addr().unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            http_listener,
            http_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::spawn(async move {
        axum::serve(ws_listener, ws_app).await.unwrap();
    });

    (http_addr, ws_addr, state)
}

/// Poll until `key` has exactly `count` registered connections.
pub async fn wait_for_subscribers(state: &AppState, key: &SubscriptionKey, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if state.registry.lookup(key).len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {count} subscribers on {key}"));
}
