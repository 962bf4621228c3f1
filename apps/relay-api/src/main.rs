use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::config::Config;
use relay_api::AppState;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Load .env file; env vars may also be set externally
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        allowed = ?config.allowed_ips,
        blacklisted = ?config.blacklisted_ips,
        cleanup_interval_ms = config.cleanup_interval.as_millis() as u64,
        max_inactive_ms = config.max_inactive_time.as_millis() as u64,
        max_payload_mb = config.max_payload_size_mb,
        "relay configured"
    );

    let state = AppState::new(config);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let http_app = relay_api::routes::router(&state.config)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let ws_app = relay_api::gateway::server::router().with_state(state.clone());

    let http_addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], state.config.ws_port));

    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .expect("failed to bind HTTP listener");
    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .expect("failed to bind WebSocket listener");

    tracing::info!(%http_addr, url = %state.config.http_url(), "HTTP server is running");
    tracing::info!(%ws_addr, url = %state.config.ws_url(), "WebSocket server is running");

    let stop = CancellationToken::new();

    let http_server = axum::serve(
        http_listener,
        http_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stop.clone().cancelled_owned())
    .into_future();

    let ws_server = axum::serve(ws_listener, ws_app)
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .into_future();

    let lifecycle = state.lifecycle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutting down gracefully");
        lifecycle.shutdown().await;
        stop.cancel();
    });

    let (http_result, ws_result) = tokio::join!(http_server, ws_server);
    if let Err(err) = http_result {
        tracing::error!(?err, "HTTP server error");
    }
    if let Err(err) = ws_result {
        tracing::error!(?err, "WebSocket server error");
    }

    tracing::info!("relay stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(?err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
