pub mod broadcast;
pub mod health;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::config::Config;
use crate::AppState;

/// Router for the publisher (HTTP) listener.
pub fn router(config: &Config) -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(broadcast::router())
        .route("/openapi.json", get(openapi_json))
        .layer(DefaultBodyLimit::max(config.max_payload_bytes()))
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Broadcast
        broadcast::publish,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            // Route request/response types
            health::HealthResponse,
            broadcast::PublishBody,
        )
    ),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Broadcast", description = "Publish to subscribed connections"),
    )
)]
pub struct ApiDoc;
