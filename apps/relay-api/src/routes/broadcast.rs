//! Publish endpoint: validate, then fan out to subscribers.

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use relay_common::id::{prefix, prefixed_ulid};
use utoipa::ToSchema;

use crate::access::PublisherOrigin;
use crate::error::{ApiError, ApiErrorBody};
use crate::gateway::validator;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(publish))
}

// ---------------------------------------------------------------------------
// POST /
// ---------------------------------------------------------------------------

/// Documented shape of a publish request. The handler validates the raw body
/// itself so that every rejection names the offending field.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishBody {
    #[serde(rename = "appKey")]
    pub app_key: String,
    /// A channel name or an array of channel names.
    #[schema(value_type = Object)]
    pub channel: Value,
    /// Event name; `\` and `/` separators are normalized to `.`.
    pub event: String,
    /// Arbitrary payload. A top-level `socket` field is moved to the envelope.
    #[schema(value_type = Object)]
    pub data: Value,
}

#[utoipa::path(
    post,
    path = "/",
    tag = "Broadcast",
    request_body = PublishBody,
    responses(
        (status = 200, description = "Accepted and dispatched to current subscribers"),
        (status = 400, description = "Validation failed", body = ApiErrorBody),
        (status = 401, description = "Publisher origin rejected", body = ApiErrorBody),
        (status = 413, description = "Payload too large", body = ApiErrorBody),
    ),
)]
pub async fn publish(
    origin: PublisherOrigin,
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, ApiError> {
    let body = body?;
    let request = validator::parse_publish(&body)?;

    let publish_id = prefixed_ulid(prefix::PUBLISH);
    let app_key = request.app_key.clone();
    let event = request.event.clone();
    let report = state.dispatcher.publish(request);

    tracing::debug!(
        %publish_id,
        ip = ?origin.ip,
        %app_key,
        %event,
        channels = report.channels.len(),
        delivered = report.delivered(),
        "publish handled"
    );

    Ok(StatusCode::OK)
}
