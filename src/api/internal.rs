//! Internal endpoints for other services
//!
//! - POST /internal/devices/{device_id}/messages - push a JSON message to a device

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde::Serialize;

use super::ApiState;

/// Response for a publish
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    /// Live connections the message reached
    pub delivered: usize,
}

/// Build internal router (bearer key required)
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/devices/{device_id}/messages", post(publish_message))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            super::auth::require_internal_key,
        ))
        .with_state(state)
}

/// Publish the request body verbatim to the device's channel
async fn publish_message(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
    Json(message): Json<serde_json::Value>,
) -> impl IntoResponse {
    let delivered = state.relay.publish(&device_id, message.to_string()).await;
    (StatusCode::ACCEPTED, Json(PublishResponse { delivered }))
}
