//! Bearer key authentication for internal endpoints

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use super::{ApiState, error_response};
use crate::security::constant_time_eq;

/// Extract API key from Authorization header
fn extract_api_key(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Middleware requiring the internal API key
///
/// Internal routes are only mounted when a key is configured, so a missing
/// key here rejects everything.
pub async fn require_internal_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.internal_api_key.as_deref() else {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    };

    match extract_api_key(&req) {
        Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => next.run(req).await,
        Some(_) => {
            tracing::warn!("invalid internal API key provided");
            error_response(StatusCode::UNAUTHORIZED, "Unauthorized")
        }
        None => {
            tracing::debug!("no internal API key provided");
            error_response(StatusCode::UNAUTHORIZED, "Unauthorized")
        }
    }
}
