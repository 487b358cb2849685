//! Pairing API endpoints
//!
//! Per configured provider:
//! - GET /pair/{provider}/start - Mint a pairing token
//! - GET /pair/{provider}/auth/{token} - Mark visited and redirect to the provider
//! - GET /pair/{provider}/sse/{token} - Event stream for the waiting client
//! - GET /pair/{provider}/callback - Provider redirect target; exchanges the code

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::get,
};
use futures::StreamExt;
use serde::Deserialize;

use super::{ApiState, error_response, internal_error};
use crate::Error;
use crate::pairing::{AUTHORIZATION_FAILED, CompletionClaim, PairingEvent, ProviderConfig};

/// Build pairing router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/{provider}/start", get(start))
        .route("/{provider}/auth/{token}", get(visit))
        .route("/{provider}/sse/{token}", get(events))
        .route("/{provider}/callback", get(callback))
        .with_state(state)
}

/// Query parameters on the provider callback
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Mint a token for `provider`
async fn start(State(state): State<Arc<ApiState>>, Path(provider): Path<String>) -> Response {
    if !state.providers.contains_key(&provider) {
        return error_response(StatusCode::NOT_FOUND, "Unknown provider");
    }

    let ticket = state.pairing.create_token(&provider, &state.public_url);
    Json(ticket).into_response()
}

/// Mark the token visited and send the browser to the provider
async fn visit(
    State(state): State<Arc<ApiState>>,
    Path((provider, token)): Path<(String, String)>,
) -> Response {
    let config = match provider_for_token(&state, &provider, &token) {
        Ok(config) => config,
        Err(response) => return response,
    };

    let url = match config.authorization_url(&token) {
        Ok(url) => url,
        Err(e) => return internal_error(&e),
    };

    match state.pairing.mark_visited(&token) {
        Ok(visit) => {
            if !visit.first {
                tracing::debug!(provider = %visit.provider, "pairing URL visited again");
            }
            (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response()
        }
        Err(Error::InvalidToken(_)) => error_response(StatusCode::BAD_REQUEST, "Invalid state"),
        Err(e) => internal_error(&e),
    }
}

/// Attach the caller as the token's listener
async fn events(
    State(state): State<Arc<ApiState>>,
    Path((provider, token)): Path<(String, String)>,
) -> Response {
    if let Err(response) = provider_for_token(&state, &provider, &token) {
        return response;
    }

    let listener = match state.pairing.attach_listener(&token) {
        Ok(listener) => listener,
        Err(Error::InvalidToken(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid state");
        }
        Err(Error::Conflict(_)) => {
            return error_response(StatusCode::CONFLICT, "Listener already attached");
        }
        Err(e) => return internal_error(&e),
    };

    let stream = listener
        .into_events(state.pairing_heartbeat)
        .map(|event| Ok::<_, Infallible>(sse_frame(&event)));

    Sse::new(stream).into_response()
}

/// Complete the pairing with the provider's authorization result
async fn callback(
    State(state): State<Arc<ApiState>>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(token) = query.state.as_deref().filter(|s| !s.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid state");
    };
    let config = match provider_for_token(&state, &provider, token) {
        Ok(config) => config,
        Err(response) => return response,
    };

    // Claimed before the exchange so a concurrent callback cannot settle it
    let claim = match state.pairing.begin_completion(token) {
        Ok(claim) => claim,
        Err(Error::InvalidToken(_) | Error::Conflict(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "Invalid state");
        }
        Err(e) => return internal_error(&e),
    };

    if let Some(error) = query.error.as_deref() {
        tracing::warn!(provider = %provider, error, "provider denied authorization");
        return settle_failure(claim, StatusCode::BAD_REQUEST, AUTHORIZATION_FAILED);
    }

    let Some(code) = query.code.as_deref().filter(|s| !s.is_empty()) else {
        return settle_failure(claim, StatusCode::BAD_REQUEST, "Missing code");
    };

    let credentials = match state.token_exchange.exchange(config, code).await {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::error!(provider = %provider, error = %e, "authorization code exchange failed");
            return settle_failure(claim, StatusCode::INTERNAL_SERVER_ERROR, AUTHORIZATION_FAILED);
        }
    };

    match claim.complete(credentials) {
        Ok(()) => (
            StatusCode::OK,
            "Authorization successful. You can close this window.",
        )
            .into_response(),
        Err(Error::InvalidToken(_)) => error_response(StatusCode::BAD_REQUEST, "Invalid state"),
        Err(e) => internal_error(&e),
    }
}

/// Fail the claimed token and answer the callback with `message`
fn settle_failure(claim: CompletionClaim, status: StatusCode, message: &str) -> Response {
    if let Err(e) = claim.fail(AUTHORIZATION_FAILED) {
        // Reaped while the exchange was running
        tracing::debug!(error = %e, "pairing token gone before failure was delivered");
    }
    error_response(status, message)
}

/// Resolve the provider, requiring the token to have been minted for it
fn provider_for_token<'a>(
    state: &'a ApiState,
    provider: &str,
    token: &str,
) -> Result<&'a ProviderConfig, Response> {
    let Some(config) = state.providers.get(provider) else {
        return Err(error_response(StatusCode::NOT_FOUND, "Unknown provider"));
    };

    match state.pairing.provider_of(token) {
        Some(owner) if owner == provider => Ok(config),
        _ => Err(error_response(StatusCode::BAD_REQUEST, "Invalid state")),
    }
}

/// Data-only frame carrying the event as JSON
fn sse_frame(event: &PairingEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to encode pairing event");
        Event::default().data(r#"{"status":"Authorization failed","error":"encoding"}"#)
    })
}
