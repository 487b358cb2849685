//! Device authentication endpoints
//!
//! - POST /device/register - Register a device and its public key
//! - POST /device/auth/request - Issue a challenge
//! - POST /device/auth/verify - Verify a signed challenge
//! - POST /device/rotate-key - Replace the public key, signed by the current one

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};

use super::{ApiState, error_response, internal_error};
use crate::Error;
use crate::security::{ChallengeIssue, Registration, Rotation, Verification};

/// Build device router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/auth/request", post(request_challenge))
        .route("/auth/verify", post(verify_challenge))
        .route("/rotate-key", post(rotate_key))
        .with_state(state)
}

// === Request/Response types ===

/// Request body for registration
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default, alias = "deviceId")]
    pub device_id: Option<String>,
    #[serde(default, alias = "publicKey")]
    pub public_key: Option<String>,
}

/// Request body for a challenge
#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    #[serde(default, alias = "deviceId")]
    pub device_id: Option<String>,
}

/// Request body for verification
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default, alias = "deviceId")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Request body for key rotation
#[derive(Debug, Deserialize)]
pub struct RotateKeyRequest {
    #[serde(default, alias = "deviceId")]
    pub device_id: Option<String>,
    #[serde(default, alias = "newPublicKey")]
    pub new_public_key: Option<String>,
    #[serde(default, alias = "signatureOfNewKey", alias = "signatureOverNewKey")]
    pub signature_of_new_key: Option<String>,
}

/// Response for registration
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: &'static str,
    pub device_id: String,
    pub key_version: i64,
}

/// Response for a challenge
#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    pub challenge: String,
    /// Seconds until the challenge expires
    pub expires_in: u64,
}

/// Response for verification
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub message: &'static str,
    pub device_id: String,
    pub key_version: i64,
}

/// Response for key rotation
#[derive(Debug, Serialize)]
pub struct RotateKeyResponse {
    pub message: &'static str,
    pub key_version: i64,
}

// === Handlers ===

/// Register a new device
async fn register(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let body = match parse(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let (Some(device_id), Some(public_key)) =
        (present(body.device_id.as_ref()), present(body.public_key.as_ref()))
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing device_id or public_key");
    };

    match state.authenticator.register(device_id, public_key).await {
        Ok(Registration::Created(device)) => (
            StatusCode::CREATED,
            Json(RegisterResponse {
                message: "Device registered successfully",
                device_id: device.device_id,
                key_version: device.key_version,
            }),
        )
            .into_response(),
        Ok(Registration::Conflict) => {
            error_response(StatusCode::CONFLICT, "Device with this ID already exists")
        }
        Err(Error::Validation(reason)) => {
            error_response(StatusCode::BAD_REQUEST, &format!("Invalid public_key: {reason}"))
        }
        Err(e) => internal_error(&e),
    }
}

/// Issue a challenge for a device
async fn request_challenge(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ChallengeRequest>, JsonRejection>,
) -> Response {
    let body = match parse(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Some(device_id) = present(body.device_id.as_ref()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing device_id");
    };

    match state.authenticator.issue_challenge(device_id).await {
        Ok(ChallengeIssue::Issued(challenge)) => Json(ChallengeResponse {
            challenge: challenge.value,
            expires_in: state.authenticator.challenge_ttl().as_secs(),
        })
        .into_response(),
        Ok(ChallengeIssue::UnknownDevice) => {
            error_response(StatusCode::NOT_FOUND, "Device not found")
        }
        Err(e) => internal_error(&e),
    }
}

/// Verify a signed challenge
async fn verify_challenge(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response {
    let body = match parse(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let (Some(device_id), Some(signature)) =
        (present(body.device_id.as_ref()), present(body.signature.as_ref()))
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing device_id or signature");
    };

    match state.authenticator.verify_challenge(device_id, signature).await {
        Ok(Verification::Verified(device)) => Json(VerifyResponse {
            message: "Authentication successful",
            device_id: device.device_id,
            key_version: device.key_version,
        })
        .into_response(),
        Ok(Verification::Expired) => error_response(
            StatusCode::UNAUTHORIZED,
            "Invalid signature or challenge expired",
        ),
        Ok(Verification::Unverified) => {
            error_response(StatusCode::UNAUTHORIZED, "Invalid signature")
        }
        Ok(Verification::UnknownDevice) => unknown_device(&state),
        Err(e) => internal_error(&e),
    }
}

/// Rotate a device's public key
async fn rotate_key(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<RotateKeyRequest>, JsonRejection>,
) -> Response {
    let body = match parse(body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let (Some(device_id), Some(new_public_key), Some(signature)) = (
        present(body.device_id.as_ref()),
        present(body.new_public_key.as_ref()),
        present(body.signature_of_new_key.as_ref()),
    ) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing device_id, new_public_key, or signature_of_new_key",
        );
    };

    match state
        .authenticator
        .rotate_key(device_id, new_public_key, signature)
        .await
    {
        Ok(Rotation::Rotated { key_version }) => Json(RotateKeyResponse {
            message: "Key rotated successfully",
            key_version,
        })
        .into_response(),
        Ok(Rotation::Unverified) => error_response(StatusCode::UNAUTHORIZED, "Invalid signature"),
        Ok(Rotation::UnknownDevice) => unknown_device(&state),
        Err(Error::Validation(reason)) => {
            error_response(StatusCode::BAD_REQUEST, &format!("Invalid new_public_key: {reason}"))
        }
        Err(e) => internal_error(&e),
    }
}

// === Helpers ===

fn parse<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    body.map(|Json(body)| body)
        .map_err(|rejection| error_response(StatusCode::BAD_REQUEST, &rejection.body_text()))
}

/// Empty strings count as missing
fn present(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.is_empty())
}

fn unknown_device(state: &ApiState) -> Response {
    if state.conceal_unknown_devices {
        error_response(StatusCode::UNAUTHORIZED, "Invalid signature")
    } else {
        error_response(StatusCode::NOT_FOUND, "Device not found")
    }
}
