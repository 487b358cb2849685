//! WebSocket relay for authenticated devices
//!
//! `GET /ws?deviceId=..&challenge=..&signature=..`. The handshake is checked
//! once after the upgrade; on failure the socket is closed with a policy
//! close frame whose reason says what went wrong.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::oneshot;

use super::ApiState;
use crate::relay::{ConnectionLease, Subscription};
use crate::security::Verification;

/// Handshake parameters
#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    #[serde(default, rename = "deviceId", alias = "device_id")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// Why a connection is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    MissingCredentials,
    DeviceNotFound,
    InvalidSignature,
    ChallengeExpired,
    Internal,
    Superseded,
}

impl CloseReason {
    const fn code(self) -> u16 {
        match self {
            Self::MissingCredentials
            | Self::DeviceNotFound
            | Self::InvalidSignature
            | Self::ChallengeExpired => close_code::POLICY,
            Self::Internal => close_code::ERROR,
            Self::Superseded => close_code::NORMAL,
        }
    }

    const fn text(self) -> &'static str {
        match self {
            Self::MissingCredentials => "Missing credentials",
            Self::DeviceNotFound => "Device not found",
            Self::InvalidSignature => "Invalid signature",
            Self::ChallengeExpired => "Challenge expired",
            Self::Internal => "Internal server error",
            Self::Superseded => "Superseded",
        }
    }

    fn frame(self) -> Message {
        Message::Close(Some(CloseFrame {
            code: self.code(),
            reason: Utf8Bytes::from_static(self.text()),
        }))
    }
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

/// Handle WebSocket connection
async fn handle_socket(mut socket: WebSocket, state: Arc<ApiState>, query: HandshakeQuery) {
    let present = |v: Option<String>| v.filter(|s| !s.is_empty());
    let (Some(device_id), Some(challenge), Some(signature)) = (
        present(query.device_id),
        present(query.challenge),
        present(query.signature),
    ) else {
        tracing::debug!("relay handshake without credentials");
        let _ = socket.send(CloseReason::MissingCredentials.frame()).await;
        return;
    };

    let verification = state
        .authenticator
        .verify_handshake(&device_id, &challenge, &signature, state.handshake)
        .await;

    let rejection = match verification {
        Ok(Verification::Verified(_)) => None,
        Ok(Verification::UnknownDevice) => Some(CloseReason::DeviceNotFound),
        Ok(Verification::Unverified) => Some(CloseReason::InvalidSignature),
        Ok(Verification::Expired) => Some(CloseReason::ChallengeExpired),
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "relay handshake failed");
            Some(CloseReason::Internal)
        }
    };
    if let Some(reason) = rejection {
        tracing::info!(device_id = %device_id, reason = reason.text(), "relay handshake rejected");
        let _ = socket.send(reason.frame()).await;
        return;
    }

    let (lease, subscription) = match state.relay.attach(&device_id).await {
        Ok(attached) => attached,
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "bus subscription failed");
            let _ = socket.send(CloseReason::Internal.frame()).await;
            return;
        }
    };

    let ConnectionLease {
        connection_id,
        superseded,
    } = lease;

    bridge(socket, &device_id, subscription, superseded, state.relay_ping).await;

    state.relay.detach(&device_id, connection_id);
}

/// Forward bus messages to the socket until either side goes away
///
/// Everything written to the socket goes through this one loop.
async fn bridge(
    socket: WebSocket,
    device_id: &str,
    mut subscription: Subscription,
    mut superseded: oneshot::Receiver<()>,
    ping_every: Duration,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);

    let close = loop {
        tokio::select! {
            biased;
            _ = &mut superseded => break Some(CloseReason::Superseded),
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(device_id, "device closed connection");
                    break None;
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!(device_id, len = text.len(), "ignoring device message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(device_id, error = %e, "socket error");
                    break None;
                }
            },
            message = subscription.recv() => match message {
                Some(message) => {
                    if sender.send(Message::Text(message.into())).await.is_err() {
                        break None;
                    }
                }
                None => break Some(CloseReason::Internal),
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break None;
                }
            }
        }
    };

    if let Some(reason) = close {
        let _ = sender.send(reason.frame()).await;
    }

    // Unsubscribe before the slot is released
    drop(subscription);
}
