//! Connection relay integration tests over a real socket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use trustlink::api::{ApiServerBuilder, ApiState};
use trustlink::security::ChallengeIssue;
use trustlink::{DeviceKeypair, HandshakePolicy};

mod common;
use common::{INTERNAL_KEY, test_builder};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(builder: ApiServerBuilder) -> (SocketAddr, Arc<ApiState>) {
    let server = builder.build();
    let state = server.state().clone();
    let router = server.router();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, state)
}

async fn register(state: &ApiState, device_id: &str) -> DeviceKeypair {
    let keys = DeviceKeypair::generate();
    state
        .authenticator
        .register(device_id, &keys.public_key())
        .await
        .unwrap();
    keys
}

async fn issue(state: &ApiState, device_id: &str) -> String {
    match state.authenticator.issue_challenge(device_id).await.unwrap() {
        ChallengeIssue::Issued(challenge) => challenge.value,
        ChallengeIssue::UnknownDevice => panic!("device {device_id} not registered"),
    }
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws?{query}"))
        .await
        .unwrap();
    client
}

/// Connect with a freshly issued challenge and wait until the relay has the device
async fn connect_device(
    addr: SocketAddr,
    state: &ApiState,
    device_id: &str,
    keys: &DeviceKeypair,
) -> Client {
    let challenge = issue(state, device_id).await;
    let signature = keys.sign(challenge.as_bytes());
    let client = connect(
        addr,
        &format!(
            "deviceId={device_id}&challenge={challenge}&signature={}",
            urlencode(&signature)
        ),
    )
    .await;
    wait_for(|| state.relay.connections().is_connected(device_id)).await;
    client
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Next data or close message, skipping control frames
async fn next_message(client: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .unwrap();
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

async fn expect_close(client: &mut Client) -> (u16, String) {
    match next_message(client).await {
        Message::Close(Some(frame)) => (u16::from(frame.code), frame.reason.as_str().to_string()),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_credentials_closed() {
    let (addr, _) = spawn_server(test_builder()).await;

    let mut client = connect(addr, "deviceId=d1").await;

    assert_eq!(expect_close(&mut client).await, (1008, "Missing credentials".to_string()));
}

#[tokio::test]
async fn test_unknown_device_closed() {
    let (addr, _) = spawn_server(test_builder()).await;

    let mut client = connect(addr, "deviceId=ghost&challenge=abc&signature=c2ln").await;

    assert_eq!(expect_close(&mut client).await, (1008, "Device not found".to_string()));
}

#[tokio::test]
async fn test_bad_signature_closed() {
    let (addr, state) = spawn_server(test_builder()).await;
    register(&state, "d1").await;
    let imposter = DeviceKeypair::generate();

    let challenge = issue(&state, "d1").await;
    let signature = urlencode(&imposter.sign(challenge.as_bytes()));
    let mut client = connect(
        addr,
        &format!("deviceId=d1&challenge={challenge}&signature={signature}"),
    )
    .await;

    assert_eq!(expect_close(&mut client).await, (1008, "Invalid signature".to_string()));
    assert!(!state.relay.connections().is_connected("d1"));
}

#[tokio::test]
async fn test_unissued_challenge_closed() {
    let (addr, state) = spawn_server(test_builder()).await;
    let keys = register(&state, "d1").await;

    let signature = urlencode(&keys.sign(b"self-chosen"));
    let mut client = connect(
        addr,
        &format!("deviceId=d1&challenge=self-chosen&signature={signature}"),
    )
    .await;

    assert_eq!(expect_close(&mut client).await, (1008, "Challenge expired".to_string()));
}

#[tokio::test]
async fn test_presented_challenge_policy() {
    let (addr, state) = spawn_server(test_builder().handshake(HandshakePolicy::Presented)).await;
    let keys = register(&state, "d1").await;

    let signature = urlencode(&keys.sign(b"self-chosen"));
    let query = format!("deviceId=d1&challenge=self-chosen&signature={signature}");
    let _client = connect(addr, &query).await;
    wait_for(|| state.relay.connections().is_connected("d1")).await;

    assert_eq!(state.relay.publish("d1", r#"{"n":1}"#).await, 1);
}

#[tokio::test]
async fn test_issued_challenge_is_consumed() {
    let (addr, state) = spawn_server(test_builder()).await;
    let keys = register(&state, "d1").await;

    let challenge = issue(&state, "d1").await;
    let signature = urlencode(&keys.sign(challenge.as_bytes()));
    let query = format!("deviceId=d1&challenge={challenge}&signature={signature}");

    let _first = connect(addr, &query).await;
    wait_for(|| state.relay.connections().is_connected("d1")).await;

    let mut replay = connect(addr, &query).await;
    assert_eq!(expect_close(&mut replay).await, (1008, "Challenge expired".to_string()));
}

#[tokio::test]
async fn test_publish_reaches_device() {
    let (addr, state) = spawn_server(test_builder()).await;
    let keys = register(&state, "d1").await;
    let mut client = connect_device(addr, &state, "d1", &keys).await;

    let delivered = state.relay.publish("d1", r#"{"kind":"refresh"}"#).await;
    assert_eq!(delivered, 1);

    let message = next_message(&mut client).await;
    assert_eq!(message.to_text().unwrap(), r#"{"kind":"refresh"}"#);
}

#[tokio::test]
async fn test_publish_without_connection_is_noop() {
    let (_, state) = spawn_server(test_builder()).await;
    register(&state, "d1").await;

    let delivered = tokio::time::timeout(
        Duration::from_secs(1),
        state.relay.publish("d1", "{}"),
    )
    .await
    .unwrap();

    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn test_messages_are_per_device() {
    let (addr, state) = spawn_server(test_builder()).await;
    let keys_one = register(&state, "d1").await;
    let keys_two = register(&state, "d2").await;
    let mut one = connect_device(addr, &state, "d1", &keys_one).await;
    let mut two = connect_device(addr, &state, "d2", &keys_two).await;

    state.relay.publish("d2", "for-two").await;
    state.relay.publish("d1", "for-one").await;

    assert_eq!(next_message(&mut one).await.to_text().unwrap(), "for-one");
    assert_eq!(next_message(&mut two).await.to_text().unwrap(), "for-two");
}

#[tokio::test]
async fn test_new_connection_supersedes_old() {
    let (addr, state) = spawn_server(test_builder()).await;
    let keys = register(&state, "d1").await;

    let mut old = connect_device(addr, &state, "d1", &keys).await;
    let mut new = connect_device(addr, &state, "d1", &keys).await;

    assert_eq!(expect_close(&mut old).await, (1000, "Superseded".to_string()));
    assert_eq!(state.relay.connections().len(), 1);

    // Only the surviving connection receives
    wait_for(|| state.relay.connections().is_connected("d1")).await;
    state.relay.publish("d1", "hello").await;
    assert_eq!(next_message(&mut new).await.to_text().unwrap(), "hello");
}

#[tokio::test]
async fn test_disconnect_releases_device() {
    let (addr, state) = spawn_server(test_builder()).await;
    let keys = register(&state, "d1").await;
    let mut client = connect_device(addr, &state, "d1", &keys).await;

    client.close(None).await.unwrap();

    wait_for(|| !state.relay.connections().is_connected("d1")).await;
    assert_eq!(state.relay.publish("d1", "late").await, 0);
}

#[tokio::test]
async fn test_server_pings_idle_connection() {
    let (addr, state) =
        spawn_server(test_builder().relay_ping(Duration::from_millis(50))).await;
    let keys = register(&state, "d1").await;
    let mut client = connect_device(addr, &state, "d1", &keys).await;

    let message = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(matches!(message, Message::Ping(_)));
}

#[tokio::test]
async fn test_internal_publish_over_http() {
    let (addr, state) = spawn_server(test_builder()).await;
    let keys = register(&state, "d1").await;
    let mut client = connect_device(addr, &state, "d1", &keys).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/internal/devices/d1/messages"))
        .bearer_auth(INTERNAL_KEY)
        .json(&serde_json::json!({ "kind": "sync" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["delivered"], 1);

    let message = next_message(&mut client).await;
    let payload: serde_json::Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
    assert_eq!(payload["kind"], "sync");
}
