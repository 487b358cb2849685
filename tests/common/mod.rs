//! Shared test utilities
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tower::ServiceExt;
use trustlink::api::ApiServerBuilder;
use trustlink::db::{self, DeviceRepo};
use trustlink::pairing::parse_providers;
use trustlink::{
    Authenticator, ConnectionRelay, DeviceKeypair, LocalBus, ProviderConfig, ProviderTokens,
    TokenExchange, TtlChallengeStore,
};

/// Bearer key accepted by the internal endpoints in tests
pub const INTERNAL_KEY: &str = "test-internal-key";

/// Base URL handed out in pairing redirect URLs
pub const PUBLIC_URL: &str = "http://pair.test";

/// Authorization code the stub exchanger refuses
pub const BAD_CODE: &str = "bad-code";

/// Authorization code the stub exchanger redeems after a delay
pub const SLOW_CODE: &str = "slow-code";

const PROVIDERS: &str = r#"
    [[providers]]
    name = "spotify"
    authorize_url = "https://accounts.spotify.test/authorize"
    token_url = "https://accounts.spotify.test/api/token"
    client_id = "spotify-client"
    client_secret = "spotify-secret"
    redirect_uri = "http://pair.test/pair/spotify/callback"
    scopes = ["user-read-private", "user-read-email"]

    [[providers]]
    name = "google"
    authorize_url = "https://accounts.google.test/o/oauth2/v2/auth"
    token_url = "https://oauth2.google.test/token"
    client_id = "google-client"
    client_secret = "google-secret"
    redirect_uri = "http://pair.test/pair/google/callback"
    scopes = ["openid"]
    authorize_params = { access_type = "offline" }
"#;

/// Token exchange that answers locally
#[derive(Default)]
pub struct StubExchange {
    pub codes: Mutex<Vec<String>>,
}

#[async_trait]
impl TokenExchange for StubExchange {
    async fn exchange(
        &self,
        _provider: &ProviderConfig,
        code: &str,
    ) -> trustlink::Result<ProviderTokens> {
        self.codes.lock().unwrap().push(code.to_string());
        if code == SLOW_CODE {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        } else if code == BAD_CODE {
            return Err(trustlink::Error::Provider("invalid_grant".to_string()));
        }
        Ok(ProviderTokens {
            access_token: format!("access-{code}"),
            refresh_token: Some(format!("refresh-{code}")),
            expires_in: Some(3600),
        })
    }
}

/// Providers used across tests
pub fn test_providers() -> Vec<ProviderConfig> {
    parse_providers(PROVIDERS).expect("failed to parse test providers")
}

/// Builder wired to an in-memory database and local collaborators
pub fn test_builder() -> ApiServerBuilder {
    let pool = db::init_memory().expect("failed to init test db");
    let authenticator = Authenticator::new(
        DeviceRepo::new(pool),
        Arc::new(TtlChallengeStore::default()),
    );
    let relay = ConnectionRelay::new(Arc::new(LocalBus::default()));

    ApiServerBuilder::new(authenticator, relay, 0)
        .public_url(PUBLIC_URL)
        .providers(test_providers())
        .token_exchange(Arc::new(StubExchange::default()))
        .internal_api_key(Some(INTERNAL_KEY.to_string()))
}

/// Default test router
pub fn test_router() -> Router {
    test_builder().build().router()
}

/// Build a JSON POST request
pub fn json_post(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Build a GET request
pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Send a request, returning status and JSON body (`Null` if not JSON)
pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Register a device over HTTP
pub async fn register(router: &Router, device_id: &str, keys: &DeviceKeypair) -> StatusCode {
    let body = serde_json::json!({ "device_id": device_id, "public_key": keys.public_key() });
    send(router, json_post("/device/register", &body)).await.0
}

/// Request a challenge over HTTP
pub async fn challenge(router: &Router, device_id: &str) -> String {
    let (status, body) = send(
        router,
        json_post("/device/auth/request", &serde_json::json!({ "device_id": device_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["challenge"].as_str().unwrap().to_string()
}

/// Verify a signature over HTTP
pub async fn verify(router: &Router, device_id: &str, signature: &str) -> StatusCode {
    let body = serde_json::json!({ "device_id": device_id, "signature": signature });
    send(router, json_post("/device/auth/verify", &body)).await.0
}
