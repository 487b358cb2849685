//! HTTP API server for trustlink

mod auth;
pub mod device;
pub mod health;
pub mod internal;
pub mod pairing;
pub mod rate_limit;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::pairing::{OAuthClient, PairingCoordinator, ProviderConfig, TokenExchange};
use crate::relay::ConnectionRelay;
use crate::security::{Authenticator, HandshakePolicy};
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub authenticator: Authenticator,
    pub pairing: PairingCoordinator,
    pub providers: HashMap<String, ProviderConfig>,
    pub token_exchange: Arc<dyn TokenExchange>,
    pub relay: ConnectionRelay,
    pub public_url: String,
    pub conceal_unknown_devices: bool,
    pub handshake: HandshakePolicy,
    pub pairing_heartbeat: Duration,
    pub relay_ping: Duration,
    pub internal_api_key: Option<String>,
    pub rate_limiter: Option<rate_limit::SharedLimiter>,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    authenticator: Authenticator,
    relay: ConnectionRelay,
    port: u16,
    pairing: Option<PairingCoordinator>,
    providers: Vec<ProviderConfig>,
    token_exchange: Option<Arc<dyn TokenExchange>>,
    public_url: Option<String>,
    conceal_unknown_devices: bool,
    handshake: HandshakePolicy,
    pairing_heartbeat: Duration,
    pairing_token_ttl: Duration,
    relay_ping: Duration,
    internal_api_key: Option<String>,
    rate_limit_rpm: Option<u32>,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(authenticator: Authenticator, relay: ConnectionRelay, port: u16) -> Self {
        Self {
            authenticator,
            relay,
            port,
            pairing: None,
            providers: Vec::new(),
            token_exchange: None,
            public_url: None,
            conceal_unknown_devices: false,
            handshake: HandshakePolicy::default(),
            pairing_heartbeat: crate::pairing::DEFAULT_HEARTBEAT,
            pairing_token_ttl: crate::pairing::DEFAULT_TOKEN_TTL,
            relay_ping: Duration::from_secs(30),
            internal_api_key: None,
            rate_limit_rpm: None,
        }
    }

    /// Apply every setting from a loaded configuration
    #[must_use]
    pub fn config(mut self, config: &Config) -> Self {
        self.port = config.api_server.port;
        self.public_url = Some(config.api_server.public_url());
        self.internal_api_key.clone_from(&config.api_server.internal_api_key);
        self.rate_limit_rpm = config.api_server.rate_limit_rpm;
        self.conceal_unknown_devices = config.auth.conceal_unknown_devices;
        self.handshake = config.auth.handshake;
        self.pairing_heartbeat = config.pairing.heartbeat;
        self.pairing_token_ttl = config.pairing.token_ttl;
        self.relay_ping = config.relay.ping_interval;
        self
    }

    /// Set the authorization providers
    #[must_use]
    pub fn providers(mut self, providers: Vec<ProviderConfig>) -> Self {
        self.providers = providers;
        self
    }

    /// Set the authorization-code exchanger (defaults to HTTP)
    #[must_use]
    pub fn token_exchange(mut self, exchange: Arc<dyn TokenExchange>) -> Self {
        self.token_exchange = Some(exchange);
        self
    }

    /// Share an existing pairing coordinator
    #[must_use]
    pub fn pairing(mut self, coordinator: PairingCoordinator) -> Self {
        self.pairing = Some(coordinator);
        self
    }

    /// Set the externally reachable base URL
    #[must_use]
    pub fn public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    /// Report unknown devices as authentication failures
    #[must_use]
    pub const fn conceal_unknown_devices(mut self, conceal: bool) -> Self {
        self.conceal_unknown_devices = conceal;
        self
    }

    /// Set the connection handshake policy
    #[must_use]
    pub const fn handshake(mut self, policy: HandshakePolicy) -> Self {
        self.handshake = policy;
        self
    }

    /// Set the pairing stream heartbeat interval
    #[must_use]
    pub const fn pairing_heartbeat(mut self, interval: Duration) -> Self {
        self.pairing_heartbeat = interval;
        self
    }

    /// Set the WebSocket ping interval
    #[must_use]
    pub const fn relay_ping(mut self, interval: Duration) -> Self {
        self.relay_ping = interval;
        self
    }

    /// Enable the internal publish endpoint with this bearer key
    #[must_use]
    pub fn internal_api_key(mut self, key: Option<String>) -> Self {
        self.internal_api_key = key;
        self
    }

    /// Limit device endpoints to `rpm` requests per minute
    #[must_use]
    pub const fn rate_limit(mut self, rpm: Option<u32>) -> Self {
        self.rate_limit_rpm = rpm;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let providers: HashMap<String, ProviderConfig> = self
            .providers
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        if !providers.is_empty() {
            let mut names: Vec<&str> = providers.keys().map(String::as_str).collect();
            names.sort_unstable();
            tracing::info!(providers = ?names, "pairing providers configured");
        }

        let token_exchange = self
            .token_exchange
            .unwrap_or_else(|| Arc::new(OAuthClient::default()));

        let state = Arc::new(ApiState {
            authenticator: self.authenticator,
            pairing: self
                .pairing
                .unwrap_or_else(|| PairingCoordinator::new(self.pairing_token_ttl)),
            providers,
            token_exchange,
            relay: self.relay,
            public_url: self
                .public_url
                .unwrap_or_else(|| format!("http://localhost:{}", self.port)),
            conceal_unknown_devices: self.conceal_unknown_devices,
            handshake: self.handshake,
            pairing_heartbeat: self.pairing_heartbeat,
            relay_ping: self.relay_ping,
            internal_api_key: self.internal_api_key,
            rate_limiter: self.rate_limit_rpm.map(rate_limit::create_limiter),
        });

        ApiServer {
            state,
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Shared handler state
    #[must_use]
    pub const fn state(&self) -> &Arc<ApiState> {
        &self.state
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let device = device::router(self.state.clone()).layer(
            axum::middleware::from_fn_with_state(
                self.state.clone(),
                rate_limit::rate_limit_middleware,
            ),
        );

        let mut router = Router::new()
            .nest("/device", device)
            .nest("/pair", pairing::router(self.state.clone()))
            .merge(websocket::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        if self.state.internal_api_key.is_some() {
            router = router.nest("/internal", internal::router(self.state.clone()));
        }

        // CORS layer for cross-origin requests from frontends
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server until ctrl-c
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server: {e}")))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until ctrl-c
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let reaper = self.state.pairing.spawn_reaper(reap_interval(self.state.pairing.ttl()));

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, public_url = %self.state.public_url, "API server listening");
        }

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")));

        reaper.abort();
        result
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

/// Reap often enough that a token outlives its TTL by at most a tenth of it
fn reap_interval(ttl: Duration) -> Duration {
    (ttl / 10).max(Duration::from_secs(1))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// JSON error body `{"error": message}`
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Map a backend failure to a 500, logging the detail
pub(crate) fn internal_error(e: &Error) -> Response {
    tracing::error!(error = %e, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}
