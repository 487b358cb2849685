//! trustlink - Device trust establishment and real-time delivery
//!
//! This library provides:
//! - Challenge-response authentication for registered devices (Ed25519)
//! - A pairing coordinator bridging browser OAuth redirects to a waiting
//!   client over server-sent events
//! - A connection relay pushing bus messages to authenticated devices over
//!   WebSocket
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                       HTTP API                         │
//! │  /device/*   │  /pair/{provider}/*  │  /ws  │ /health │
//! └──────┬────────────────┬────────────────┬──────────────┘
//!        │                │                │
//! ┌──────▼────────┐ ┌─────▼───────┐ ┌──────▼───────────┐
//! │ Authenticator │ │   Pairing   │ │ Connection Relay │
//! │               │◄┼─────────────┼─┤  (handshake)     │
//! └──┬─────────┬──┘ │ Coordinator │ └──────┬───────────┘
//!    │         │    └─────────────┘        │
//! ┌──▼───┐ ┌───▼───────────┐         ┌─────▼──────┐
//! │SQLite│ │Challenge store│         │Message bus │
//! └──────┘ └───────────────┘         └────────────┘
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod pairing;
pub mod relay;
pub mod security;

pub use config::Config;
pub use db::{DbPool, Device, DeviceRepo};
pub use error::{Error, Result};
pub use pairing::{PairingCoordinator, PairingEvent, ProviderConfig, ProviderTokens, TokenExchange};
pub use relay::{ConnectionRelay, LocalBus, MessageBus};
pub use security::{
    Authenticator, ChallengeStore, DeviceKeypair, HandshakePolicy, TtlChallengeStore,
};
