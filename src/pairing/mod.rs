//! Pairing coordinator
//!
//! Bridges a browser-based provider authorization to a client waiting on a
//! server-pushed event stream, correlated by a short-lived token.

pub mod coordinator;
pub mod events;
pub mod provider;

pub use coordinator::{
    CompletionClaim, DEFAULT_HEARTBEAT, DEFAULT_TOKEN_TTL, PairingCoordinator, PairingListener,
    PairingState, PairingTicket, Visit,
};
pub use events::{AUTHORIZATION_FAILED, PairingEvent, ProviderTokens};
pub use provider::{OAuthClient, ProviderConfig, TokenExchange, load_providers, parse_providers};
