//! Events delivered on a pairing stream

use serde::{Deserialize, Serialize};

/// Error carried by the failure event when authorization does not complete
pub const AUTHORIZATION_FAILED: &str = "Authorization failed";

/// Credentials issued by an authorization provider
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTokens {
    /// Access token
    pub access_token: String,

    /// Refresh token, when the provider grants offline access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Access token lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

impl std::fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// An event on a pairing stream
///
/// Serialized as a JSON object tagged by `status`, which is what a waiting
/// client switches on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PairingEvent {
    /// Heartbeat; carries nothing
    #[serde(rename = "keep-alive")]
    KeepAlive,

    /// The user followed the authorization redirect
    #[serde(rename = "URL visited")]
    Visited,

    /// Provider confirmed authorization
    #[serde(rename = "User logged in")]
    Authorized(ProviderTokens),

    /// Provider refused, or the code exchange failed
    #[serde(rename = "Authorization failed")]
    Failed {
        /// Human-readable reason
        error: String,
    },

    /// Token evicted before it was completed
    #[serde(rename = "Expired")]
    Expired,
}

impl PairingEvent {
    /// Whether the stream closes after this event
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Authorized(_) | Self::Failed { .. } | Self::Expired)
    }
}
