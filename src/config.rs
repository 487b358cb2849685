//! Configuration management for trustlink

use std::path::PathBuf;
use std::time::Duration;

use crate::security::{DEFAULT_CHALLENGE_TTL, HandshakePolicy};
use crate::{Error, Result};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 18800;

/// trustlink configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database, providers file)
    pub data_dir: PathBuf,

    /// `SQLite` database path
    pub database_path: PathBuf,

    /// Authorization providers file (TOML)
    pub providers_path: PathBuf,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Device authentication configuration
    pub auth: AuthConfig,

    /// Pairing configuration
    pub pairing: PairingConfig,

    /// Connection relay configuration
    pub relay: RelayConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Externally reachable base URL, when it differs from localhost
    pub public_url: Option<String>,

    /// Bearer key for the internal publish endpoint (from `TRUSTLINK_INTERNAL_API_KEY`)
    pub internal_api_key: Option<String>,

    /// Requests per minute allowed on device endpoints (unset = unlimited)
    pub rate_limit_rpm: Option<u32>,
}

impl ApiServerConfig {
    /// Base URL used to build redirect URLs
    #[must_use]
    pub fn public_url(&self) -> String {
        self.public_url.as_ref().map_or_else(
            || format!("http://localhost:{}", self.port),
            |url| url.trim_end_matches('/').to_string(),
        )
    }
}

/// Device authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Lifetime of an issued challenge
    pub challenge_ttl: Duration,

    /// Report unknown devices as authentication failures
    pub conceal_unknown_devices: bool,

    /// How the persistent-connection handshake treats its challenge
    pub handshake: HandshakePolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
            conceal_unknown_devices: false,
            handshake: HandshakePolicy::Issued,
        }
    }
}

/// Pairing configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Interval between stream heartbeats
    pub heartbeat: Duration,

    /// Lifetime of a token that is never completed
    pub token_ttl: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            heartbeat: crate::pairing::DEFAULT_HEARTBEAT,
            token_ttl: crate::pairing::DEFAULT_TOKEN_TTL,
        }
    }
}

/// Connection relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interval between WebSocket pings
    pub ping_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from `TRUSTLINK_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // ~/.local/share/omni/trustlink on Linux
        let data_dir = directories::ProjectDirs::from("dev", "omni", "omni")
            .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("trustlink"));

        let database_path = lookup("TRUSTLINK_DATABASE")
            .map_or_else(|| data_dir.join("trustlink.db"), PathBuf::from);
        let providers_path = lookup("TRUSTLINK_PROVIDERS")
            .map_or_else(|| data_dir.join("providers.toml"), PathBuf::from);

        let api_server = ApiServerConfig {
            port: parse_var(&lookup, "TRUSTLINK_PORT")?.unwrap_or(DEFAULT_PORT),
            public_url: lookup("TRUSTLINK_PUBLIC_URL").filter(|s| !s.is_empty()),
            internal_api_key: lookup("TRUSTLINK_INTERNAL_API_KEY").filter(|s| !s.is_empty()),
            rate_limit_rpm: parse_var(&lookup, "TRUSTLINK_RATE_LIMIT_RPM")?.filter(|&n| n > 0),
        };

        let auth = AuthConfig {
            challenge_ttl: secs_var(
                &lookup,
                "TRUSTLINK_CHALLENGE_TTL_SECS",
                DEFAULT_CHALLENGE_TTL,
            )?,
            conceal_unknown_devices: lookup("TRUSTLINK_CONCEAL_UNKNOWN_DEVICES")
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
            handshake: parse_var(&lookup, "TRUSTLINK_HANDSHAKE")?.unwrap_or_default(),
        };

        let defaults = PairingConfig::default();
        let pairing = PairingConfig {
            heartbeat: secs_var(&lookup, "TRUSTLINK_PAIRING_HEARTBEAT_SECS", defaults.heartbeat)?,
            token_ttl: secs_var(&lookup, "TRUSTLINK_PAIRING_TOKEN_TTL_SECS", defaults.token_ttl)?,
        };

        let relay = RelayConfig {
            ping_interval: secs_var(
                &lookup,
                "TRUSTLINK_RELAY_PING_SECS",
                RelayConfig::default().ping_interval,
            )?,
        };

        if auth.handshake == HandshakePolicy::Presented {
            tracing::warn!(
                "handshake accepts caller-chosen challenges; connections can be replayed"
            );
        }

        Ok(Self {
            data_dir,
            database_path,
            providers_path,
            api_server,
            auth,
            pairing,
            relay,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

fn secs_var<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_var::<_, u64>(lookup, key)? {
        None => Ok(default),
        Some(0) => Err(Error::Config(format!("{key} must be greater than zero"))),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}
