//! Challenge-response authenticator
//!
//! Issues and verifies device challenges and manages key rotation. Device
//! records live in the relational store and are re-read on every call, so a
//! rotation takes effect for the very next verification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::challenge::{Challenge, ChallengeStore, constant_time_eq};
use super::identity::{validate_public_key, verify_signature};
use crate::db::{Device, DeviceRepo};
use crate::{Error, Result};

/// Outcome of a registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Device stored
    Created(Device),
    /// Device ID already taken; existing record untouched
    Conflict,
}

/// Outcome of a challenge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeIssue {
    /// Fresh challenge stored for the device
    Issued(Challenge),
    /// No such device
    UnknownDevice,
}

/// Outcome of a signature verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Signature valid against the current key
    Verified(Device),
    /// Signature invalid, or the key rotated mid-verification
    Unverified,
    /// No outstanding challenge (never issued, expired or already consumed)
    Expired,
    /// No such device
    UnknownDevice,
}

/// Outcome of a key rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// Key replaced; carries the new key version
    Rotated { key_version: i64 },
    /// Signature over the new key does not validate against the current key
    Unverified,
    /// No such device
    UnknownDevice,
}

/// How the persistent-connection handshake treats the presented challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePolicy {
    /// Challenge must be the one issued by `issue_challenge`; it is consumed
    #[default]
    Issued,
    /// Any caller-supplied challenge is accepted and nothing is consumed
    Presented,
}

impl std::str::FromStr for HandshakePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "issued" => Ok(Self::Issued),
            "presented" | "any" | "legacy" => Ok(Self::Presented),
            other => Err(Error::Config(format!(
                "unknown handshake policy '{other}' (expected 'issued' or 'presented')"
            ))),
        }
    }
}

impl std::fmt::Display for HandshakePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Issued => write!(f, "issued"),
            Self::Presented => write!(f, "presented"),
        }
    }
}

/// Issues and verifies device challenges
#[derive(Clone)]
pub struct Authenticator {
    devices: DeviceRepo,
    challenges: Arc<dyn ChallengeStore>,
}

impl Authenticator {
    /// Create a new authenticator
    #[must_use]
    pub fn new(devices: DeviceRepo, challenges: Arc<dyn ChallengeStore>) -> Self {
        Self {
            devices,
            challenges,
        }
    }

    /// Time-to-live of issued challenges
    #[must_use]
    pub fn challenge_ttl(&self) -> std::time::Duration {
        self.challenges.ttl()
    }

    /// Register a device with its initial public key
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed key, or a database error
    pub async fn register(&self, device_id: &str, public_key: &str) -> Result<Registration> {
        validate_public_key(public_key)?;

        let repo = self.devices.clone();
        let (id, key) = (device_id.to_string(), public_key.to_string());
        let inserted = blocking(move || repo.insert(&id, &key)).await?;

        Ok(inserted.map_or(Registration::Conflict, Registration::Created))
    }

    /// Issue a challenge, replacing any outstanding one for the device
    ///
    /// # Errors
    ///
    /// Returns error if a backing store is unavailable
    pub async fn issue_challenge(&self, device_id: &str) -> Result<ChallengeIssue> {
        if self.device(device_id).await?.is_none() {
            return Ok(ChallengeIssue::UnknownDevice);
        }

        let challenge = Challenge::generate(device_id);
        self.challenges.put(challenge.clone()).await?;

        tracing::debug!(device_id, "challenge issued");
        Ok(ChallengeIssue::Issued(challenge))
    }

    /// Verify a signature over the device's outstanding challenge
    ///
    /// On success the challenge is consumed and last-seen is updated.
    ///
    /// # Errors
    ///
    /// Returns error if a backing store is unavailable
    pub async fn verify_challenge(&self, device_id: &str, signature: &str) -> Result<Verification> {
        let Some(device) = self.device(device_id).await? else {
            return Ok(Verification::UnknownDevice);
        };
        let Some(challenge) = self.challenges.get(device_id).await? else {
            tracing::debug!(device_id, "no outstanding challenge");
            return Ok(Verification::Expired);
        };

        self.verify_issued(device, &challenge, signature).await
    }

    /// Verify the handshake of a persistent connection
    ///
    /// # Errors
    ///
    /// Returns error if a backing store is unavailable
    pub async fn verify_handshake(
        &self,
        device_id: &str,
        challenge: &str,
        signature: &str,
        policy: HandshakePolicy,
    ) -> Result<Verification> {
        let Some(device) = self.device(device_id).await? else {
            return Ok(Verification::UnknownDevice);
        };

        match policy {
            HandshakePolicy::Issued => {
                let Some(issued) = self.challenges.get(device_id).await? else {
                    return Ok(Verification::Expired);
                };
                if !constant_time_eq(issued.value.as_bytes(), challenge.as_bytes()) {
                    tracing::debug!(
                        device_id,
                        "handshake challenge does not match issued challenge"
                    );
                    return Ok(Verification::Unverified);
                }
                self.verify_issued(device, &issued, signature).await
            }
            HandshakePolicy::Presented => {
                if !signature_valid(&device.public_key, challenge.as_bytes(), signature) {
                    return Ok(Verification::Unverified);
                }
                self.record_seen(device).await
            }
        }
    }

    /// Rotate a device key
    ///
    /// `signature` must be the current private key's signature over
    /// `new_public_key`. The swap only lands if the key is still the one the
    /// signature was checked against.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed new key, or a database error
    pub async fn rotate_key(
        &self,
        device_id: &str,
        new_public_key: &str,
        signature: &str,
    ) -> Result<Rotation> {
        let Some(device) = self.device(device_id).await? else {
            return Ok(Rotation::UnknownDevice);
        };

        validate_public_key(new_public_key)?;

        if !signature_valid(&device.public_key, new_public_key.as_bytes(), signature) {
            tracing::warn!(device_id, "key rotation rejected: invalid signature");
            return Ok(Rotation::Unverified);
        }

        let repo = self.devices.clone();
        let (id, old_key, new_key) = (
            device_id.to_string(),
            device.public_key,
            new_public_key.to_string(),
        );
        let swapped = blocking(move || repo.swap_key(&id, &old_key, &new_key)).await?;

        match swapped {
            Some(key_version) => {
                tracing::info!(device_id, key_version, "device key rotated");
                Ok(Rotation::Rotated { key_version })
            }
            None => {
                tracing::warn!(device_id, "key rotation lost a race with a concurrent rotation");
                Ok(Rotation::Unverified)
            }
        }
    }

    async fn verify_issued(
        &self,
        device: Device,
        challenge: &Challenge,
        signature: &str,
    ) -> Result<Verification> {
        let device_id = device.device_id.as_str();
        if !signature_valid(&device.public_key, challenge.payload(), signature) {
            tracing::debug!(device_id, "challenge signature invalid");
            return Ok(Verification::Unverified);
        }

        if !self.challenges.consume(device_id, &challenge.value).await? {
            tracing::debug!(device_id, "challenge already consumed");
            return Ok(Verification::Expired);
        }

        self.record_seen(device).await
    }

    async fn record_seen(&self, mut device: Device) -> Result<Verification> {
        let repo = self.devices.clone();
        let (id, version) = (device.device_id.clone(), device.key_version);
        let seen: Option<DateTime<Utc>> = blocking(move || repo.touch(&id, version)).await?;

        let Some(seen) = seen else {
            tracing::warn!(device_id = %device.device_id, "key rotated during verification");
            return Ok(Verification::Unverified);
        };

        device.last_seen_at = Some(seen);
        tracing::info!(device_id = %device.device_id, "device authenticated");
        Ok(Verification::Verified(device))
    }

    async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        let repo = self.devices.clone();
        let id = device_id.to_string();
        blocking(move || repo.get(&id)).await
    }

    /// Number of registered devices
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub async fn device_count(&self) -> Result<usize> {
        let repo = self.devices.clone();
        blocking(move || repo.count()).await
    }
}

/// Malformed keys or signatures count as a failed check, not a server error
fn signature_valid(public_key: &str, payload: &[u8], signature: &str) -> bool {
    match verify_signature(public_key, payload, signature) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::debug!(error = %e, "signature check failed");
            false
        }
    }
}

/// Run a relational-store call off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Database(format!("blocking task failed: {e}")))?
}
