//! Short-lived authentication challenges
//!
//! At most one challenge is outstanding per device. A fresh request
//! overwrites the previous one; a successful verification consumes it.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::{Error, Result};

/// Challenge length in random bytes
const CHALLENGE_LENGTH: usize = 32;

/// Default time-to-live for an issued challenge
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(60);

/// An issued challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Device the challenge was issued to
    pub device_id: String,

    /// Random value the device must sign (hex encoded)
    pub value: String,

    /// When the challenge was issued
    pub issued_at: DateTime<Utc>,
}

impl Challenge {
    /// Generate a fresh random challenge for a device
    #[must_use]
    pub fn generate(device_id: &str) -> Self {
        let mut bytes = [0u8; CHALLENGE_LENGTH];
        OsRng.fill_bytes(&mut bytes);

        Self {
            device_id: device_id.to_string(),
            value: hex::encode(bytes),
            issued_at: Utc::now(),
        }
    }

    /// Bytes the device signs
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.value.as_bytes()
    }
}

/// Key-value store with expiry holding outstanding challenges
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Store a challenge, replacing any outstanding one for the same device
    async fn put(&self, challenge: Challenge) -> Result<()>;

    /// Fetch the outstanding, unexpired challenge for a device
    async fn get(&self, device_id: &str) -> Result<Option<Challenge>>;

    /// Remove the device's challenge if it still holds `value`
    ///
    /// Returns true for exactly one caller per issued challenge.
    async fn consume(&self, device_id: &str, value: &str) -> Result<bool>;

    /// Time-to-live applied to stored challenges
    fn ttl(&self) -> Duration;
}

/// In-process challenge store on a TTL cache
pub struct TtlChallengeStore {
    cache: Cache<String, Challenge>,
    ttl: Duration,
    /// Serializes compare-and-remove against concurrent writers
    write_lock: Mutex<()>,
}

impl TtlChallengeStore {
    /// Create a store whose entries expire after `ttl`
    #[must_use]
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            ttl,
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Database("challenge store lock poisoned".to_string()))
    }
}

impl Default for TtlChallengeStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHALLENGE_TTL, 100_000)
    }
}

#[async_trait]
impl ChallengeStore for TtlChallengeStore {
    async fn put(&self, challenge: Challenge) -> Result<()> {
        let _guard = self.lock()?;
        self.cache.insert(challenge.device_id.clone(), challenge);
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Option<Challenge>> {
        Ok(self.cache.get(&device_id.to_string()))
    }

    async fn consume(&self, device_id: &str, value: &str) -> Result<bool> {
        let key = device_id.to_string();
        let _guard = self.lock()?;

        match self.cache.get(&key) {
            Some(stored) if constant_time_eq(stored.value.as_bytes(), value.as_bytes()) => {
                self.cache.invalidate(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Constant-time byte comparison to prevent timing attacks
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
