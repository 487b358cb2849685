//! Device repository
//!
//! The relational system of record for device identities. Every read goes to
//! the database; nothing here caches a public key between calls.

use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension, params};
use serde::Serialize;

use super::DbPool;
use crate::{Error, Result};

/// A registered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Unique, immutable device identifier
    pub device_id: String,

    /// Current Ed25519 public key (base64 encoded)
    pub public_key: String,

    /// Incremented by one on every successful key rotation
    pub key_version: i64,

    /// When the device was registered
    pub registered_at: DateTime<Utc>,

    /// Last successful authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Device repository
#[derive(Clone)]
pub struct DeviceRepo {
    pool: DbPool,
}

impl DeviceRepo {
    /// Create a new device repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new device
    ///
    /// Returns `None` if the device ID is already taken; the existing record is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, device_id: &str, public_key: &str) -> Result<Option<Device>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now();
        let inserted = conn.execute(
            "INSERT INTO devices (device_id, public_key, key_version, registered_at)
             VALUES (?1, ?2, 1, ?3)",
            params![device_id, public_key, now.to_rfc3339()],
        );

        match inserted {
            Ok(_) => {
                tracing::info!(device_id, "device registered");
                Ok(Some(Device {
                    device_id: device_id.to_string(),
                    public_key: public_key.to_string(),
                    key_version: 1,
                    registered_at: now,
                    last_seen_at: None,
                }))
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                tracing::debug!(device_id, "device already registered");
                Ok(None)
            }
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// Get a device by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, device_id: &str) -> Result<Option<Device>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.query_row(
            "SELECT device_id, public_key, key_version, registered_at, last_seen_at
             FROM devices WHERE device_id = ?1",
            [device_id],
            |row| {
                Ok(Device {
                    device_id: row.get(0)?,
                    public_key: row.get(1)?,
                    key_version: row.get(2)?,
                    registered_at: parse_datetime(&row.get::<_, String>(3)?),
                    last_seen_at: row
                        .get::<_, Option<String>>(4)?
                        .map(|s| parse_datetime(&s)),
                })
            },
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Swap the public key if it is still `expected_key`
    ///
    /// The key and its version change in a single statement. Returns the new
    /// key version, or `None` if the device is gone or its key has already
    /// moved on.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn swap_key(
        &self,
        device_id: &str,
        expected_key: &str,
        new_key: &str,
    ) -> Result<Option<i64>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.query_row(
            "UPDATE devices SET public_key = ?1, key_version = key_version + 1
             WHERE device_id = ?2 AND public_key = ?3
             RETURNING key_version",
            params![new_key, device_id, expected_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Record a successful authentication made with key `key_version`
    ///
    /// Returns the new last-seen timestamp, or `None` if the key was rotated in
    /// the meantime, in which case the authentication must not be honoured.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn touch(&self, device_id: &str, key_version: i64) -> Result<Option<DateTime<Utc>>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now();
        let rows = conn
            .execute(
                "UPDATE devices SET last_seen_at = ?1 WHERE device_id = ?2 AND key_version = ?3",
                params![now.to_rfc3339(), device_id, key_version],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok((rows > 0).then_some(now))
    }

    /// Count registered devices
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
