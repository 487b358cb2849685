//! Connection relay
//!
//! Bridges the message bus to authenticated persistent device connections.
//! The WebSocket surface lives in [`crate::api::websocket`]; this module holds
//! the transport-independent parts.

pub mod bus;
pub mod connections;

use std::sync::Arc;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, LocalBus, MessageBus, Subscription};
pub use connections::{ConnectionLease, ConnectionTable};

use crate::Result;

/// Bus channel prefix for per-device notifications
pub const CHANNEL_PREFIX: &str = "device-notifications";

/// Bus channel carrying messages for `device_id`
#[must_use]
pub fn device_channel(device_id: &str) -> String {
    format!("{CHANNEL_PREFIX}:{device_id}")
}

/// Routes published messages to live device connections
#[derive(Clone)]
pub struct ConnectionRelay {
    bus: Arc<dyn MessageBus>,
    connections: ConnectionTable,
}

impl ConnectionRelay {
    /// Create a relay over `bus`
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            connections: ConnectionTable::new(),
        }
    }

    /// Push a message to a device
    ///
    /// Best-effort: if the device has no live connection the message is
    /// dropped. Bus failures are logged, never returned. Returns the number
    /// of connections the message reached.
    pub async fn publish(&self, device_id: &str, message: impl Into<String> + Send) -> usize {
        match self.bus.publish(&device_channel(device_id), message.into()).await {
            Ok(delivered) => {
                tracing::debug!(device_id, delivered, "message published");
                delivered
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "publish failed");
                0
            }
        }
    }

    /// Claim the live slot for `device_id` and subscribe to its channel
    ///
    /// # Errors
    ///
    /// Returns error if the bus subscription fails; no slot is claimed then
    pub async fn attach(&self, device_id: &str) -> Result<(ConnectionLease, Subscription)> {
        let subscription = self.bus.subscribe(&device_channel(device_id)).await?;
        let lease = self.connections.register(device_id);
        tracing::info!(device_id, connection_id = %lease.connection_id, "device connected");
        Ok((lease, subscription))
    }

    /// Release the live slot held by `connection_id`
    pub fn detach(&self, device_id: &str, connection_id: uuid::Uuid) {
        let released = self.connections.release(device_id, connection_id);
        tracing::info!(device_id, %connection_id, released, "device disconnected");
    }

    /// Connection table
    #[must_use]
    pub const fn connections(&self) -> &ConnectionTable {
        &self.connections
    }
}
