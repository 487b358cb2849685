//! Live connection table
//!
//! Maps a device to its single live connection. Registering a second
//! connection for a device signals the first one to close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use uuid::Uuid;

/// Handle held by a registered connection
#[derive(Debug)]
pub struct ConnectionLease {
    /// Identifies this connection in the table
    pub connection_id: Uuid,

    /// Resolves when a newer connection for the same device replaces this one
    pub superseded: oneshot::Receiver<()>,
}

struct LiveConnection {
    connection_id: Uuid,
    supersede: oneshot::Sender<()>,
}

/// Device-to-connection table
#[derive(Clone, Default)]
pub struct ConnectionTable {
    live: Arc<Mutex<HashMap<String, LiveConnection>>>,
}

impl ConnectionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new connection to `device_id`, superseding any existing one
    #[must_use]
    pub fn register(&self, device_id: &str) -> ConnectionLease {
        let (supersede, superseded) = oneshot::channel();
        let connection_id = Uuid::new_v4();

        let previous = self.lock().insert(
            device_id.to_string(),
            LiveConnection {
                connection_id,
                supersede,
            },
        );

        if let Some(previous) = previous {
            tracing::info!(
                device_id,
                old = %previous.connection_id,
                new = %connection_id,
                "connection superseded"
            );
            // The old connection may already be gone
            let _ = previous.supersede.send(());
        }

        ConnectionLease {
            connection_id,
            superseded,
        }
    }

    /// Remove the binding if it still belongs to `connection_id`
    ///
    /// Returns false if a newer connection already took over.
    pub fn release(&self, device_id: &str, connection_id: Uuid) -> bool {
        let mut live = self.lock();
        if live
            .get(device_id)
            .is_some_and(|c| c.connection_id == connection_id)
        {
            live.remove(device_id);
            return true;
        }
        false
    }

    /// Whether `device_id` has a live connection
    #[must_use]
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.lock().contains_key(device_id)
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no connection is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LiveConnection>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
