//! Live connection tracking.
//!
//! At most one [`Connection`] per identity. Each connection carries a serial
//! number so teardown of a replaced connection can never remove the
//! connection that replaced it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use courier_shared::UserId;

use crate::transport::{Frame, FrameSink, TransportError};

/// One admitted client connection.
pub struct Connection {
    pub user: UserId,
    pub serial: u64,
    pub connected_at: DateTime<Utc>,
    sink: Mutex<Box<dyn FrameSink>>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(
        user: UserId,
        serial: u64,
        sink: Box<dyn FrameSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            user,
            serial,
            connected_at: Utc::now(),
            sink: Mutex::new(sink),
            cancel,
        }
    }

    /// Write one frame. The deadline covers waiting for the sink as well as
    /// the write itself.
    pub async fn send(&self, frame: Frame, deadline: Duration) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await
        };
        match tokio::time::timeout(deadline, write).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Send a close frame, bounded by `deadline`. Errors are irrelevant here.
    pub async fn close(&self, deadline: Duration) {
        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        if let Ok(Err(e)) = tokio::time::timeout(deadline, close).await {
            debug!(user = %self.user, serial = self.serial, error = %e, "close frame not sent");
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("user", &self.user)
            .field("serial", &self.serial)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// identity -> its single live connection.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<UserId, Arc<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn`, returning the connection it replaced, if any.
    pub fn insert(&mut self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let replaced = self.connections.insert(conn.user.clone(), conn);
        if let Some(old) = &replaced {
            debug!(user = %old.user, serial = old.serial, "replacing connection");
        }
        replaced
    }

    /// Remove `user`'s entry only if it is still connection `serial`.
    pub fn remove_if(&mut self, user: &UserId, serial: u64) -> Option<Arc<Connection>> {
        match self.connections.get(user) {
            Some(current) if current.serial == serial => self.connections.remove(user),
            _ => None,
        }
    }

    pub fn get(&self, user: &UserId) -> Option<Arc<Connection>> {
        self.connections.get(user).cloned()
    }

    /// Whether `serial` is still `user`'s live connection.
    pub fn is_current(&self, user: &UserId, serial: u64) -> bool {
        self.connections
            .get(user)
            .is_some_and(|c| c.serial == serial)
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.connections.contains_key(user)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
