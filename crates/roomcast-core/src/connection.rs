//! Connection abstraction shared by the registry and the broadcaster.
//!
//! A connection is one live bidirectional stream to a single peer. Its room
//! and user are fixed at handshake time. Implementations must make `close`
//! idempotent: the read loop and the broadcaster may both close the same
//! connection.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors writing to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection was already closed.
    #[error("Connection closed")]
    Closed,

    /// The write did not complete within the write timeout.
    #[error("Write timed out")]
    Timeout,

    /// The transport rejected the write.
    #[error("Send failed: {0}")]
    Failed(String),
}

/// A live connection registered in a room.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Room assigned at handshake.
    fn room_id(&self) -> &str;

    /// Subject of the validated token.
    fn user_id(&self) -> &str;

    /// Write one text frame.
    async fn send_text(&self, payload: &str) -> Result<(), SendError>;

    /// Close the transport. Calling this more than once is a no-op.
    async fn close(&self);

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;
}

/// An in-process connection whose frames land on a bounded channel.
///
/// Used for in-process subscribers and as a stand-in transport in tests.
/// Dropping the receiver makes every later write fail; a full channel makes
/// writes block until the broadcaster's write timeout fires.
pub struct ChannelConnection {
    id: ConnectionId,
    room_id: String,
    user_id: String,
    tx: mpsc::Sender<String>,
    open: AtomicBool,
}

impl ChannelConnection {
    /// Create a connection and the receiver for its outbound frames.
    #[must_use]
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: ConnectionId::generate(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            tx,
            open: AtomicBool::new(true),
        });
        (conn, rx)
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn send_text(&self, payload: &str) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.tx
            .send(payload.to_string())
            .await
            .map_err(|_| SendError::Closed)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("user_id", &self.user_id)
            .finish()
    }
}
