//! Envelope types for the roomcast wire protocol.
//!
//! Client-facing frames are flat JSON records discriminated by a `type`
//! field. The bus wraps the same record together with the id of the node
//! that published it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event discriminator for a chat message.
pub const NEW_MESSAGE: &str = "new_message";

/// A frame pushed from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A chat message posted to a room.
    #[serde(rename = "new_message")]
    NewMessage {
        /// Message identifier.
        id: String,
        /// Room the message belongs to.
        room_id: String,
        /// Stable identifier of the sender.
        sender_id: String,
        /// Display name of the sender, falls back to `sender_id`.
        username: String,
        /// Message text, never empty.
        content: String,
        /// Creation timestamp.
        created_at: DateTime<Utc>,
    },

    /// A rejected client frame.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },
}

impl ServerEvent {
    /// Create a `new_message` event.
    #[must_use]
    pub fn new_message(
        id: impl Into<String>,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        username: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        ServerEvent::NewMessage {
            id: id.into(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            username: username.into(),
            content: content.into(),
            created_at,
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Room the event is scoped to, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ServerEvent::NewMessage { room_id, .. } => Some(room_id),
            ServerEvent::Error { .. } => None,
        }
    }
}

/// A text frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Message text.
    pub content: String,
}

/// A `ServerEvent` as it travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Id of the gateway process that published the event.
    pub origin: String,
    /// The event itself.
    pub event: ServerEvent,
}

impl BusEnvelope {
    /// Wrap an event published by `origin`.
    #[must_use]
    pub fn new(origin: impl Into<String>, event: ServerEvent) -> Self {
        Self {
            origin: origin.into(),
            event,
        }
    }
}
