//! Chat message and room records.
//!
//! These mirror what the external store persists. A `Message` can only be
//! built with non-empty content, so nothing downstream of the gateway ever
//! sees an empty one.

use chrono::{DateTime, Utc};
use roomcast_protocol::{ProtocolError, ServerEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Room the message was posted to.
    pub room_id: String,
    /// Stable identifier of the sender.
    pub sender_id: String,
    /// Message text.
    pub content: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message stamped with a fresh id and the current time.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::EmptyContent`] if `content` is blank.
    pub fn new(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ProtocolError::EmptyContent);
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            content,
            created_at: Utc::now(),
        })
    }

    /// Build the client-facing event, tagged with the sender's display name.
    #[must_use]
    pub fn to_event(&self, username: impl Into<String>) -> ServerEvent {
        ServerEvent::new_message(
            self.id.clone(),
            self.room_id.clone(),
            self.sender_id.clone(),
            username,
            self.content.clone(),
            self.created_at,
        )
    }
}

/// A chat room, addressed by a short join code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Unique room identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Join code.
    pub code: String,
}

impl Room {
    /// Create a room record.
    #[must_use]
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            code: code.into(),
        }
    }
}
