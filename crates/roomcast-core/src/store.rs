//! Interfaces to the external persistence collaborators.
//!
//! The realtime subsystem never owns durable state. It hands new messages to
//! a [`MessageStore`], replays history from it, and consults directories for
//! rooms and display names. [`MemoryStore`] implements all three in process.

use crate::message::{Message, Room};
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backing store failed.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a newly sent message.
    async fn create_message(&self, message: &Message) -> Result<(), StoreError>;

    /// All messages of a room, oldest first.
    async fn list_messages(&self, room_id: &str) -> Result<Vec<Message>, StoreError>;
}

/// Room lookup.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Find a room by its join code.
    async fn find_room_by_code(&self, code: &str) -> Result<Room, StoreError>;
}

/// User lookup.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Display name of a user.
    async fn find_user_display_name(&self, user_id: &str) -> Result<String, StoreError>;
}

/// Resolve a display name, falling back to the id itself on any failure.
pub async fn display_name_or_id(users: &dyn UserDirectory, user_id: &str) -> String {
    match users.find_user_display_name(user_id).await {
        Ok(name) if !name.is_empty() => name,
        Ok(_) => user_id.to_string(),
        Err(e) => {
            debug!(user = %user_id, error = %e, "Display name lookup failed");
            user_id.to_string()
        }
    }
}

/// In-memory implementation of every collaborator interface.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<String, Vec<Message>>,
    rooms: DashMap<String, Room>,
    users: DashMap<String, String>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room and return it.
    pub fn create_room(&self, name: impl Into<String>, code: impl Into<String>) -> Room {
        let room = Room::new(name, code);
        self.rooms.insert(room.code.clone(), room.clone());
        room
    }

    /// Register a user's display name.
    pub fn add_user(&self, user_id: impl Into<String>, display_name: impl Into<String>) {
        self.users.insert(user_id.into(), display_name.into());
    }

    /// Number of stored messages in a room.
    #[must_use]
    pub fn message_count(&self, room_id: &str) -> usize {
        self.messages.get(room_id).map_or(0, |m| m.len())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
        self.messages
            .entry(message.room_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, room_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut messages = self
            .messages
            .get(room_id)
            .map(|m| m.clone())
            .unwrap_or_default();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }
}

#[async_trait]
impl RoomDirectory for MemoryStore {
    async fn find_room_by_code(&self, code: &str) -> Result<Room, StoreError> {
        self.rooms
            .get(code)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::NotFound(format!("room {code}")))
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_user_display_name(&self, user_id: &str) -> Result<String, StoreError> {
        self.users
            .get(user_id)
            .map(|n| n.clone())
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
    }
}
