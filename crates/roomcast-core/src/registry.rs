//! Per-process room membership registry.
//!
//! Maps each room to the set of live local connections in it. Every read and
//! write of the mapping happens under one mutex that is held only for map
//! manipulation; callers that need to perform I/O take a [`snapshot`] first.
//!
//! [`snapshot`]: RoomRegistry::snapshot

use crate::connection::{Connection, ConnectionId};
use roomcast_protocol::validate_room_id;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection is already a member of a room.
    #[error("Connection {connection} already joined room {room}")]
    AlreadyJoined {
        /// The offending connection.
        connection: ConnectionId,
        /// Room it is currently registered in.
        room: String,
    },

    /// The connection was assigned a different room at handshake.
    #[error("Connection belongs to room {assigned}, not {requested}")]
    RoomMismatch {
        /// Room recorded on the connection.
        assigned: String,
        /// Room passed to `join`.
        requested: String,
    },

    /// Invalid room identifier.
    #[error("Invalid room identifier: {0}")]
    InvalidRoom(&'static str),
}

/// A point-in-time copy of a room's members.
pub type Snapshot = Vec<Arc<dyn Connection>>;

#[derive(Default)]
struct Inner {
    /// Room id -> members.
    rooms: HashMap<String, HashMap<ConnectionId, Arc<dyn Connection>>>,
    /// Connection id -> room id, enforces single membership.
    memberships: HashMap<ConnectionId, String>,
}

/// Room membership registry.
#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<Inner>,
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `connection` into `room_id`, creating the room if absent.
    ///
    /// Returns the room's member count after the insert.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already registered anywhere,
    /// if it was assigned another room, or if the room id is invalid. The
    /// mapping is left untouched on error.
    pub fn join(
        &self,
        room_id: &str,
        connection: Arc<dyn Connection>,
    ) -> Result<usize, RegistryError> {
        validate_room_id(room_id).map_err(RegistryError::InvalidRoom)?;

        if connection.room_id() != room_id {
            return Err(RegistryError::RoomMismatch {
                assigned: connection.room_id().to_string(),
                requested: room_id.to_string(),
            });
        }

        let id = connection.id().clone();
        let mut inner = self.lock();

        if let Some(room) = inner.memberships.get(&id) {
            return Err(RegistryError::AlreadyJoined {
                connection: id,
                room: room.clone(),
            });
        }

        inner.memberships.insert(id.clone(), room_id.to_string());
        let members = inner.rooms.entry(room_id.to_string()).or_default();
        members.insert(id.clone(), connection);
        let count = members.len();

        debug!(room = %room_id, connection = %id, members = count, "Joined room");
        Ok(count)
    }

    /// Remove `connection_id` from `room_id`, pruning the room if it empties.
    ///
    /// Returns `true` if the connection was removed by this call. Repeated
    /// calls, or calls naming a room the connection is not in, return
    /// `false` and change nothing.
    pub fn leave(&self, room_id: &str, connection_id: &ConnectionId) -> bool {
        let mut inner = self.lock();

        match inner.memberships.get(connection_id) {
            Some(room) if room == room_id => {}
            _ => return false,
        }
        inner.memberships.remove(connection_id);

        let remaining = match inner.rooms.get_mut(room_id) {
            Some(members) => {
                members.remove(connection_id);
                members.len()
            }
            None => 0,
        };
        if remaining == 0 {
            inner.rooms.remove(room_id);
        }

        debug!(room = %room_id, connection = %connection_id, members = remaining, "Left room");
        true
    }

    /// Copy out the current members of `room_id`.
    ///
    /// The copy is detached from the registry, so the caller may perform
    /// slow I/O on it without holding the lock.
    #[must_use]
    pub fn snapshot(&self, room_id: &str) -> Snapshot {
        self.lock()
            .rooms
            .get(room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of members in `room_id`.
    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.lock().rooms.get(room_id).map_or(0, HashMap::len)
    }

    /// Whether `connection_id` is registered in any room.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.lock().memberships.contains_key(connection_id)
    }

    /// Whether `room_id` has an entry.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.lock().rooms.contains_key(room_id)
    }

    /// Ids of all rooms with at least one member.
    #[must_use]
    pub fn room_ids(&self) -> Vec<String> {
        self.lock().rooms.keys().cloned().collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            room_count: inner.rooms.len(),
            connection_count: inner.memberships.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of rooms with members.
    pub room_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
}
