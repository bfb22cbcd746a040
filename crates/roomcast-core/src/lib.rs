//! # roomcast-core
//!
//! Process-local building blocks of the roomcast realtime delivery subsystem.
//!
//! - **Auth** - bearer token validation for the handshake
//! - **Connection** - the live stream abstraction
//! - **Registry** - room membership, one mutex, snapshot reads
//! - **Broadcast** - fan-out to a room snapshot with per-write timeouts
//! - **Store** - interfaces to the external persistence collaborators
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  join/leave  ┌──────────────┐  snapshot  ┌─────────────┐
//! │  Gateway    │─────────────▶│ RoomRegistry │◀───────────│ Broadcaster │
//! └─────────────┘              └──────────────┘            └─────────────┘
//!                                                                │ send_text
//!                                                                ▼
//!                                                          ┌─────────────┐
//!                                                          │ Connection  │
//!                                                          └─────────────┘
//! ```

pub mod auth;
pub mod broadcast;
pub mod connection;
pub mod message;
pub mod registry;
pub mod store;

pub use auth::{AuthError, TokenValidator};
pub use broadcast::{BroadcastReport, Broadcaster};
pub use connection::{ChannelConnection, Connection, ConnectionId, SendError};
pub use message::{Message, Room};
pub use registry::{RegistryError, RegistryStats, RoomRegistry, Snapshot};
pub use store::{MemoryStore, MessageStore, RoomDirectory, StoreError, UserDirectory};
