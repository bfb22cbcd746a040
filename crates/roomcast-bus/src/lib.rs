//! # roomcast-bus
//!
//! Cross-process delivery for roomcast rooms.
//!
//! - **Bus** - publish/subscribe transport shared by gateway processes
//! - **MemoryBus** - in-process implementation, for single-node setups and tests
//! - **RedisBus** - Redis Pub/Sub with reconnect backoff
//! - **BusBridge** - one subscription per locally populated room, plus the
//!   publish path
//!
//! ```rust,ignore
//! use roomcast_bus::{BusBridge, MemoryBus};
//!
//! let bridge = BusBridge::new(node_id, Arc::new(MemoryBus::new()), broadcaster, timeout);
//! bridge.join(connection).await?;
//! bridge.publish("R1", &event).await?;
//! ```

pub mod backoff;
pub mod bridge;
pub mod memory;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis_bus;

pub use backoff::BackoffConfig;
pub use bridge::{BridgeError, BusBridge, DEFAULT_SUBSCRIBE_TIMEOUT};
pub use memory::MemoryBus;
pub use traits::{Bus, BusError, PayloadHandler, Subscription};

#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;
