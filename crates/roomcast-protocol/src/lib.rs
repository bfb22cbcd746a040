//! # roomcast-protocol
//!
//! Wire definitions for the roomcast realtime delivery subsystem.
//!
//! Three kinds of payload cross process boundaries:
//!
//! - `ServerEvent` - JSON text frames pushed to WebSocket clients
//! - `ClientFrame` - JSON text frames sent by clients (`{"content":"hi"}`)
//! - `BusEnvelope` - a `ServerEvent` tagged with the publishing node, as
//!   carried over the shared bus
//!
//! Field names of `ServerEvent` are part of the client contract and must not
//! change.
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{channel, codec, ClientFrame};
//!
//! let frame: ClientFrame = codec::decode_client(r#"{"content":"hi"}"#, 1024).unwrap();
//! assert_eq!(frame.content, "hi");
//! assert_eq!(channel::channel_for_room("R1"), "chat:room:R1");
//! ```

pub mod channel;
pub mod codec;
pub mod frames;

pub use channel::{channel_for_room, validate_room_id, CHANNEL_PREFIX};
pub use codec::ProtocolError;
pub use frames::{BusEnvelope, ClientFrame, ServerEvent};
