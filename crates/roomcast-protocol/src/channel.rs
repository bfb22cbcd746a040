//! Room identifiers and their bus channel names.
//!
//! Every process derives the channel for a room with the same pure function,
//! so no lookup is needed to find where a room's traffic lives.

/// Prefix shared by every room channel on the bus.
pub const CHANNEL_PREFIX: &str = "chat:room:";

/// Maximum room identifier length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Validate a room identifier taken from a handshake.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_room_id(room_id: &str) -> Result<(), &'static str> {
    if room_id.is_empty() {
        return Err("Room identifier cannot be empty");
    }
    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room identifier too long");
    }
    if !room_id
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control() && c != ' ')
    {
        return Err("Room identifier contains invalid characters");
    }
    Ok(())
}

/// Bus channel carrying the traffic of `room_id`.
#[must_use]
pub fn channel_for_room(room_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{room_id}")
}

/// Recover the room identifier from a channel name.
#[must_use]
pub fn room_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(CHANNEL_PREFIX)
        .filter(|room| !room.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_naming_is_deterministic() {
        assert_eq!(channel_for_room("R1"), "chat:room:R1");
        assert_eq!(channel_for_room("R1"), channel_for_room("R1"));
        assert_eq!(room_from_channel("chat:room:R1"), Some("R1"));
        assert_eq!(room_from_channel("chat:room:"), None);
        assert_eq!(room_from_channel("other:R1"), None);
    }

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("aB3xYz9_Q-12").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("has space").is_err());
        assert!(validate_room_id("tab\there").is_err());
        assert!(validate_room_id(&"r".repeat(MAX_ROOM_ID_LENGTH + 1)).is_err());
    }
}
