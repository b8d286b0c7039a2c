//! Channel name rules.
//!
//! Channel names are short UTF-8 strings, conventionally dot-separated
//! (`robot.pose`, `sensors.lidar.front`). The `*` character is reserved for
//! subscription patterns and never appears in a published channel.

use crate::error::{FrameError, Result};

/// Maximum channel name length in bytes.
pub const MAX_CHANNEL_LEN: usize = 63;

/// Token separator used by conventional channel names.
pub const SEPARATOR: char = '.';

/// Wildcard character reserved for subscription patterns.
pub const WILDCARD: char = '*';

/// Check that `channel` may be published and carried in an envelope.
pub fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(invalid(channel, "empty"));
    }
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(invalid(channel, "longer than 63 bytes"));
    }
    if channel.chars().any(char::is_control) {
        return Err(invalid(channel, "contains control characters"));
    }
    if channel.contains(WILDCARD) {
        return Err(invalid(channel, "contains reserved wildcard '*'"));
    }
    Ok(())
}

/// Returns true if `channel` passes [`validate_channel`].
pub fn is_valid_channel(channel: &str) -> bool {
    validate_channel(channel).is_ok()
}

fn invalid(channel: &str, reason: &'static str) -> FrameError {
    FrameError::InvalidChannel {
        channel: channel.to_string(),
        reason,
    }
}
