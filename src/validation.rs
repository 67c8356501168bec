//! Request validation for everything that ends up on the CLI's stdin.
//!
//! The CLI reads one command per line, so a stray CR/LF inside a request would
//! smuggle a second command into the session and desynchronise response framing.
//! Every handler validates before touching the command queue.

/// Maximum UTF-8 payload of a channel message (LoRa frame limit after protocol overhead).
pub const MAX_MESSAGE_BYTES: usize = 200;

/// Channel slots supported by MeshCore devices.
pub const MAX_CHANNEL_INDEX: u8 = 7;

/// Validation errors with client-facing messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("selector must be a non-empty string")]
    EmptySelector,

    #[error("Command cannot be empty")]
    EmptyCommand,

    #[error("Command contains line breaks or control characters")]
    ControlCharacters,

    #[error("Message text cannot be empty")]
    EmptyText,

    #[error("Message too long ({bytes} bytes). Maximum {max} bytes allowed due to LoRa constraints.")]
    MessageTooLong { bytes: usize, max: usize },

    #[error("Invalid channel index {0} (expected 0-{max})", max = MAX_CHANNEL_INDEX)]
    InvalidChannel(i64),

    #[error("Invalid last_seen parameter: {0}")]
    InvalidLastSeen(String),

    #[error("Invalid hours value (must be positive integer)")]
    InvalidHours,
}

fn has_control_chars(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

/// A selector (contact name or key prefix) for `add_pending`.
pub fn validate_selector(selector: &str) -> Result<&str, ValidationError> {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptySelector);
    }
    if has_control_chars(trimmed) {
        return Err(ValidationError::ControlCharacters);
    }
    Ok(trimmed)
}

/// A full command line destined for the CLI's stdin.
pub fn validate_command_line(command: &str) -> Result<&str, ValidationError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyCommand);
    }
    if has_control_chars(trimmed) {
        return Err(ValidationError::ControlCharacters);
    }
    Ok(trimmed)
}

/// Channel message text; the byte limit counts UTF-8 bytes, not characters.
pub fn validate_message_text(text: &str) -> Result<&str, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyText);
    }
    if has_control_chars(trimmed) {
        return Err(ValidationError::ControlCharacters);
    }
    let bytes = trimmed.len();
    if bytes > MAX_MESSAGE_BYTES {
        return Err(ValidationError::MessageTooLong {
            bytes,
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(trimmed)
}

/// Inactivity threshold for contact cleanup: a JSON integer of at least 1.
/// Floats, strings and booleans are rejected rather than coerced.
pub fn validate_hours(value: &serde_json::Value) -> Result<u32, ValidationError> {
    value
        .as_u64()
        .filter(|h| *h >= 1)
        .and_then(|h| u32::try_from(h).ok())
        .ok_or(ValidationError::InvalidHours)
}

pub fn validate_channel_index(index: i64) -> Result<u8, ValidationError> {
    if (0..=MAX_CHANNEL_INDEX as i64).contains(&index) {
        Ok(index as u8)
    } else {
        Err(ValidationError::InvalidChannel(index))
    }
}
