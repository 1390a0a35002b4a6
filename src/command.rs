//! Command type submitted by producers.

use serde::{Deserialize, Serialize};

/// A requested state-changing operation.
///
/// The core treats both fields as opaque text: `command_type` names the
/// operation and `body` carries its payload. An empty body is valid.
/// Serialized with a `"type"` field so transports can exchange the same
/// shape they would for events.
///
/// # Examples
///
/// ```
/// use command_postbox::Command;
///
/// let cmd = Command::new("deposit", "25");
/// assert_eq!(cmd.command_type, "deposit");
/// assert_eq!(cmd.body, "25");
///
/// let bare = Command::new("ping", "");
/// assert!(bare.body.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Identifies the requested operation.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Operation payload; interpretation is up to the state machine.
    #[serde(default)]
    pub body: String,
}

impl Command {
    /// Create a command from its type and body.
    ///
    /// # Arguments
    ///
    /// * `command_type` - Any value convertible to `String` naming the operation.
    /// * `body` - Any value convertible to `String` carrying the payload.
    pub fn new(command_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            body: body.into(),
        }
    }
}
