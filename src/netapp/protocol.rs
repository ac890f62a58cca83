//! Control-command protocol
//!
//! Wire shapes exchanged with a NetApp over the realtime connection. Both
//! channels carry JSON envelopes of the form `{"event": <name>, "data": ...}`.
//! The control channel correlates each `command` event with exactly one
//! `command_result` or `command_error` event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Path of the control channel on the NetApp interface
pub const CONTROL_CHANNEL: &str = "/control";
/// Path of the data channel on the NetApp interface
pub const DATA_CHANNEL: &str = "/data";

/// Event name of an outbound control command
pub const COMMAND_EVENT: &str = "command";
/// Event name of a correlated command result
pub const COMMAND_RESULT_EVENT: &str = "command_result";
/// Event name of a correlated command error
pub const COMMAND_ERROR_EVENT: &str = "command_error";

// =============================================================================
// Control Commands
// =============================================================================

/// Kinds of control commands understood by a NetApp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCmdType {
    /// Initialize the NetApp session with caller-supplied parameters
    Init,
    /// Replace the NetApp session state
    SetState,
    /// Query the NetApp session state
    GetState,
}

impl std::fmt::Display for ControlCmdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlCmdType::Init => write!(f, "init"),
            ControlCmdType::SetState => write!(f, "set_state"),
            ControlCmdType::GetState => write!(f, "get_state"),
        }
    }
}

/// A typed request sent over the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub cmd_type: ControlCmdType,
    /// Ask the NetApp to drop any queued-but-unprocessed data first
    pub clear_queue: bool,
    /// Command-specific payload
    pub data: Value,
}

impl ControlCommand {
    pub fn new(cmd_type: ControlCmdType, clear_queue: bool, data: Value) -> Self {
        Self {
            cmd_type,
            clear_queue,
            data,
        }
    }

    /// The registration handshake command
    pub fn init(data: Value) -> Self {
        Self::new(ControlCmdType::Init, true, data)
    }
}

/// Outcome of a control command, correlated to the command that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// Wire Envelope
// =============================================================================

/// The framing shared by both channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Wrap a control command for transmission
    pub fn command(command: &ControlCommand) -> Result<Self> {
        let data = serde_json::to_value(command)
            .map_err(|e| Error::Transport(format!("failed to encode command: {e}")))?;
        Ok(Self::new(COMMAND_EVENT, data))
    }

    /// Serialize to the JSON text frame sent on the wire
    pub fn to_frame(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Transport(format!("failed to encode envelope: {e}")))
    }

    /// Parse an inbound JSON text frame. Malformed frames yield `None`; the
    /// caller logs and drops them.
    pub fn parse_frame(frame: &str) -> Option<Self> {
        serde_json::from_str(frame).ok()
    }
}

/// Replies routed to the pending command correlation slot
#[derive(Debug, Clone)]
pub enum CommandReply {
    Result(CommandResult),
    Error(String),
}

/// Classify an inbound control-channel envelope. Returns `None` for events
/// that do not belong to the command protocol.
pub fn classify_control_event(envelope: &Envelope) -> Option<CommandReply> {
    match envelope.event.as_str() {
        COMMAND_RESULT_EVENT => {
            let result: CommandResult = serde_json::from_value(envelope.data.clone()).ok()?;
            Some(CommandReply::Result(result))
        }
        COMMAND_ERROR_EVENT => {
            let message = envelope
                .data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified command error")
                .to_string();
            Some(CommandReply::Error(message))
        }
        _ => None,
    }
}
