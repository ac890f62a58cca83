//! NetApp realtime connection and wire protocol

pub mod connection;
pub mod protocol;

pub use connection::{ConnectionManager, ConnectionState, EventHandlers};
pub use protocol::{CommandResult, ControlCmdType, ControlCommand, Envelope};
