//! Control messages sent to a running WsManager.

use std::time::Duration;

/// Commands that can be sent to a WsManager at runtime.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Forward a raw text payload on the live connection.
    Send(String),
    /// Graceful shutdown
    Shutdown,
}

/// Instructions a handler returns from `on_message` for the manager to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Write a text frame to the socket.
    Send(String),
    /// (Re)start the heartbeat timer with the given period.
    StartHeartbeat(Duration),
    /// Drop the current socket and reconnect.
    Reconnect,
    /// The upstream accepted the session. The reconnect backoff starts over
    /// after this connection ends.
    SessionReady,
}
