//! WebSocket handler trait for upstream protocol adapters.

use crate::error::{Error, Result};
use crate::messages::{ControlCommand, Directive};
use async_trait::async_trait;

/// Trait that protocol adapters implement to drive a WebSocket session.
/// The WsManager owns the socket and calls these methods when events occur.
#[async_trait]
pub trait WsHandler: Send + Sync + 'static {
    /// Returns the WebSocket URL to connect to.
    ///
    /// Called before every connection attempt, so it may change between
    /// attempts (e.g. a resume URL handed out by the server).
    fn url(&self) -> String;

    /// Called right after the WebSocket upgrade completes.
    /// Returns a message to send immediately, if any.
    async fn on_connect(&self) -> Option<String> {
        None
    }

    /// Called when a text message is received.
    /// Returns the directives the manager should carry out, in order.
    async fn on_message(&self, msg: &str) -> Result<Vec<Directive>>;

    /// Called when a binary message is received.
    /// Default implementation ignores binary messages.
    async fn on_binary_message(&self, _data: &[u8]) -> Result<Vec<Directive>> {
        Ok(Vec::new())
    }

    /// Builds the next heartbeat frame. Returning `Error::ZombieConnection`
    /// makes the manager drop the socket and reconnect.
    async fn heartbeat(&self) -> Result<String>;

    /// Maps an upstream close frame to the error the manager acts on.
    /// Return `Error::Fatal` to stop reconnecting.
    fn on_close(&self, code: Option<u16>) -> Error {
        Error::ConnectionClosed(code)
    }

    /// Called when the connection is lost (before reconnect attempt).
    async fn on_disconnect(&self, _reason: &Error) {}

    /// Called when a reconnection is successful.
    async fn on_reconnect(&self) {}

    /// Handle a control command.
    /// Returns the message to write to the socket, if any.
    async fn handle_command(&self, cmd: ControlCommand) -> Option<String> {
        match cmd {
            ControlCommand::Send(payload) => Some(payload),
            ControlCommand::Shutdown => None,
        }
    }
}
