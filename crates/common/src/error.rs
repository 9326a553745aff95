//! Error types for upstream WebSocket connections.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// TCP, TLS or WebSocket upgrade failed before the session started.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Upstream closed the socket. Carries the close code when one was sent.
    #[error("Connection closed (code: {0:?})")]
    ConnectionClosed(Option<u16>),

    /// The handler asked for a fresh connection (e.g. a server reconnect request).
    #[error("Reconnect requested")]
    ReconnectRequested,

    /// No heartbeat acknowledgement arrived since the previous heartbeat.
    #[error("Heartbeat not acknowledged")]
    ZombieConnection,

    /// The connection can never succeed again (bad token, invalid shard, ...).
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the manager should stop reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
