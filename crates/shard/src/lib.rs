//! Gateway shard connections.
//!
//! One [`DiscordHandler`] drives one shard's session on top of
//! `common::WsManager`:
//!
//! ```text
//! WsManager (socket, heartbeat timer, backoff)
//!     ↓ text frames
//! DiscordHandler ── Hello/Ready/Resumed/... → Session state machine
//!     ↓ dispatch frames, in arrival order
//! normalize → EntityCache::apply → Publish (routing key = event type)
//! ```
//!
//! The [`ShardRegistry`] mirrors each shard's state and owns the command
//! senders used to write payloads on a live connection.

pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod session;

pub use error::ShardError;
pub use handler::{DiscordHandler, ShardConfig};
pub use registry::{ShardRegistry, ShardStatus};
pub use session::{HelloAction, Session, ShardState};
