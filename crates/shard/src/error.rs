//! Shard command errors.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShardError {
    /// No live connection for the shard (unknown id, or not in the Connected state).
    #[error("Shard {0} is not connected")]
    NotConnected(u64),

    /// The shard's command channel is full.
    #[error("Shard {0} command queue is full")]
    QueueFull(u64),
}
