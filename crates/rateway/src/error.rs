//! Error types for the rateway worker.

use shard::ShardError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shard {0} is not connected")]
    ShardNotConnected(u64),

    #[error("Malformed command envelope: {0}")]
    MalformedCommandEnvelope(String),

    #[error("Malformed cache query: {0}")]
    MalformedCacheQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker error: {0}")]
    Broker(String),
}

impl From<ShardError> for Error {
    fn from(e: ShardError) -> Self {
        match e {
            ShardError::NotConnected(id) | ShardError::QueueFull(id) => Error::ShardNotConnected(id),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
