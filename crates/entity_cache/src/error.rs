//! Error types for the entity cache.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The type tag does not name a cached entity type.
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Valid type, no matching instance.
    #[error("Entity not found")]
    NotFound,

    /// Wrong number of arguments for the entity type.
    #[error("{kind} takes {expected} argument(s), got {got}")]
    InvalidArguments {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    /// Event body of a recognized type is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
