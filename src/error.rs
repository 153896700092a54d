//! Error types for streamq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Returned by `create_group` when the consumer group is already there.
    #[error("consumer group already exists: {0}")]
    AlreadyExists(String),

    #[error("reading {requested} streams in one call is not supported")]
    MultiStreamUnsupported { requested: usize },

    #[error("invalid message id: {0}")]
    InvalidMessageId(String),

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
