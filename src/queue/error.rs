use thiserror::Error;

use crate::redis::PoolError;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue name not in the registry
    #[error("Queue '{0}' is not registered")]
    UnknownQueue(String),

    #[error("Queue '{queue}' does not handle task '{task}'")]
    UnknownTask { queue: String, task: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No processor registered for queue '{0}'")]
    MissingProcessor(String),

    #[error("Invalid queue configuration: {0}")]
    Config(String),

    #[error("Queue manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Circuit breaker open or connection lost
    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt job record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<PoolError> for StoreError {
    fn from(err: PoolError) -> Self {
        if err.is_transient() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Redis(err.to_string())
        }
    }
}
