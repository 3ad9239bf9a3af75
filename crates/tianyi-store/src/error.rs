use thiserror::Error;
use tianyi_core::error::TianyiError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("vector index error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vector index rejected request ({status}): {message}")]
    VectorApi { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("cache operation timed out")]
    CacheTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for TianyiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(err) => TianyiError::Database(err.to_string()),
            StoreError::Cache(err) => TianyiError::Transient(err.to_string()),
            StoreError::Http(err) => TianyiError::Upstream {
                service: "vector-index".to_string(),
                reason: err.to_string(),
            },
            StoreError::VectorApi { status, message } => TianyiError::Upstream {
                service: "vector-index".to_string(),
                reason: format!("status {status}: {message}"),
            },
            StoreError::Serialization(err) => TianyiError::Serialization(err),
            StoreError::UserNotFound(id) => TianyiError::NotFound(format!("user {id}")),
            StoreError::CacheTimeout => TianyiError::Timeout {
                ms: tianyi_core::config::CACHE_OP_TIMEOUT_MS,
            },
            StoreError::Io(err) => TianyiError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
