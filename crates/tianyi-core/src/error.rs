use thiserror::Error;

#[derive(Debug, Error)]
pub enum TianyiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream service error ({service}): {reason}")]
    Upstream { service: String, reason: String },

    #[error("State error: {0}")]
    State(String),

    /// Recoverable contention, e.g. an optimistic-lock loss on the hot
    /// cache. Never surfaced to clients.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TianyiError {
    /// Short error code string carried in logs and error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            TianyiError::Config(_) => "CONFIG_ERROR",
            TianyiError::AuthFailed(_) => "AUTH_FAILED",
            TianyiError::Validation(_) => "VALIDATION_ERROR",
            TianyiError::NotFound(_) => "NOT_FOUND",
            TianyiError::Upstream { .. } => "UPSTREAM_ERROR",
            TianyiError::State(_) => "STATE_ERROR",
            TianyiError::Transient(_) => "TRANSIENT",
            TianyiError::Database(_) => "DATABASE_ERROR",
            TianyiError::Serialization(_) => "SERIALIZATION_ERROR",
            TianyiError::Io(_) => "IO_ERROR",
            TianyiError::Timeout { .. } => "TIMEOUT",
            TianyiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the client may see the message verbatim. Everything else
    /// becomes a generic 5xx at the gateway boundary.
    pub fn is_client_visible(&self) -> bool {
        matches!(
            self,
            TianyiError::AuthFailed(_) | TianyiError::Validation(_) | TianyiError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TianyiError>;
