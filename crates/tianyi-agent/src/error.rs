use thiserror::Error;
use tianyi_core::error::TianyiError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("model output unparseable: {0}")]
    Parse(String),

    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error(transparent)]
    Store(#[from] tianyi_store::StoreError),

    #[error(transparent)]
    Music(#[from] tianyi_music::MusicError),

    #[error(transparent)]
    Speech(#[from] tianyi_speech::SpeechError),

    #[error(transparent)]
    Vision(#[from] tianyi_vision::VisionError),
}

impl From<AgentError> for TianyiError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Http(err) => TianyiError::Upstream {
                service: "llm".to_string(),
                reason: err.to_string(),
            },
            AgentError::Api { status, message } => TianyiError::Upstream {
                service: "llm".to_string(),
                reason: format!("status {status}: {message}"),
            },
            AgentError::Parse(msg) => TianyiError::Upstream {
                service: "llm".to_string(),
                reason: msg,
            },
            AgentError::Timeout { secs } => TianyiError::Timeout { ms: secs * 1000 },
            AgentError::Store(err) => err.into(),
            AgentError::Music(err) => err.into(),
            AgentError::Speech(err) => err.into(),
            AgentError::Vision(err) => err.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
