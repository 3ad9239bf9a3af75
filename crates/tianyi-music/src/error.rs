use thiserror::Error;
use tianyi_core::error::TianyiError;

#[derive(Debug, Error)]
pub enum MusicError {
    #[error("song not found: {0}")]
    SongNotFound(String),

    #[error("segment '{segment}' not found in song '{song}'")]
    SegmentNotFound { song: String, segment: String },

    #[error("audio file missing: {0}")]
    AudioMissing(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MusicError> for TianyiError {
    fn from(e: MusicError) -> Self {
        match e {
            MusicError::SongNotFound(_)
            | MusicError::SegmentNotFound { .. }
            | MusicError::AudioMissing(_) => TianyiError::NotFound(e.to_string()),
            MusicError::Database(err) => TianyiError::Database(err.to_string()),
            MusicError::Io(err) => TianyiError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, MusicError>;
