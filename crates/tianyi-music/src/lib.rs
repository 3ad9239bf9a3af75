pub mod error;
pub mod knowledge;
pub mod library;
pub mod types;

pub use error::{MusicError, Result};
pub use library::SongLibrary;
pub use types::{LyricLine, SongMetadata, SongSegment};
