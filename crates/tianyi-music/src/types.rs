use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One lyric line of a singable segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LyricLine {
    /// Sung duration in seconds.
    #[serde(default)]
    pub duration: f64,
    pub content: String,
}

/// A singable slice of a song.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongSegment {
    pub description: String,
    /// Offsets into the full track, in seconds.
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
    #[serde(default)]
    pub lyrics: Vec<LyricLine>,
}

/// Everything known about one song in the on-disk library.
#[derive(Debug, Clone)]
pub struct SongMetadata {
    pub title: String,
    pub description: String,
    pub song_path: PathBuf,
    pub lrc_path: PathBuf,
    pub lrc_offset: f64,
    pub segments: Vec<SongSegment>,
}

/// Shape of the per-song `<dir>.json` config file.
#[derive(Debug, Deserialize)]
pub(crate) struct SongConfigFile {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lrc_offset: f64,
    #[serde(default)]
    pub segments: Vec<SongSegment>,
}
