use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{MusicError, Result};
use crate::types::{LyricLine, SongConfigFile, SongMetadata};

/// The on-disk song library.
///
/// Layout: `<resource_path>/songs/<dir>/{<dir>.mp3, <dir>.lrc, <dir>.json}`.
/// A song missing any of the three files is skipped with a warning. Segment
/// audio prefers a pre-rendered `<dir>.<n>.wav` (written by the add-song
/// pipeline, 1-based segment index) and falls back to the full track.
pub struct SongLibrary {
    songs: BTreeMap<String, SongMetadata>,
}

impl SongLibrary {
    pub fn load(resource_path: impl AsRef<Path>) -> Self {
        let music_lib = resource_path.as_ref().join("songs");
        let mut songs = BTreeMap::new();

        let entries = match std::fs::read_dir(&music_lib) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %music_lib.display(), error = %e, "music library unavailable");
                return Self { songs };
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let song_dir = entry.path();
            if !song_dir.is_dir() {
                continue;
            }
            let Some(name) = song_dir.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                continue;
            };

            let lyrics_file = song_dir.join(format!("{name}.lrc"));
            let audio_file = song_dir.join(format!("{name}.mp3"));
            let config_file = song_dir.join(format!("{name}.json"));
            if !lyrics_file.exists() || !audio_file.exists() || !config_file.exists() {
                warn!(song = %name, "song directory incomplete, skipping");
                continue;
            }

            let config: SongConfigFile = match std::fs::read_to_string(&config_file)
                .map_err(MusicError::Io)
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| {
                    MusicError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })) {
                Ok(config) => config,
                Err(e) => {
                    warn!(song = %name, error = %e, "song config unreadable, skipping");
                    continue;
                }
            };

            songs.insert(
                name.clone(),
                SongMetadata {
                    title: config.title.unwrap_or_else(|| name.clone()),
                    description: config.description,
                    song_path: audio_file,
                    lrc_path: lyrics_file,
                    lrc_offset: config.lrc_offset,
                    segments: config.segments,
                },
            );
        }

        info!(count = songs.len(), "song library loaded");
        Self { songs }
    }

    /// Strip book-title quotes and whitespace the model tends to echo.
    fn safe_name(song_name: &str) -> &str {
        song_name.trim().trim_matches(|c| c == '《' || c == '》')
    }

    pub fn get(&self, song_name: &str) -> Option<&SongMetadata> {
        self.songs.get(Self::safe_name(song_name))
    }

    /// Whether (and what) the agent can sing of a song, phrased for the
    /// model.
    pub fn can_sing(&self, song_name: &str) -> String {
        if song_name.trim().is_empty() {
            return "没有指定歌曲名称。".to_string();
        }
        match self.get(song_name) {
            None => "洛天依暂时不会唱这首歌。".to_string(),
            Some(song) => {
                let segments: Vec<&str> =
                    song.segments.iter().map(|s| s.description.as_str()).collect();
                format!(
                    "{}可以唱的唱段：{}",
                    song_name,
                    serde_json::to_string(&segments).unwrap_or_default()
                )
            }
        }
    }

    /// Up to `max` songs with their descriptions, as a JSON object.
    pub fn singable_songs(&self, max: usize) -> String {
        let listing: BTreeMap<&str, &str> = self
            .songs
            .iter()
            .take(max)
            .map(|(name, meta)| (name.as_str(), meta.description.as_str()))
            .collect();
        serde_json::to_string(&listing).unwrap_or_default()
    }

    /// Lyrics of one segment, joined for prompt injection.
    pub fn segment_lyrics(&self, song_name: &str, segment: &str) -> Option<String> {
        let song = self.get(song_name)?;
        let seg = song.segments.iter().find(|s| s.description == segment)?;
        Some(
            seg.lyrics
                .iter()
                .map(|l| l.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Lyric lines plus raw audio bytes for one segment.
    ///
    /// The add-song pipeline renders each segment to `<dir>.<n>.wav`
    /// (volume-normalised, sliced to the segment window); when that file is
    /// absent the full track is served and the client trims playback.
    pub fn segment_audio(
        &self,
        song_name: &str,
        segment: &str,
    ) -> Result<(Vec<LyricLine>, Vec<u8>)> {
        let song = self
            .get(song_name)
            .ok_or_else(|| MusicError::SongNotFound(song_name.to_string()))?;
        let (index, seg) = song
            .segments
            .iter()
            .enumerate()
            .find(|(_, s)| s.description == segment)
            .ok_or_else(|| MusicError::SegmentNotFound {
                song: song_name.to_string(),
                segment: segment.to_string(),
            })?;

        let rendered = song
            .song_path
            .with_file_name(format!(
                "{}.{}.wav",
                Self::safe_name(song_name),
                index + 1
            ));
        let audio_path = if rendered.exists() {
            rendered
        } else {
            song.song_path.clone()
        };
        if !audio_path.exists() {
            return Err(MusicError::AudioMissing(audio_path.display().to_string()));
        }
        let bytes = std::fs::read(&audio_path)?;
        Ok((seg.lyrics.clone(), bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_song(root: &Path, name: &str, config: serde_json::Value) {
        let dir = root.join("songs").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{name}.mp3")), b"mp3-bytes").unwrap();
        std::fs::write(dir.join(format!("{name}.lrc")), "[00:00.00]歌词").unwrap();
        std::fs::write(dir.join(format!("{name}.json")), config.to_string()).unwrap();
    }

    fn library_with_song() -> (tempfile::TempDir, SongLibrary) {
        let dir = tempfile::tempdir().unwrap();
        write_song(
            dir.path(),
            "光与影的对白",
            serde_json::json!({
                "title": "光与影的对白",
                "description": "对唱曲",
                "lrc_offset": 0.5,
                "segments": [{
                    "description": "段落1",
                    "start_time": 10.0,
                    "end_time": 40.0,
                    "lyrics": [
                        {"duration": 2.5, "content": "第一句"},
                        {"duration": 3.0, "content": "第二句"}
                    ]
                }]
            }),
        );
        let lib = SongLibrary::load(dir.path());
        (dir, lib)
    }

    #[test]
    fn loads_complete_song_dirs_only() {
        let (dir, _) = library_with_song();
        // Incomplete song: missing audio.
        let broken = dir.path().join("songs").join("破碎");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("破碎.lrc"), "x").unwrap();
        std::fs::write(broken.join("破碎.json"), "{}").unwrap();

        let lib = SongLibrary::load(dir.path());
        assert!(lib.get("光与影的对白").is_some());
        assert!(lib.get("破碎").is_none());
    }

    #[test]
    fn can_sing_strips_title_quotes() {
        let (_dir, lib) = library_with_song();
        let answer = lib.can_sing("《光与影的对白》");
        assert!(answer.contains("段落1"), "{answer}");
        assert_eq!(lib.can_sing("不存在的歌"), "洛天依暂时不会唱这首歌。");
    }

    #[test]
    fn segment_audio_falls_back_to_full_track() {
        let (_dir, lib) = library_with_song();
        let (lyrics, audio) = lib.segment_audio("光与影的对白", "段落1").unwrap();
        assert_eq!(lyrics.len(), 2);
        assert_eq!(audio, b"mp3-bytes");

        assert!(matches!(
            lib.segment_audio("光与影的对白", "段落9"),
            Err(MusicError::SegmentNotFound { .. })
        ));
    }

    #[test]
    fn segment_audio_prefers_rendered_slice() {
        let (dir, _) = library_with_song();
        let seg_file = dir
            .path()
            .join("songs")
            .join("光与影的对白")
            .join("光与影的对白.1.wav");
        std::fs::write(&seg_file, b"sliced-wav").unwrap();

        let lib = SongLibrary::load(dir.path());
        let (_, audio) = lib.segment_audio("光与影的对白", "段落1").unwrap();
        assert_eq!(audio, b"sliced-wav");
    }

    #[test]
    fn segment_lyrics_join_lines() {
        let (_dir, lib) = library_with_song();
        assert_eq!(
            lib.segment_lyrics("光与影的对白", "段落1").unwrap(),
            "第一句\n第二句"
        );
    }
}
