use serde::{Deserialize, Serialize};
use std::path::Path;

/// A watched root folder. `path` is always host-normalized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub path: String,
}

impl Folder {
    pub fn new(normalized_path: &str) -> Self {
        Self {
            id: stable_id(normalized_path),
            path: normalized_path.to_string(),
        }
    }

    pub fn contains(&self, track_path: &str) -> bool {
        path_is_under(&self.path, track_path)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub uuid: String,
    pub path: String,
    pub codec: Codec,
    pub file_size: u64,
    #[serde(default)]
    pub modified: u64,
    #[serde(default)]
    pub tags: TrackTags,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub genres: Vec<String>,
    pub year: Option<i32>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub duration_ms: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bitrate: Option<u32>,
    pub has_embedded_cover: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Mp3,
    Flac,
    Ogg,
    Opus,
    Mp4,
    Wav,
    Aiff,
    WavPack,
    Ape,
}

impl Codec {
    /// Maps a file extension onto the audio container allowlist.
    pub fn from_path(path: &Path) -> Option<Codec> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "mp3" => Some(Codec::Mp3),
            "flac" => Some(Codec::Flac),
            "ogg" | "oga" => Some(Codec::Ogg),
            "opus" => Some(Codec::Opus),
            "m4a" | "mp4" | "aac" => Some(Codec::Mp4),
            "wav" => Some(Codec::Wav),
            "aiff" | "aif" => Some(Codec::Aiff),
            "wv" => Some(Codec::WavPack),
            "ape" => Some(Codec::Ape),
            _ => None,
        }
    }
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Canonicalizes separators so folder paths compare as keys.
pub fn normalize_path(path: &str, platform_is_windows: bool) -> String {
    if platform_is_windows {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}

pub fn normalize_for_host(path: &str) -> String {
    normalize_path(path, cfg!(windows))
}

/// Host-normalized folder path without trailing separators, so `/music/a/`
/// and `/music/a` name the same folder. Roots like `/` and `C:/` are kept.
pub fn normalize_folder(path: &str) -> String {
    let normalized = normalize_for_host(path);
    let trimmed = normalized.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.ends_with(':') {
        let end = (trimmed.len() + 1).min(normalized.len());
        return normalized[..end].to_string();
    }
    trimmed.to_string()
}

pub fn path_string(path: &Path) -> String {
    normalize_for_host(&path.to_string_lossy())
}

/// True when `path` lies strictly below `folder` on a component boundary.
pub fn path_is_under(folder: &str, path: &str) -> bool {
    if folder.is_empty() || path.len() <= folder.len() || !path.starts_with(folder) {
        return false;
    }
    folder.ends_with('/') || path[folder.len()..].starts_with('/')
}
