use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use common::{path_string, stable_id, Codec, Track, TrackTags};
use lofty::error::{ErrorKind, LoftyError};
use lofty::file::{FileType, TaggedFile};
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use lofty::probe::Probe;
use serde::{Deserialize, Serialize};

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionErrorKind {
    Unreadable,
    UnsupportedFormat,
    Corrupt,
}

#[derive(Debug)]
pub enum ExtractionError {
    Unreadable(std::io::Error),
    UnsupportedFormat(String),
    Corrupt(LoftyError),
}

impl ExtractionError {
    pub fn kind(&self) -> ExtractionErrorKind {
        match self {
            ExtractionError::Unreadable(_) => ExtractionErrorKind::Unreadable,
            ExtractionError::UnsupportedFormat(_) => ExtractionErrorKind::UnsupportedFormat,
            ExtractionError::Corrupt(_) => ExtractionErrorKind::Corrupt,
        }
    }
}

impl std::fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionError::Unreadable(err) => write!(f, "unreadable: {}", err),
            ExtractionError::UnsupportedFormat(detail) => {
                write!(f, "unsupported format: {}", detail)
            }
            ExtractionError::Corrupt(err) => write!(f, "corrupt tag data: {}", err),
        }
    }
}

impl std::error::Error for ExtractionError {}

impl From<std::io::Error> for ExtractionError {
    fn from(err: std::io::Error) -> Self {
        ExtractionError::Unreadable(err)
    }
}

impl From<LoftyError> for ExtractionError {
    fn from(err: LoftyError) -> Self {
        match err.kind() {
            ErrorKind::UnknownFormat => ExtractionError::UnsupportedFormat(err.to_string()),
            ErrorKind::Io(io) => {
                ExtractionError::Unreadable(std::io::Error::new(io.kind(), io.to_string()))
            }
            _ => ExtractionError::Corrupt(err),
        }
    }
}

/// Reads one audio file into an index record. The uuid is derived from the
/// normalized absolute path so rescans of an unmoved file agree.
pub fn extract(path: &Path) -> Result<Track, ExtractionError> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(ExtractionError::Unreadable(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }
    let by_extension = Codec::from_path(path).ok_or_else(|| {
        ExtractionError::UnsupportedFormat(format!("extension not allowed: {:?}", path))
    })?;

    let tagged_file = open_tagged(path)?;
    let codec = codec_of(tagged_file.file_type()).unwrap_or(by_extension);
    let tags = tags_of(&tagged_file);
    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|value| value.as_secs())
        .unwrap_or(0);

    let normalized = path_string(path);
    Ok(Track {
        uuid: stable_id(&normalized),
        path: normalized,
        codec,
        file_size: meta.len(),
        modified,
        tags,
    })
}

pub fn read_tags(path: &Path) -> Result<TrackTags, ExtractionError> {
    let tagged_file = open_tagged(path)?;
    Ok(tags_of(&tagged_file))
}

/// Picks the parser from the file's leading bytes. The extension only
/// decides when the content is not recognized.
fn open_tagged(path: &Path) -> Result<TaggedFile, ExtractionError> {
    let sniffed = Probe::open(path)?.guess_file_type()?;
    Ok(sniffed.read()?)
}

fn codec_of(file_type: FileType) -> Option<Codec> {
    match file_type {
        FileType::Mpeg => Some(Codec::Mp3),
        FileType::Flac => Some(Codec::Flac),
        FileType::Vorbis => Some(Codec::Ogg),
        FileType::Opus => Some(Codec::Opus),
        FileType::Mp4 | FileType::Aac => Some(Codec::Mp4),
        FileType::Wav => Some(Codec::Wav),
        FileType::Aiff => Some(Codec::Aiff),
        FileType::WavPack => Some(Codec::WavPack),
        FileType::Ape => Some(Codec::Ape),
        _ => None,
    }
}

fn tags_of(tagged_file: &TaggedFile) -> TrackTags {
    let properties = tagged_file.properties();

    let mut info = TrackTags::default();

    let duration_ms = properties.duration().as_millis();
    if duration_ms > 0 {
        let clamped = duration_ms.min(u128::from(u32::MAX)) as u32;
        info.duration_ms = Some(clamped);
    }

    info.sample_rate = properties.sample_rate();
    info.channels = properties.channels();
    info.bitrate = properties.audio_bitrate().or(properties.overall_bitrate());

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag.get_string(&ItemKey::TrackTitle).map(|v| v.to_string());
        info.album = tag.get_string(&ItemKey::AlbumTitle).map(|v| v.to_string());
        let album_artist = tag.get_string(&ItemKey::AlbumArtist).map(|v| v.to_string());
        let track_artist = tag.get_string(&ItemKey::TrackArtist).map(|v| v.to_string());
        info.artist = track_artist.or_else(|| album_artist.clone());
        info.album_artist = album_artist;
        info.track_no = tag.get_string(&ItemKey::TrackNumber).and_then(parse_u16);
        info.disc_no = tag.get_string(&ItemKey::DiscNumber).and_then(parse_u16);
        info.year = tag
            .get_string(&ItemKey::Year)
            .or_else(|| tag.get_string(&ItemKey::RecordingDate))
            .and_then(parse_year);
        if let Some(value) = tag.get_string(&ItemKey::Genre) {
            info.genres = parse_genres(value);
        }
        info.has_embedded_cover = !tag.pictures().is_empty();
    }

    info
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.len() < 4 {
        None
    } else {
        digits.parse().ok()
    }
}

fn parse_genres(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if out.iter().any(|seen| seen.eq_ignore_ascii_case(trimmed)) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{write_garbage, write_tagged_wav, write_wav, FixtureTags};
    use tempfile::TempDir;

    #[test]
    fn untagged_wav_extracts_with_properties_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.wav");
        write_wav(&path, 1.0);

        let track = extract(&path).unwrap();
        assert_eq!(track.codec, Codec::Wav);
        assert_eq!(track.path, path_string(&path));
        assert_eq!(track.uuid, stable_id(&track.path));
        assert!(track.file_size > 44);
        assert!(track.tags.title.is_none());
        assert_eq!(track.tags.sample_rate, Some(44_100));
        assert_eq!(track.tags.channels, Some(2));
        assert!(track.tags.duration_ms.unwrap_or(0) >= 900);
    }

    #[test]
    fn tagged_wav_exposes_tag_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tagged.wav");
        write_tagged_wav(
            &path,
            &FixtureTags {
                title: "Dawn",
                artist: "Nova",
                album: "Tide",
            },
        );

        let tags = read_tags(&path).unwrap();
        assert_eq!(tags.title.as_deref(), Some("Dawn"));
        assert_eq!(tags.artist.as_deref(), Some("Nova"));
        assert_eq!(tags.album.as_deref(), Some("Tide"));
    }

    #[test]
    fn garbage_with_audio_extension_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.flac");
        write_garbage(&path);

        let err = extract(&path).unwrap_err();
        assert_eq!(err.kind(), ExtractionErrorKind::Corrupt);
    }

    #[test]
    fn content_wins_over_a_misleading_extension() {
        let dir = TempDir::new().unwrap();
        let wav = dir.path().join("real.wav");
        let renamed = dir.path().join("real.mp3");
        write_wav(&wav, 0.5);
        std::fs::copy(&wav, &renamed).unwrap();

        let track = extract(&renamed).unwrap();
        assert_eq!(track.codec, Codec::Wav);
        assert_eq!(track.tags.sample_rate, Some(44_100));
        assert!(read_tags(&renamed).is_ok());
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let err = extract(&dir.path().join("gone.mp3")).unwrap_err();
        assert_eq!(err.kind(), ExtractionErrorKind::Unreadable);
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"liner notes").unwrap();

        let err = extract(&path).unwrap_err();
        assert_eq!(err.kind(), ExtractionErrorKind::UnsupportedFormat);
    }

    #[test]
    fn tag_value_parsers() {
        assert_eq!(parse_u16("3/12"), Some(3));
        assert_eq!(parse_u16(" 7 "), Some(7));
        assert_eq!(parse_u16("x"), None);
        assert_eq!(parse_year("2019-04-01"), Some(2019));
        assert_eq!(parse_year("c. 1999"), Some(1999));
        assert_eq!(parse_year("99"), None);
        assert_eq!(
            parse_genres("Rock; Pop / rock|Jazz"),
            vec!["Rock".to_string(), "Pop".to_string(), "Jazz".to_string()]
        );
        assert!(parse_genres(" ; ").is_empty());
    }
}
