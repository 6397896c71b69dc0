//! Audio files for tests: PCM WAV bodies, optionally tagged through lofty.

use std::fs;
use std::path::Path;

use lofty::config::WriteOptions;
use lofty::prelude::{Accessor, TagExt};
use lofty::tag::{Tag, TagType};

const SAMPLE_RATE: u32 = 44_100;
const CHANNELS: u16 = 2;
const BITS_PER_SAMPLE: u16 = 16;

pub struct FixtureTags<'a> {
    pub title: &'a str,
    pub artist: &'a str,
    pub album: &'a str,
}

/// Writes a silent 16-bit stereo PCM WAV of roughly `secs` seconds.
pub fn write_wav(path: &Path, secs: f32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create fixture dir");
    }

    let frames = (SAMPLE_RATE as f32 * secs) as u32;
    let block_align = CHANNELS * (BITS_PER_SAMPLE / 8);
    let byte_rate = SAMPLE_RATE * u32::from(block_align);
    let data_size = frames * u32::from(block_align);

    let mut bytes = Vec::with_capacity(44 + data_size as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_size).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&CHANNELS.to_le_bytes());
    bytes.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    bytes.extend_from_slice(&byte_rate.to_le_bytes());
    bytes.extend_from_slice(&block_align.to_le_bytes());
    bytes.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_size.to_le_bytes());
    bytes.resize(bytes.len() + data_size as usize, 0);

    fs::write(path, bytes).expect("write wav fixture");
}

pub fn write_tagged_wav(path: &Path, tags: &FixtureTags<'_>) {
    write_wav(path, 0.5);
    let mut tag = Tag::new(TagType::Id3v2);
    tag.set_title(tags.title.to_string());
    tag.set_artist(tags.artist.to_string());
    tag.set_album(tags.album.to_string());
    tag.save_to_path(path, WriteOptions::default())
        .expect("write id3v2 fixture tag");
}

/// Bytes that match no container signature.
pub fn write_garbage(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create fixture dir");
    }
    fs::write(path, b"this is not an audio stream at all").expect("write garbage fixture");
}
