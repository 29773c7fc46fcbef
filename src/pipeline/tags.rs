// Embedded title/artist tags for local audio files
use std::fs::File;
use std::path::Path;

use log::debug;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey, Tag};
use symphonia::core::probe::Hint;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioTags {
    pub title: Option<String>,
    pub artist: Option<String>,
}

impl AudioTags {
    fn absorb(&mut self, revision: &MetadataRevision) {
        for tag in revision.tags() {
            let Some(value) = tag_text(tag) else {
                continue;
            };
            if is_title(tag) && self.title.is_none() {
                self.title = Some(value);
            } else if is_artist(tag) && self.artist.is_none() {
                self.artist = Some(value);
            }
        }
    }
}

/// Read tags from the container and any leading ID3 block. Unreadable or
/// untagged files yield empty tags.
pub fn read_audio_tags(path: &Path) -> AudioTags {
    let mut tags = AudioTags::default();

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("Cannot open {:?} for tags: {}", path, e);
            return tags;
        }
    };
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        Err(e) => {
            debug!("No readable tags in {:?}: {}", path, e);
            return tags;
        }
    };

    if let Some(metadata) = probed.metadata.get() {
        if let Some(revision) = metadata.current() {
            tags.absorb(revision);
        }
    }
    if let Some(revision) = probed.format.metadata().current() {
        tags.absorb(revision);
    }
    tags
}

fn tag_text(tag: &Tag) -> Option<String> {
    let text = tag.value.to_string();
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    (!text.is_empty()).then(|| text.to_string())
}

fn is_title(tag: &Tag) -> bool {
    match tag.std_key {
        Some(key) => key == StandardTagKey::TrackTitle,
        None => matches_key(&tag.key, &["title", "tit2", "inam"]),
    }
}

fn is_artist(tag: &Tag) -> bool {
    match tag.std_key {
        Some(key) => key == StandardTagKey::Artist,
        None => matches_key(&tag.key, &["artist", "tpe1", "iart"]),
    }
}

fn matches_key(key: &str, names: &[&str]) -> bool {
    names.iter().any(|name| key.eq_ignore_ascii_case(name))
}

#[cfg(test)]
fn riff_chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    if body.len() % 2 == 1 {
        out.push(0);
    }
    out
}

/// Mono 16-bit PCM with a LIST/INFO block ahead of the samples
#[cfg(test)]
pub(crate) fn tagged_wav(title: &str, artist: &str) -> Vec<u8> {
    let mut fmt = Vec::new();
    fmt.extend_from_slice(&1u16.to_le_bytes());
    fmt.extend_from_slice(&1u16.to_le_bytes());
    fmt.extend_from_slice(&8000u32.to_le_bytes());
    fmt.extend_from_slice(&16000u32.to_le_bytes());
    fmt.extend_from_slice(&2u16.to_le_bytes());
    fmt.extend_from_slice(&16u16.to_le_bytes());

    let mut info = b"INFO".to_vec();
    info.extend(riff_chunk(b"INAM", format!("{}\0", title).as_bytes()));
    info.extend(riff_chunk(b"IART", format!("{}\0", artist).as_bytes()));

    let mut body = b"WAVE".to_vec();
    body.extend(riff_chunk(b"fmt ", &fmt));
    body.extend(riff_chunk(b"LIST", &info));
    body.extend(riff_chunk(b"data", &[0u8; 32]));
    riff_chunk(b"RIFF", &body)
}
