// Phase 2: stem separation and staging into the output folder
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{ProgressFn, SeparationOutput, SeparationRequest, Separator};
use crate::error::{AppError, Result};
use crate::models::{StemMode, SIX_STEM_MODEL};
use crate::process_manager::WorkerRuntime;

const SEPARATE_SCRIPT: &str = "separate_worker.py";
const MAX_FILENAME_LEN: usize = 120;

#[derive(Debug, Deserialize)]
struct StemFile {
    stem: String,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SeparateResult {
    output_files: Vec<StemFile>,
}

/// Runs Demucs through `separate_worker.py`
pub struct DemucsSeparator {
    runtime: WorkerRuntime,
    scratch_root: PathBuf,
}

impl DemucsSeparator {
    pub fn new(runtime: WorkerRuntime, scratch_root: PathBuf) -> Self {
        Self { runtime, scratch_root }
    }
}

#[async_trait]
impl Separator for DemucsSeparator {
    async fn separate(
        &self,
        request: SeparationRequest,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<SeparationOutput> {
        let scratch = self.scratch_root.join(format!("stems-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&scratch)?;

        let model = if request.stem_mode == StemMode::Six {
            SIX_STEM_MODEL.to_string()
        } else {
            request.model.clone()
        };
        let (shifts, overlap) = request.quality.shifts_overlap();
        info!(
            "Separating {:?}: model={}, stems={}, shifts={}, overlap={}",
            request.input,
            model,
            request.stem_mode.as_str(),
            shifts,
            overlap
        );

        let input = json!({
            "input_file": request.input,
            "output_dir": scratch,
            "model": model,
            "stem_mode": request.stem_mode.as_str(),
            "shifts": shifts,
            "overlap": overlap,
        });

        let outcome = self
            .runtime
            .run(SEPARATE_SCRIPT, &input, &progress, &cancel)
            .await
            .and_then(|data| {
                let result: SeparateResult = serde_json::from_value(data)?;
                if result.output_files.is_empty() {
                    return Err(AppError::Transform("Separation produced no stems".to_string()));
                }
                let (artist, song) = parse_artist_song(&request.title, request.channel.as_deref());
                let stems: Vec<(String, PathBuf)> = result
                    .output_files
                    .into_iter()
                    .map(|f| (f.stem, f.path))
                    .collect();
                stage_stems(&stems, &request.folder, artist.as_deref(), &song, request.stem_mode)
            });

        if let Err(e) = fs::remove_dir_all(&scratch) {
            debug!("Could not remove scratch dir {:?}: {}", scratch, e);
        }

        outcome.map_err(|e| match e {
            AppError::Worker(message) => AppError::Transform(message),
            other => other,
        })
    }
}

/// Move separated stems to `<folder>/<artist>/<stem_dir>/<song>.<ext>`.
///
/// Returns the artist directory (or `folder` when no artist is known) and
/// the final stem paths.
pub fn stage_stems(
    stems: &[(String, PathBuf)],
    folder: &Path,
    artist: Option<&str>,
    song: &str,
    stem_mode: StemMode,
) -> Result<SeparationOutput> {
    let dest_base = match artist {
        Some(artist) if !artist.is_empty() => folder.join(artist),
        _ => folder.to_path_buf(),
    };

    let mut staged = Vec::with_capacity(stems.len());
    for (stem, path) in stems {
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let stem_dir = dest_base.join(stem_mode.stem_dir(stem));
        fs::create_dir_all(&stem_dir)?;

        let target = stem_dir.join(format!("{}{}", song, ext));
        if fs::rename(path, &target).is_err() {
            // Cross-device moves need a copy
            fs::copy(path, &target)?;
            if let Err(e) = fs::remove_file(path) {
                warn!("Could not remove {:?} after copy: {}", path, e);
            }
        }
        staged.push(target);
    }

    Ok(SeparationOutput {
        dest_path: dest_base,
        stems: staged,
    })
}

/// Replace characters that are unsafe in file names and collapse whitespace
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect();
    let collapsed = replaced
        .trim()
        .trim_matches('.')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let truncated: String = collapsed.chars().take(MAX_FILENAME_LEN).collect();
    let truncated = truncated.trim().to_string();
    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated
    }
}

/// Split "Artist - Song" titles, falling back to the channel as artist
pub fn parse_artist_song(title: &str, channel: Option<&str>) -> (Option<String>, String) {
    let channel = channel
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(sanitize_filename);

    let base = title.trim();
    if base.is_empty() {
        return (channel, "untitled".to_string());
    }

    if let Some(idx) = base.find(['-', '\u{2013}', '\u{2014}']) {
        let (artist, rest) = base.split_at(idx);
        let dash_len = rest.chars().next().map(char::len_utf8).unwrap_or(1);
        let song = rest[dash_len..].trim();
        if !artist.trim().is_empty() && !song.is_empty() {
            return (Some(sanitize_filename(artist)), sanitize_filename(song));
        }
    }

    (channel, sanitize_filename(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_artist_song() {
        assert_eq!(
            parse_artist_song("Daft Punk - One More Time", None),
            (Some("Daft Punk".to_string()), "One More Time".to_string())
        );
        assert_eq!(
            parse_artist_song("Intro \u{2013} Live", Some("Chan")),
            (Some("Intro".to_string()), "Live".to_string())
        );
        assert_eq!(
            parse_artist_song("Just A Song", Some("Some Channel")),
            (Some("Some Channel".to_string()), "Just A Song".to_string())
        );
        assert_eq!(parse_artist_song("  ", None), (None, "untitled".to_string()));
        assert_eq!(parse_artist_song("- Song", None), (None, "- Song".to_string()));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("AC/DC: Live?"), "AC_DC_ Live_");
        assert_eq!(sanitize_filename("  a   b  "), "a b");
        assert_eq!(sanitize_filename("..."), "untitled");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), MAX_FILENAME_LEN);
    }

    #[test]
    fn test_stage_two_stem_output() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let vocals = scratch.path().join("vocals.wav");
        let rest = scratch.path().join("no_vocals.wav");
        fs::write(&vocals, b"v").unwrap();
        fs::write(&rest, b"i").unwrap();

        let output = stage_stems(
            &[("vocals".into(), vocals.clone()), ("no_vocals".into(), rest)],
            out.path(),
            Some("Artist"),
            "Song",
            StemMode::Two,
        )
        .unwrap();

        assert_eq!(output.dest_path, out.path().join("Artist"));
        assert!(out.path().join("Artist/vocals/Song.wav").exists());
        assert!(out.path().join("Artist/instrumental/Song.wav").exists());
        assert!(!vocals.exists());
        assert_eq!(output.stems.len(), 2);
    }

    #[test]
    fn test_stage_without_artist_uses_folder() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let drums = scratch.path().join("drums.mp3");
        fs::write(&drums, b"d").unwrap();

        let output =
            stage_stems(&[("drums".into(), drums)], out.path(), None, "Track", StemMode::Four)
                .unwrap();
        assert_eq!(output.dest_path, out.path());
        assert!(out.path().join("drums/Track.mp3").exists());
    }
}
