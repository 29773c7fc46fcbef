// Turning raw enqueue strings into validated sources
use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::Source;

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "aac", "m4a", "ogg", "wma", "opus"];

const SENSITIVE_DIRS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".config",
    ".aws",
    ".azure",
    ".kube",
    "Library/Keychains",
    "Library/Cookies",
    ".password-store",
];

const EXTRA_ROOTS: &[&str] = &["/tmp", "/Volumes", "/media", "/mnt"];

/// Classify and validate one raw source string.
///
/// `Ok` carries a source that passed validation. `Err` carries the best
/// classification we could make plus the reason it was rejected, so the
/// caller can still record an item for it.
pub fn parse_source(raw: &str) -> std::result::Result<Source, (Source, AppError)> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();

    if lower.starts_with("http://") || lower.starts_with("https://") {
        let source = Source::Remote { url: raw.to_string() };
        return match validate_remote(raw) {
            Ok(()) => Ok(source),
            Err(e) => Err((source, e)),
        };
    }

    let path = if lower.starts_with("file://") {
        match url::Url::parse(raw).ok().and_then(|u| u.to_file_path().ok()) {
            Some(path) => path,
            None => {
                let source = Source::Local { path: PathBuf::from(&raw[7..]) };
                return Err((source, AppError::Source(format!("Invalid file URL: {}", raw))));
            }
        }
    } else {
        PathBuf::from(raw)
    };

    match validate_local_file(&path) {
        Ok(resolved) => Ok(Source::Local { path: resolved }),
        Err(e) => Err((Source::Local { path }, e)),
    }
}

fn validate_remote(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| AppError::Source(format!("Invalid URL: {}", e)))?;
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(AppError::Source(format!("URL has no host: {}", raw))),
    }
}

/// Check that a local path is an audio file we are allowed to read.
/// Returns the canonical path.
pub fn validate_local_file(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(AppError::Source("Empty file path".to_string()));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AppError::Source("Path traversal is not allowed".to_string()));
    }
    if !path.exists() {
        return Err(AppError::Source(format!("File not found: {}", path.display())));
    }
    if !path.is_file() {
        return Err(AppError::Source(format!("Not a file: {}", path.display())));
    }

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !AUDIO_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AppError::Source(format!(
            "Unsupported file type: .{}",
            extension
        )));
    }

    let resolved = path.canonicalize()?;

    let roots = allowed_roots();
    if !roots.iter().any(|root| resolved.starts_with(root)) {
        return Err(AppError::Source(format!(
            "Access denied: file must be in your home directory or a mounted volume: {}",
            resolved.display()
        )));
    }

    if let Some(home) = dirs::home_dir() {
        for sensitive in SENSITIVE_DIRS {
            let dir = home.join(sensitive);
            if resolved.starts_with(&dir) {
                return Err(AppError::Source(
                    "Access denied: cannot read files from sensitive directories".to_string(),
                ));
            }
        }
    }

    Ok(resolved)
}

fn allowed_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    let mut push = |p: PathBuf| {
        let p = p.canonicalize().unwrap_or(p);
        if !roots.contains(&p) {
            roots.push(p);
        }
    };

    if let Some(home) = dirs::home_dir() {
        push(home);
    }
    push(std::env::temp_dir());
    for root in EXTRA_ROOTS {
        push(PathBuf::from(root));
    }
    roots
}

/// Validate an enqueue target folder; empty means "use the configured default"
pub fn validate_folder(folder: &str) -> Result<Option<PathBuf>> {
    let folder = folder.trim();
    if folder.is_empty() {
        return Ok(None);
    }
    let path = PathBuf::from(folder);
    if !path.is_absolute() {
        return Err(AppError::Config(format!(
            "Target folder must be an absolute path: {}",
            folder
        )));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AppError::Config("Target folder may not contain '..'".to_string()));
    }
    if path.exists() && !path.is_dir() {
        return Err(AppError::Config(format!(
            "Target folder is not a directory: {}",
            folder
        )));
    }
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_urls_are_accepted() {
        let source = parse_source("https://www.youtube.com/watch?v=abc").unwrap();
        assert_eq!(
            source,
            Source::Remote { url: "https://www.youtube.com/watch?v=abc".to_string() }
        );
    }

    #[test]
    fn test_remote_without_host_is_rejected() {
        let (source, err) = parse_source("http://").unwrap_err();
        assert!(!source.is_local());
        assert!(matches!(err, AppError::Source(_)));
    }

    #[test]
    fn test_missing_local_file_is_rejected() {
        let (source, err) = parse_source("/definitely/not/here.mp3").unwrap_err();
        assert!(source.is_local());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_traversal_is_rejected() {
        let (_, err) = parse_source("/tmp/../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("traversal"));
    }

    #[test]
    fn test_local_audio_in_temp_dir_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Artist - Song.mp3");
        std::fs::write(&file, b"ID3").unwrap();

        let source = parse_source(file.to_str().unwrap()).unwrap();
        let expected = file.canonicalize().unwrap();
        assert_eq!(source.local_path(), Some(expected.as_path()));
    }

    #[test]
    fn test_file_url_is_local() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("track.flac");
        std::fs::write(&file, b"fLaC").unwrap();
        let url = url::Url::from_file_path(&file).unwrap();

        let source = parse_source(url.as_str()).unwrap();
        assert!(source.is_local());
    }

    #[test]
    fn test_non_audio_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"hi").unwrap();

        let (_, err) = parse_source(file.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
    }

    #[test]
    fn test_folder_validation() {
        assert!(validate_folder("").unwrap().is_none());
        assert!(matches!(validate_folder("relative/out"), Err(AppError::Config(_))));

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(validate_folder(file.to_str().unwrap()).is_err());
        assert_eq!(
            validate_folder(dir.path().to_str().unwrap()).unwrap(),
            Some(dir.path().to_path_buf())
        );
    }
}
