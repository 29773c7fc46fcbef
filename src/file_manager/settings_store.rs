// Persistent user settings with validation on the way in
use std::path::{Path, PathBuf};

use log::{info, warn};
use parking_lot::RwLock;
use serde_json::Value;

use super::json_ops::{read_json_file, write_json_file};
use crate::error::{AppError, Result};
use crate::models::{
    QualityPreset, Settings, SettingsUpdate, StemMode, DEFAULT_DEMUCS_MODEL,
    DEFAULT_DOWNLOAD_WEIGHT, DEMUCS_MODELS,
};
use crate::progress::PhaseWeights;
use crate::queue::{validate_folder, MAX_CONCURRENCY_CEILING};
use crate::utils::default_output_dir;

pub struct SettingsStore {
    path: Option<PathBuf>,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load from disk. A missing or unreadable file yields defaults.
    pub fn load(path: PathBuf) -> Self {
        let settings = if path.exists() {
            match read_json_file::<Value>(&path) {
                Ok(value) => settings_from_value(value),
                Err(e) => {
                    warn!("Failed to read settings {:?}, using defaults: {}", path, e);
                    Settings::default()
                }
            }
        } else {
            Settings::default()
        };

        Self {
            path: Some(path),
            current: RwLock::new(sanitize(settings)),
        }
    }

    /// Settings that are never written to disk
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            current: RwLock::new(sanitize(settings)),
        }
    }

    pub fn get(&self) -> Settings {
        self.current.read().clone()
    }

    pub fn phase_weights(&self) -> PhaseWeights {
        PhaseWeights::new(self.current.read().download_weight).unwrap_or_default()
    }

    pub fn output_dir(&self) -> PathBuf {
        let settings = self.current.read();
        let folder = if settings.default_folder.trim().is_empty() {
            &settings.output_dir
        } else {
            &settings.default_folder
        };
        PathBuf::from(folder)
    }

    /// Validate and apply a partial update, then persist. The write lock is
    /// held until the new value is stored.
    pub fn update(&self, update: SettingsUpdate) -> Result<Settings> {
        let mut current = self.current.write();
        let mut next = current.clone();

        if let Some(output_dir) = update.output_dir {
            next.output_dir = validated_dir(&output_dir)?;
        }
        if let Some(default_folder) = update.default_folder {
            next.default_folder = validated_dir(&default_folder)?;
        }
        if let Some(model) = update.demucs_model {
            if !DEMUCS_MODELS.contains(&model.as_str()) {
                return Err(AppError::Config(format!(
                    "Unknown model '{}', expected one of: {}",
                    model,
                    DEMUCS_MODELS.join(", ")
                )));
            }
            next.demucs_model = model;
        }
        if let Some(stem_mode) = update.stem_mode {
            next.stem_mode = StemMode::parse(&stem_mode).ok_or_else(|| {
                AppError::Config(format!("Invalid stem mode '{}', expected 2, 4 or 6", stem_mode))
            })?;
        }
        if let Some(quality) = update.quality_preset {
            next.quality_preset = quality;
        }
        if let Some(weight) = update.download_weight {
            next.download_weight = PhaseWeights::new(weight)?.download();
        }
        if let Some(auto_start) = update.auto_start {
            next.auto_start = auto_start;
        }

        let next = sanitize(next);
        self.persist(&next)?;
        *current = next.clone();
        info!("Settings updated");
        Ok(next)
    }

    /// Persist a new limit, then hand it to `apply` before releasing the
    /// lock. Nothing is applied when the write fails.
    pub fn set_max_concurrency<F>(&self, max: usize, apply: F) -> Result<usize>
    where
        F: FnOnce(usize) -> Result<usize>,
    {
        let mut current = self.current.write();
        let mut next = current.clone();
        next.max_concurrency = max.clamp(1, MAX_CONCURRENCY_CEILING);
        self.persist(&next)?;
        let applied = apply(next.max_concurrency)?;
        *current = next;
        Ok(applied)
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        match &self.path {
            Some(path) => write_json_file(path, settings),
            None => Ok(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn validated_dir(raw: &str) -> Result<String> {
    Ok(validate_folder(raw)?
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default())
}

/// Deserialize leniently: enum fields with unknown values are dropped so
/// the rest of the file still loads
fn settings_from_value(mut value: Value) -> Settings {
    if let Value::Object(map) = &mut value {
        if let Some(raw) = map.get("stem_mode").cloned() {
            let parsed = match &raw {
                Value::String(s) => StemMode::parse(s),
                Value::Number(n) => StemMode::parse(&n.to_string()),
                _ => None,
            };
            match parsed {
                Some(mode) => {
                    map.insert("stem_mode".into(), Value::String(mode.as_str().into()));
                }
                None => {
                    warn!("Ignoring invalid stem_mode in settings: {}", raw);
                    map.remove("stem_mode");
                }
            }
        }
        if let Some(raw) = map.get("quality_preset").cloned() {
            if serde_json::from_value::<QualityPreset>(raw.clone()).is_err() {
                warn!("Ignoring invalid quality_preset in settings: {}", raw);
                map.remove("quality_preset");
            }
        }
    }

    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!("Settings file is malformed, using defaults: {}", e);
        Settings::default()
    })
}

/// Clamp and default every field into a usable state
pub fn sanitize(mut settings: Settings) -> Settings {
    settings.max_concurrency = settings.max_concurrency.clamp(1, MAX_CONCURRENCY_CEILING);

    if PhaseWeights::new(settings.download_weight).is_err() {
        warn!(
            "Invalid download weight {}, falling back to {}",
            settings.download_weight, DEFAULT_DOWNLOAD_WEIGHT
        );
        settings.download_weight = DEFAULT_DOWNLOAD_WEIGHT;
    }

    if !DEMUCS_MODELS.contains(&settings.demucs_model.as_str()) {
        warn!("Unknown model '{}', using default", settings.demucs_model);
        settings.demucs_model = DEFAULT_DEMUCS_MODEL.to_string();
    }

    if settings.output_dir.trim().is_empty() {
        settings.output_dir = default_output_dir().to_string_lossy().to_string();
    }

    settings.python_path = settings.python_path.filter(|p| !p.trim().is_empty());
    settings.workers_dir = settings.workers_dir.filter(|p| !p.trim().is_empty());
    settings
}
