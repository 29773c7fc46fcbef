// Settings data models
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_DOWNLOAD_WEIGHT: f64 = 0.30;
pub const DEFAULT_DEMUCS_MODEL: &str = "htdemucs";
pub const SIX_STEM_MODEL: &str = "htdemucs_6s";
pub const DEMUCS_MODELS: &[&str] = &["htdemucs", "htdemucs_ft", "htdemucs_6s", "mdx_extra"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum StemMode {
    #[serde(rename = "2")]
    Two,
    #[default]
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "6")]
    Six,
}

impl StemMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "2" => Some(StemMode::Two),
            "4" => Some(StemMode::Four),
            "6" => Some(StemMode::Six),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StemMode::Two => "2",
            StemMode::Four => "4",
            StemMode::Six => "6",
        }
    }

    /// Stems the separation engine is expected to produce
    pub fn stems(self) -> &'static [&'static str] {
        match self {
            StemMode::Two => &["vocals", "no_vocals"],
            StemMode::Four => &["vocals", "drums", "bass", "other"],
            StemMode::Six => &["vocals", "drums", "bass", "guitar", "piano", "other"],
        }
    }

    /// Output folder for a stem; 2-stem output is vocals + instrumental
    pub fn stem_dir(self, stem: &str) -> String {
        match self {
            StemMode::Two if stem == "vocals" => "vocals".to_string(),
            StemMode::Two => "instrumental".to_string(),
            _ => stem.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    #[default]
    Normal,
    High,
}

impl QualityPreset {
    /// (shifts, overlap) passed to the separation engine
    pub fn shifts_overlap(self) -> (u32, f64) {
        match self {
            QualityPreset::Normal => (0, 0.25),
            QualityPreset::High => (2, 0.5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub output_dir: String,
    pub default_folder: String,
    pub max_concurrency: usize,
    pub demucs_model: String,
    pub stem_mode: StemMode,
    pub quality_preset: QualityPreset,
    /// Phase-1 weight in the blended progress; phase 2 gets the rest
    pub download_weight: f64,
    pub auto_start: bool,
    pub python_path: Option<String>,
    pub workers_dir: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: String::new(),
            default_folder: String::new(),
            max_concurrency: DEFAULT_CONCURRENCY,
            demucs_model: DEFAULT_DEMUCS_MODEL.to_string(),
            stem_mode: StemMode::default(),
            quality_preset: QualityPreset::default(),
            download_weight: DEFAULT_DOWNLOAD_WEIGHT,
            auto_start: true,
            python_path: None,
            workers_dir: None,
        }
    }
}

/// Partial update accepted by POST /api/config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub output_dir: Option<String>,
    pub default_folder: Option<String>,
    pub demucs_model: Option<String>,
    pub stem_mode: Option<String>,
    pub quality_preset: Option<QualityPreset>,
    pub download_weight: Option<f64>,
    pub auto_start: Option<bool>,
}
