//! Pipeline Configuration
//!
//! Extraction thresholds, limits and engine settings stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable that forces offline mode (no model downloads)
pub const OFFLINE_ENV: &str = "TEXTSIEVE_OFFLINE";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Quality gate and timeouts
    pub extraction: ExtractionConfig,
    /// Input limits
    pub limits: LimitsConfig,
    /// Fast engine settings
    pub tesseract: TesseractConfig,
    /// Accurate engine settings
    pub model: ModelConfig,
}

/// Quality gate and per-engine timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Minimum fast-engine confidence (0 - 100) to accept without fallback
    pub min_confidence: f32,
    /// Minimum fast-engine text length (in characters) to accept without fallback
    pub min_text_length: usize,
    /// Fast engine timeout in milliseconds
    pub fast_timeout_ms: u64,
    /// Accurate engine timeout in milliseconds (covers one-time model loading)
    pub accurate_timeout_ms: u64,
}

impl ExtractionConfig {
    pub fn fast_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_timeout_ms)
    }

    pub fn accurate_timeout(&self) -> Duration {
        Duration::from_millis(self.accurate_timeout_ms)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 60.0,
            min_text_length: 3,
            fast_timeout_ms: 60_000,
            accurate_timeout_ms: 120_000,
        }
    }
}

/// Input limits enforced before any decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum accepted file size in bytes
    pub max_file_bytes: u64,
    /// Upscale is skipped when the result would exceed this many pixels
    pub max_upscaled_pixels: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 20 * 1024 * 1024,
            max_upscaled_pixels: 64_000_000,
        }
    }
}

/// Tesseract (fast engine) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractConfig {
    /// Binary name or path
    pub binary: String,
    /// Tesseract language code(s), e.g. "eng" or "eng+deu"
    pub language: String,
    /// Page segmentation mode
    pub psm: u8,
}

impl Default for TesseractConfig {
    fn default() -> Self {
        Self {
            binary: "tesseract".to_string(),
            language: "eng".to_string(),
            psm: 3,
        }
    }
}

/// Neural (accurate engine) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model cache directory; the per-user data directory when unset
    pub models_dir: Option<PathBuf>,
    /// Recognition model (CRNN, ONNX) download URL
    pub recognition_url: String,
    /// Character dictionary download URL
    pub dictionary_url: String,
    /// Expected SHA-256 of the recognition model, if known
    pub recognition_sha256: Option<String>,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
    /// Never download; fail if models are missing
    pub offline: bool,
}

impl ModelConfig {
    /// Offline if configured or forced through the environment
    pub fn is_offline(&self) -> bool {
        self.offline || std::env::var_os(OFFLINE_ENV).is_some()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            models_dir: None,
            recognition_url:
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx"
                    .to_string(),
            dictionary_url:
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt"
                    .to_string(),
            recognition_sha256: None,
            intra_threads: 4,
            offline: false,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<OcrConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: OcrConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &OcrConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Per-user config file location
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}

/// Load `path` (or the per-user config file), falling back to defaults when it
/// is missing or unreadable
pub fn load_or_default(path: Option<&Path>) -> OcrConfig {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Ok(path) => path,
            Err(e) => {
                warn!("No config directory, using defaults: {}", e);
                return OcrConfig::default();
            }
        },
    };

    if !path.exists() {
        debug!("No config at {:?}, using defaults", path);
        return OcrConfig::default();
    }

    match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config from {:?}, using defaults: {:#}", path, e);
            OcrConfig::default()
        }
    }
}
