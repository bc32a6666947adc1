//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of the recognition model and its
//! character dictionary.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, Session};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::Progress;
use crate::config::ModelConfig;

/// Files the neural recognizer needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text recognition model (CRNN)
    Recognition,
    /// Character dictionary for recognition
    Dictionary,
}

impl ModelType {
    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::Recognition => "rec.onnx",
            ModelType::Dictionary => "dict.txt",
        }
    }

    /// Expected file size for integrity check (approximate, in bytes)
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::Recognition => (1_000_000, 200_000_000),
            ModelType::Dictionary => (100, 1_000_000),
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Recognition => "Text Recognition",
            ModelType::Dictionary => "Character Dictionary",
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    /// Seconds since the Unix epoch
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Model manager for downloading and caching ONNX models
#[derive(Debug, Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
    config: ModelConfig,
}

impl ModelManager {
    /// Create a model manager using the configured (or per-user default) directory
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let models_dir = match &config.models_dir {
            Some(dir) => dir.clone(),
            None => crate::storage::default_models_dir()?,
        };
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;

        Ok(Self {
            models_dir,
            config: config.clone(),
        })
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    fn download_url(&self, model_type: ModelType) -> &str {
        match model_type {
            ModelType::Recognition => &self.config.recognition_url,
            ModelType::Dictionary => &self.config.dictionary_url,
        }
    }

    fn expected_sha256(&self, model_type: ModelType) -> Option<&str> {
        match model_type {
            ModelType::Recognition => self.config.recognition_sha256.as_deref(),
            ModelType::Dictionary => None,
        }
    }

    /// Check if a model is already downloaded
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                let size = metadata.len();
                size >= min && size <= max
            }
            Err(_) => false,
        }
    }

    /// Check if all required files are available
    pub fn are_models_ready(&self) -> bool {
        self.is_model_available(ModelType::Recognition) && self.is_model_available(ModelType::Dictionary)
    }

    /// Download a model if not already available.
    /// Returns the path to the model file.
    pub async fn ensure_model(&self, model_type: ModelType, progress: &Progress) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        if self.config.is_offline() {
            anyhow::bail!(
                "Offline mode: cannot download {}. Download it manually from {} and place at {:?}",
                model_type.display_name(),
                self.download_url(model_type),
                path
            );
        }

        self.download_model(model_type, progress).await?;
        Ok(path)
    }

    /// Download a specific model, reporting byte progress
    async fn download_model(&self, model_type: ModelType, progress: &Progress) -> Result<()> {
        let url = self.download_url(model_type).to_string();
        let path = self.model_path(model_type);

        info!("Downloading {} model from {}", model_type.display_name(), url);

        let sha256 = self.download_file(&url, &path, model_type, progress).await?;

        if !self.is_model_available(model_type) {
            anyhow::bail!("Download completed but model verification failed");
        }

        self.update_manifest_for_model(model_type, sha256)?;

        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(())
    }

    /// Stream `url` into `path` via a temp file; returns the SHA-256
    async fn download_file(
        &self,
        url: &str,
        path: &Path,
        model_type: ModelType,
        progress: &Progress,
    ) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;

        let response = client
            .get(url)
            .send()
            .await
            .context("Failed to send download request")?
            .error_for_status()
            .context("Download request was rejected")?;

        let total_size = response.content_length();
        debug!("Download size: {:?} bytes", total_size);

        let temp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .context("Failed to create temp file")?;

        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading download stream")?;

            file.write_all(&chunk)
                .await
                .context("Failed to write to temp file")?;

            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if let Some(total) = total_size.filter(|t| *t > 0) {
                let percent = (downloaded.min(total) * 100 / total) as u8;
                progress.report(model_type.display_name(), percent);
            }
        }

        file.flush().await.context("Failed to flush temp file")?;
        drop(file);

        let hash = format!("{:x}", hasher.finalize());
        if let Some(expected_hash) = self.expected_sha256(model_type) {
            if !hash.eq_ignore_ascii_case(expected_hash) {
                tokio::fs::remove_file(&temp_path).await.ok();
                anyhow::bail!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    model_type.filename(),
                    expected_hash,
                    hash
                );
            }
            info!("Checksum verified for {}", model_type.display_name());
        }

        tokio::fs::rename(&temp_path, path)
            .await
            .context("Failed to move downloaded file to final location")?;

        Ok(hash)
    }

    /// Update manifest after successful download
    fn update_manifest_for_model(&self, model_type: ModelType, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(model_type))?;

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes: metadata.len(),
            sha256,
            downloaded_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        if let Some(existing) = manifest.models.iter_mut().find(|m| m.filename == model_info.filename) {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    fn manifest_path(&self) -> PathBuf {
        self.models_dir.join("manifest.json")
    }

    /// Read `manifest.json`; an absent file is an empty manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let path = self.manifest_path();
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Corrupt model manifest {:?}", path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ModelManifest::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    /// Write `manifest.json` via a sibling temp file
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let path = self.manifest_path();
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(manifest)?)
            .with_context(|| format!("Failed to write {:?}", staging))?;
        std::fs::rename(&staging, &path).with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }
}

/// A committed ONNX Runtime session plus its tensor names
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Build an optimized session for `model_path` using `intra_threads` workers
    pub fn new(model_path: &Path, intra_threads: usize) -> Result<Self> {
        debug!("Building ONNX session for {:?} ({} threads)", model_path, intra_threads);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect::<Vec<_>>();
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect::<Vec<_>>();
        info!("Recognition session ready: {:?} -> {:?}", input_names, output_names);

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(dir: &Path) -> ModelManager {
        let config = ModelConfig {
            models_dir: Some(dir.to_path_buf()),
            offline: true,
            ..Default::default()
        };
        ModelManager::new(&config).unwrap()
    }

    #[test]
    fn test_model_type_filenames() {
        assert_eq!(ModelType::Recognition.filename(), "rec.onnx");
        assert_eq!(ModelType::Dictionary.filename(), "dict.txt");
    }

    #[test]
    fn test_model_availability_checks_size() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        assert!(!manager.is_model_available(ModelType::Dictionary));

        // Too small to be a real dictionary
        std::fs::write(manager.model_path(ModelType::Dictionary), "a\nb\n").unwrap();
        assert!(!manager.is_model_available(ModelType::Dictionary));

        let dict: String = (0..200).map(|i| format!("{}\n", i % 10)).collect();
        std::fs::write(manager.model_path(ModelType::Dictionary), dict).unwrap();
        assert!(manager.is_model_available(ModelType::Dictionary));
        assert!(!manager.are_models_ready());
    }

    #[tokio::test]
    async fn test_offline_missing_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        let err = manager
            .ensure_model(ModelType::Recognition, &Progress::none())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Offline mode"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        assert_eq!(manager.load_manifest().unwrap(), ModelManifest::default());

        let manifest = ModelManifest {
            version: "1.0.0".to_string(),
            models: vec![ModelInfo {
                model_type: "Recognition".to_string(),
                filename: "rec.onnx".to_string(),
                size_bytes: 42,
                sha256: "abc".to_string(),
                downloaded_at: 1_700_000_000,
            }],
        };
        manager.save_manifest(&manifest).unwrap();
        assert_eq!(manager.load_manifest().unwrap(), manifest);
    }
}
