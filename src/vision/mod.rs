//! Vision/OCR Layer
//!
//! Image conditioning and the two OCR engines behind one interface:
//! - Tesseract (fast, local, pattern based)
//! - CRNN recognizer via ONNX Runtime (accurate, neural, lazily loaded)

pub mod models;
pub mod neural;
pub mod ocr;
pub mod ocr_preprocess;
pub mod preprocess;
pub mod tesseract;

pub use models::{ModelManager, ModelType, OnnxSession};
pub use neural::{ModelLoader, NeuralEngine, TextRecognizer};
pub use ocr::{OnnxModelLoader, OnnxRecognizer};
pub use ocr_preprocess::{
    auto_options, auto_preprocess, preprocess, preprocess_with_report, PreprocessOptions,
    PreprocessOutcome, Preprocessing,
};
pub use tesseract::TesseractEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::OcrError;
use crate::input::PixelBuffer;

/// Which engine produced (or should produce) a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Lightweight, low-latency engine for clean printed text
    Fast,
    /// Heavier model-based engine for complex layouts
    Accurate,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Fast => f.write_str("fast"),
            EngineKind::Accurate => f.write_str("accurate"),
        }
    }
}

/// Text recognized by one engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResult {
    pub text: String,
    /// Confidence score (0 - 100)
    pub confidence: f32,
}

impl EngineResult {
    /// Create a result, clamping confidence into 0 - 100
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            text: text.into(),
            confidence,
        }
    }

    /// Length in characters of the trimmed text
    pub fn text_length(&self) -> usize {
        self.text.trim().chars().count()
    }
}

/// Progress callback: (status, percent 0 - 100)
pub type ProgressCallback = Arc<dyn Fn(&str, u8) + Send + Sync>;

/// Optional progress sink passed down through preprocessing and engine calls
#[derive(Clone, Default)]
pub struct Progress {
    callback: Option<ProgressCallback>,
}

impl Progress {
    pub fn new(callback: ProgressCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    pub fn from_fn<F>(callback: F) -> Self
    where
        F: Fn(&str, u8) + Send + Sync + 'static,
    {
        Self::new(Arc::new(callback))
    }

    /// Sink that drops every report
    pub fn none() -> Self {
        Self { callback: None }
    }

    pub fn report(&self, status: &str, percent: u8) {
        if let Some(callback) = &self.callback {
            callback(status, percent.min(100));
        }
    }

    /// Sink that maps this stage's 0 - 100 onto `start..=end` of the parent
    pub fn scoped(&self, start: u8, end: u8) -> Progress {
        let Some(parent) = self.callback.clone() else {
            return Progress::none();
        };
        let start = start.min(100);
        let end = end.clamp(start, 100);
        let span = (end - start) as u32;

        Progress::from_fn(move |status, percent| {
            let mapped = start as u32 + span * percent.min(100) as u32 / 100;
            parent(status, mapped as u8);
        })
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("enabled", &self.callback.is_some())
            .finish()
    }
}

/// Uniform interface over the OCR engines.
///
/// Implementations translate every engine-specific failure into an
/// [`OcrError`] before returning, and fail with `OCR_NO_TEXT_FOUND` rather than
/// returning empty text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Engine name used in logs and error details
    fn name(&self) -> &str;

    async fn recognize(&self, image: &PixelBuffer, progress: &Progress) -> Result<EngineResult, OcrError>;

    /// Release cached resources; the next call reinitializes them
    async fn dispose(&self) {}
}
