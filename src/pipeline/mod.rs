//! Extraction Orchestrator
//!
//! Validates and decodes the input, conditions the image, then runs the fast
//! engine and falls back to the accurate one when the fast result fails or
//! does not pass the quality gate.

pub mod estimate;

pub use estimate::estimate_best_method;

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::OcrConfig;
use crate::error::{with_timeout, ErrorCode, OcrError};
use crate::input::{decode, validate_file, InputFile, PixelBuffer};
use crate::vision::{
    auto_options, preprocess_with_report, EngineKind, EngineResult, NeuralEngine, OcrEngine,
    OnnxModelLoader, Preprocessing, Progress, TesseractEngine,
};

/// Which engines an extraction may run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Fast engine, falling back to the accurate engine
    #[default]
    Auto,
    /// Fast engine only
    Fast,
    /// Accurate engine only
    Accurate,
    /// Both engines concurrently; the fast result wins if it passes the gate
    Parallel,
}

/// Per-call overrides. Unset thresholds come from [`OcrConfig`].
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub preprocessing: Preprocessing,
    pub mode: ExtractionMode,
    pub min_confidence: Option<f32>,
    pub min_text_length: Option<usize>,
    /// In forced modes, fail with `OCR_LOW_QUALITY` instead of returning a
    /// result that misses the gate
    pub reject_low_quality: bool,
    pub progress: Progress,
}

impl ExtractOptions {
    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_preprocessing(mut self, preprocessing: Preprocessing) -> Self {
        self.preprocessing = preprocessing;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }
}

/// Minimum length and confidence a fast result needs to be accepted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub min_confidence: f32,
    pub min_text_length: usize,
}

impl QualityGate {
    /// Both conditions must hold
    pub fn accepts(&self, result: &EngineResult) -> bool {
        result.text_length() >= self.min_text_length && result.confidence >= self.min_confidence
    }

    fn rejection(&self, result: &EngineResult) -> OcrError {
        OcrError::new(ErrorCode::OcrLowQuality).with_details(json!({
            "confidence": result.confidence,
            "text_length": result.text_length(),
            "min_confidence": self.min_confidence,
            "min_text_length": self.min_text_length,
        }))
    }
}

/// Why the fast path was not used
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// Fast engine returned text that missed the quality gate
    LowQuality { confidence: f32, text_length: usize },
    /// Fast engine failed (including timeouts)
    FastFailed(OcrError),
}

/// Final result of one extraction call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub text: String,
    pub method: EngineKind,
    /// Fast engine confidence when it ran, even if its text was not used
    pub confidence: Option<f32>,
    pub fallback_used: bool,
    pub duration_ms: u64,
    pub fallback_reason: Option<FallbackReason>,
}

/// Fast-engine verdict
enum FastOutcome {
    Accepted(EngineResult),
    Rejected {
        confidence: Option<f32>,
        reason: FallbackReason,
    },
}

/// Runs extractions against a fast and an accurate engine
pub struct Extractor {
    fast: Arc<dyn OcrEngine>,
    accurate: Arc<dyn OcrEngine>,
    config: OcrConfig,
}

impl Extractor {
    pub fn new(fast: Arc<dyn OcrEngine>, accurate: Arc<dyn OcrEngine>, config: OcrConfig) -> Self {
        Self {
            fast,
            accurate,
            config,
        }
    }

    /// Tesseract as the fast engine, the ONNX recognizer as the accurate one
    pub fn from_config(config: OcrConfig) -> Self {
        let fast = Arc::new(TesseractEngine::new(config.tesseract.clone()));
        let accurate = Arc::new(NeuralEngine::new(OnnxModelLoader::new(config.model.clone())));
        Self::new(fast, accurate, config)
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    /// Extract text, discarding the diagnostics
    pub async fn extract(&self, file: InputFile, options: &ExtractOptions) -> Result<String, OcrError> {
        self.extract_with_details(file, options)
            .await
            .map(|result| result.text)
    }

    /// Extract text and report which engine produced it
    pub async fn extract_with_details(
        &self,
        file: InputFile,
        options: &ExtractOptions,
    ) -> Result<ExtractionResult, OcrError> {
        let start = Instant::now();
        let progress = &options.progress;

        progress.report("validating", 0);
        let mime = validate_file(file.size_bytes(), &file.mime_type, &self.config.limits)
            .inspect_err(|e| warn!("Rejected input: {}", e.code()))?;

        progress.report("decoding", 5);
        let bytes = file.bytes;
        let buffer = tokio::task::spawn_blocking(move || decode(&bytes, mime))
            .await
            .map_err(|e| {
                OcrError::new(ErrorCode::ImageLoadFailed).with_context(format!("decoder task failed: {}", e))
            })??;

        progress.report("preprocessing", 10);
        let image = self
            .condition(buffer, &options.preprocessing, progress.scoped(10, 30))
            .await;

        let gate = QualityGate {
            min_confidence: options
                .min_confidence
                .unwrap_or(self.config.extraction.min_confidence),
            min_text_length: options
                .min_text_length
                .unwrap_or(self.config.extraction.min_text_length),
        };

        let mut result = match options.mode {
            ExtractionMode::Auto => self.run_fallback_chain(&image, &gate, progress).await?,
            ExtractionMode::Fast => {
                self.run_forced(self.fast.as_ref(), &image, &gate, options, progress)
                    .await?
            }
            ExtractionMode::Accurate => {
                self.run_forced(self.accurate.as_ref(), &image, &gate, options, progress)
                    .await?
            }
            ExtractionMode::Parallel => self.run_parallel(&image, &gate, progress).await?,
        };

        result.duration_ms = start.elapsed().as_millis() as u64;
        progress.report("done", 100);

        info!(
            "Extracted {} chars with {} engine in {}ms (fallback: {})",
            result.text.trim().chars().count(),
            result.method,
            result.duration_ms,
            result.fallback_used
        );

        Ok(result)
    }

    /// Release engine resources; the next extraction reloads them
    pub async fn dispose(&self) {
        self.fast.dispose().await;
        self.accurate.dispose().await;
    }

    /// Never fails: if the preprocessing task dies, the decoded image is used as-is
    async fn condition(&self, buffer: PixelBuffer, preprocessing: &Preprocessing, progress: Progress) -> PixelBuffer {
        let options = match preprocessing {
            Preprocessing::None => return buffer,
            Preprocessing::Auto => auto_options(&buffer),
            Preprocessing::Custom(options) if options.is_noop() => return buffer,
            Preprocessing::Custom(options) => options.clone(),
        };

        let limits = self.config.limits.clone();
        let original = buffer.clone();
        let task =
            tokio::task::spawn_blocking(move || preprocess_with_report(buffer, &options, &limits, &progress));

        match task.await {
            Ok(outcome) => {
                if !outcome.degraded.is_empty() {
                    debug!("{} preprocessing stage(s) skipped", outcome.degraded.len());
                }
                outcome.buffer
            }
            Err(e) => {
                warn!("Preprocessing task failed, using the decoded image: {}", e);
                original
            }
        }
    }

    /// Run one engine under its timeout. Empty text counts as a failure.
    async fn run_engine(
        &self,
        engine: &dyn OcrEngine,
        image: &PixelBuffer,
        progress: Progress,
    ) -> Result<EngineResult, OcrError> {
        let limit = self.timeout_for(engine.kind());
        let operation = format!("{} OCR ({})", engine.kind(), engine.name());
        debug!("Running {} with {:?} timeout", operation, limit);

        let result = with_timeout(engine.recognize(image, &progress), limit, &operation).await?;

        if result.text.trim().is_empty() {
            return Err(OcrError::new(ErrorCode::OcrNoTextFound)
                .with_details(json!({ "engine": engine.name() })));
        }

        Ok(result)
    }

    fn timeout_for(&self, kind: EngineKind) -> Duration {
        match kind {
            EngineKind::Fast => self.config.extraction.fast_timeout(),
            EngineKind::Accurate => self.config.extraction.accurate_timeout(),
        }
    }

    fn judge_fast(result: Result<EngineResult, OcrError>, gate: &QualityGate) -> FastOutcome {
        match result {
            Ok(result) if gate.accepts(&result) => FastOutcome::Accepted(result),
            Ok(result) => {
                info!(
                    "Fast OCR below quality gate ({} chars at {:.1}%), falling back",
                    result.text_length(),
                    result.confidence
                );
                FastOutcome::Rejected {
                    confidence: Some(result.confidence),
                    reason: FallbackReason::LowQuality {
                        confidence: result.confidence,
                        text_length: result.text_length(),
                    },
                }
            }
            Err(e) => {
                warn!("Fast OCR failed with {}, falling back", e.code());
                FastOutcome::Rejected {
                    confidence: None,
                    reason: FallbackReason::FastFailed(e),
                }
            }
        }
    }

    fn accept_fast(result: EngineResult) -> ExtractionResult {
        ExtractionResult {
            text: result.text,
            method: EngineKind::Fast,
            confidence: Some(result.confidence),
            fallback_used: false,
            duration_ms: 0,
            fallback_reason: None,
        }
    }

    /// Combine a rejected fast attempt with the accurate engine's outcome
    fn finish_fallback(
        confidence: Option<f32>,
        reason: FallbackReason,
        accurate: Result<EngineResult, OcrError>,
        gate: &QualityGate,
    ) -> Result<ExtractionResult, OcrError> {
        match accurate {
            Ok(result) => Ok(ExtractionResult {
                text: result.text,
                method: EngineKind::Accurate,
                confidence,
                fallback_used: true,
                duration_ms: 0,
                fallback_reason: Some(reason),
            }),
            Err(accurate_error) => {
                let fast_error = match reason {
                    FallbackReason::FastFailed(e) => e,
                    FallbackReason::LowQuality {
                        confidence,
                        text_length,
                    } => OcrError::new(ErrorCode::OcrLowQuality).with_details(json!({
                        "confidence": confidence,
                        "text_length": text_length,
                        "min_confidence": gate.min_confidence,
                        "min_text_length": gate.min_text_length,
                    })),
                };
                warn!(
                    "Both engines failed (fast: {}, accurate: {})",
                    fast_error.code(),
                    accurate_error.code()
                );
                Err(OcrError::combined(&fast_error, &accurate_error))
            }
        }
    }

    async fn run_fallback_chain(
        &self,
        image: &PixelBuffer,
        gate: &QualityGate,
        progress: &Progress,
    ) -> Result<ExtractionResult, OcrError> {
        let fast = self
            .run_engine(self.fast.as_ref(), image, progress.scoped(30, 60))
            .await;

        let (confidence, reason) = match Self::judge_fast(fast, gate) {
            FastOutcome::Accepted(result) => return Ok(Self::accept_fast(result)),
            FastOutcome::Rejected { confidence, reason } => (confidence, reason),
        };

        let accurate = self
            .run_engine(self.accurate.as_ref(), image, progress.scoped(60, 95))
            .await;

        Self::finish_fallback(confidence, reason, accurate, gate)
    }

    async fn run_parallel(
        &self,
        image: &PixelBuffer,
        gate: &QualityGate,
        progress: &Progress,
    ) -> Result<ExtractionResult, OcrError> {
        let (fast, accurate) = tokio::join!(
            self.run_engine(self.fast.as_ref(), image, progress.scoped(30, 60)),
            self.run_engine(self.accurate.as_ref(), image, progress.scoped(60, 95)),
        );

        match Self::judge_fast(fast, gate) {
            FastOutcome::Accepted(result) => Ok(Self::accept_fast(result)),
            FastOutcome::Rejected { confidence, reason } => {
                Self::finish_fallback(confidence, reason, accurate, gate)
            }
        }
    }

    /// Single engine, no fallback and no gate unless `reject_low_quality` is set
    async fn run_forced(
        &self,
        engine: &dyn OcrEngine,
        image: &PixelBuffer,
        gate: &QualityGate,
        options: &ExtractOptions,
        progress: &Progress,
    ) -> Result<ExtractionResult, OcrError> {
        let result = self.run_engine(engine, image, progress.scoped(30, 95)).await?;

        if options.reject_low_quality && !gate.accepts(&result) {
            return Err(gate
                .rejection(&result)
                .with_details(json!({ "engine": engine.name() })));
        }

        Ok(ExtractionResult {
            text: result.text,
            method: engine.kind(),
            confidence: Some(result.confidence),
            fallback_used: false,
            duration_ms: 0,
            fallback_reason: None,
        })
    }
}
