//! Neural text recognition
//!
//! Runs a PaddleOCR CRNN recognition model via ONNX Runtime on each text line
//! found in the page and CTC-decodes the output with the character dictionary.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ort::value::Tensor;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use super::models::{ModelManager, ModelType, OnnxSession};
use super::neural::{ModelLoader, TextRecognizer};
use super::preprocess::{preprocess_for_recognition, segment_lines, RecognitionInput};
use super::{EngineResult, Progress};
use crate::config::ModelConfig;
use crate::error::{ErrorCode, OcrError};
use crate::input::PixelBuffer;

/// CRNN recognizer over an ONNX session
pub struct OnnxRecognizer {
    session: Mutex<OnnxSession>,
    /// Index 0 is the CTC blank
    charset: Vec<String>,
    input: RecognitionInput,
}

impl OnnxRecognizer {
    pub fn new(session: OnnxSession, dictionary: &str) -> Self {
        Self {
            session: Mutex::new(session),
            charset: build_charset(dictionary),
            input: RecognitionInput::default(),
        }
    }

    /// Run one line through the model; returns (text, mean probability)
    fn recognize_line(&self, tensor: ndarray::Array4<f32>) -> Result<(String, f32), OcrError> {
        let shape: Vec<usize> = tensor.shape().to_vec();
        let (data, _offset) = tensor.into_raw_vec_and_offset();
        let value = Tensor::from_array(([shape[0], shape[1], shape[2], shape[3]], data))
            .map_err(|e| inference_error("failed to build input tensor", &e))?;

        let (dims, logits) = {
            let mut session = self.session.lock();
            let input_name = session
                .input_names()
                .first()
                .cloned()
                .unwrap_or_else(|| "x".to_string());
            let output_name = session.output_names().first().cloned();

            let outputs = session
                .session_mut()
                .run(ort::inputs![input_name => value])
                .map_err(|e| inference_error("inference failed", &e))?;

            let output = match output_name {
                Some(name) => &outputs[name.as_str()],
                None => {
                    return Err(OcrError::new(ErrorCode::OcrProcessingFailed)
                        .with_context("recognition model has no outputs"))
                }
            };

            let (shape, logits) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| inference_error("unexpected output type", &e))?;

            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            (dims, logits.to_vec())
        };

        let (steps, classes) = match dims.as_slice() {
            [1, steps, classes] => (*steps, *classes),
            [steps, 1, classes] => (*steps, *classes),
            [steps, classes] => (*steps, *classes),
            _ => {
                return Err(OcrError::new(ErrorCode::OcrProcessingFailed)
                    .with_details(json!({ "message": "unexpected output shape", "shape": dims })))
            }
        };

        Ok(ctc_decode(&logits, steps, classes, &self.charset))
    }
}

impl TextRecognizer for OnnxRecognizer {
    fn recognize(&self, image: &PixelBuffer) -> Result<EngineResult, OcrError> {
        let lines = segment_lines(image);
        debug!("Recognizing {} text lines", lines.len());

        let mut texts = Vec::with_capacity(lines.len());
        let mut confidences = Vec::with_capacity(lines.len());

        for region in lines {
            let tensor = preprocess_for_recognition(image, region, &self.input);
            let (text, confidence) = self.recognize_line(tensor)?;
            let text = text.trim().to_string();
            if !text.is_empty() {
                texts.push(text);
                confidences.push(confidence);
            }
        }

        let confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32 * 100.0
        };

        Ok(EngineResult::new(texts.join("\n"), confidence))
    }
}

fn inference_error(message: &str, error: &ort::Error) -> OcrError {
    let detail = error.to_string();
    let code = if looks_like_oom(&detail) {
        ErrorCode::OutOfMemory
    } else {
        ErrorCode::OcrProcessingFailed
    };
    OcrError::new(code).with_details(json!({ "message": message, "cause": detail }))
}

fn looks_like_oom(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("out of memory") || lowered.contains("bad_alloc") || lowered.contains("failed to allocate")
}

/// Blank, then one entry per dictionary line, then space
pub fn build_charset(dictionary: &str) -> Vec<String> {
    let mut charset = vec![String::new()];
    charset.extend(
        dictionary
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string),
    );
    charset.push(" ".to_string());
    charset
}

/// Greedy CTC decode: argmax per step, collapse repeats, drop blanks.
/// Rows that are not probability distributions are softmaxed first.
pub fn ctc_decode(logits: &[f32], steps: usize, classes: usize, charset: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut probabilities = Vec::new();
    let mut previous = 0usize;

    for row in logits.chunks_exact(classes.max(1)).take(steps) {
        let sum: f32 = row.iter().sum();
        let is_distribution = row.iter().all(|&p| (0.0..=1.0).contains(&p)) && (sum - 1.0).abs() < 0.05;

        let (best, best_value) = row
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc });

        let probability = if is_distribution {
            best_value
        } else {
            let max = best_value;
            let denom: f32 = row.iter().map(|&v| (v - max).exp()).sum();
            1.0 / denom
        };

        if best != 0 && best != previous {
            if let Some(ch) = charset.get(best) {
                text.push_str(ch);
                probabilities.push(probability);
            }
        }
        previous = best;
    }

    let confidence = if probabilities.is_empty() {
        0.0
    } else {
        probabilities.iter().sum::<f32>() / probabilities.len() as f32
    };

    (text, confidence)
}

/// Loads (downloading if needed) the recognition model and dictionary
pub struct OnnxModelLoader {
    config: ModelConfig,
}

impl OnnxModelLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ModelLoader for OnnxModelLoader {
    fn name(&self) -> &str {
        "paddleocr-crnn"
    }

    async fn load(&self, progress: &Progress) -> Result<Arc<dyn TextRecognizer>, OcrError> {
        let manager = ModelManager::new(&self.config).map_err(|e| {
            OcrError::new(ErrorCode::ModelLoadFailed).with_context(format!("{:#}", e))
        })?;

        if self.config.is_offline() && !manager.are_models_ready() {
            return Err(OcrError::new(ErrorCode::NetworkError).with_details(json!({
                "message": "offline mode and recognition model is not cached",
                "models_dir": manager.models_dir(),
            })));
        }

        let model_path = manager
            .ensure_model(ModelType::Recognition, &progress.scoped(0, 70))
            .await
            .map_err(download_error)?;
        let dictionary_path = manager
            .ensure_model(ModelType::Dictionary, &progress.scoped(70, 80))
            .await
            .map_err(download_error)?;

        let dictionary = tokio::fs::read_to_string(&dictionary_path).await.map_err(|e| {
            OcrError::new(ErrorCode::ModelLoadFailed)
                .with_context(format!("failed to read dictionary {:?}: {}", dictionary_path, e))
        })?;

        progress.report("initializing model", 85);
        let threads = self.config.intra_threads;
        let session = tokio::task::spawn_blocking(move || build_session(&model_path, threads))
            .await
            .map_err(|e| {
                OcrError::new(ErrorCode::ModelLoadFailed).with_context(format!("loader task failed: {}", e))
            })??;

        let recognizer = OnnxRecognizer::new(session, &dictionary);
        info!("Recognizer ready with {} characters", recognizer.charset.len());

        Ok(Arc::new(recognizer))
    }
}

fn build_session(model_path: &Path, threads: usize) -> Result<OnnxSession, OcrError> {
    OnnxSession::new(model_path, threads).map_err(|e| {
        let detail = format!("{:#}", e);
        let code = if looks_like_oom(&detail) {
            ErrorCode::OutOfMemory
        } else {
            ErrorCode::ModelLoadFailed
        };
        OcrError::new(code).with_details(json!({ "model": model_path, "cause": detail }))
    })
}

/// Network problems are `NETWORK_ERROR`; anything else (disk, checksum) is a load failure
fn download_error(error: anyhow::Error) -> OcrError {
    let network = error.chain().any(|cause| cause.is::<reqwest::Error>());
    let code = if network {
        ErrorCode::NetworkError
    } else {
        ErrorCode::ModelLoadFailed
    };
    OcrError::new(code).with_context(format!("{:#}", error))
}
