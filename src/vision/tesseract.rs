//! Tesseract OCR backend
//!
//! The fast engine. Runs the `tesseract` binary on a PNG scratch file and
//! parses its TSV output so word confidences are available for the quality gate.

use std::io::Write;
use std::path::Path;
use std::process::Output;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use super::{EngineKind, EngineResult, OcrEngine, Progress};
use crate::config::TesseractConfig;
use crate::error::{ErrorCode, OcrError};
use crate::input::PixelBuffer;

const ENGINE_NAME: &str = "tesseract";

/// Tesseract engine wrapper
#[derive(Debug, Clone, Default)]
pub struct TesseractEngine {
    config: TesseractConfig,
}

impl TesseractEngine {
    pub fn new(config: TesseractConfig) -> Self {
        Self { config }
    }

    pub fn language(&self) -> &str {
        &self.config.language
    }

    /// Run tesseract on an image file, returning raw TSV
    async fn run_tesseract(&self, image_path: &Path) -> Result<String, OcrError> {
        let output = Command::new(&self.config.binary)
            .arg(image_path)
            .arg("stdout")
            .args(["-l", &self.config.language])
            .args(["--psm", &self.config.psm.to_string()])
            .arg("tsv")
            // A timeout drops this future; take the child down with it
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => Err(classify_failure(&output)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OcrError::new(ErrorCode::RuntimeNotSupported).with_details(json!({
                    "engine": ENGINE_NAME,
                    "binary": self.config.binary,
                    "message": "tesseract not found (install tesseract-ocr)",
                })))
            }
            Err(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                Err(OcrError::new(ErrorCode::OutOfMemory).with_context(e.to_string()))
            }
            Err(e) => Err(OcrError::new(ErrorCode::OcrProcessingFailed)
                .with_context(format!("failed to spawn tesseract: {}", e))),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fast
    }

    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn recognize(&self, image: &PixelBuffer, progress: &Progress) -> Result<EngineResult, OcrError> {
        let start = Instant::now();
        progress.report("preparing image", 0);

        let png = {
            let image = image.clone();
            tokio::task::spawn_blocking(move || image.to_png())
                .await
                .map_err(|e| {
                    OcrError::new(ErrorCode::OcrProcessingFailed)
                        .with_context(format!("encoder task failed: {}", e))
                })??
        };

        let mut scratch = tempfile::Builder::new()
            .prefix("textsieve-")
            .suffix(".png")
            .tempfile()
            .map_err(scratch_error)?;
        scratch.write_all(&png).map_err(scratch_error)?;
        scratch.flush().map_err(scratch_error)?;

        progress.report("recognizing text", 20);
        let tsv = self.run_tesseract(scratch.path()).await?;

        let result = parse_tsv(&tsv);
        progress.report("recognized", 100);

        info!(
            "Tesseract: {} chars at {:.1}% confidence in {:?}",
            result.text_length(),
            result.confidence,
            start.elapsed()
        );

        if result.text.trim().is_empty() {
            return Err(OcrError::new(ErrorCode::OcrNoTextFound)
                .with_details(json!({ "engine": ENGINE_NAME })));
        }

        Ok(result)
    }
}

fn scratch_error(e: std::io::Error) -> OcrError {
    let code = if e.kind() == std::io::ErrorKind::OutOfMemory {
        ErrorCode::OutOfMemory
    } else {
        ErrorCode::OcrProcessingFailed
    };
    OcrError::new(code).with_context(format!("scratch file: {}", e))
}

/// Map a non-zero exit into the taxonomy using tesseract's stderr
fn classify_failure(output: &Output) -> OcrError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lowered = stderr.to_lowercase();

    let code = if lowered.contains("bad_alloc") || lowered.contains("out of memory") {
        ErrorCode::OutOfMemory
    } else if lowered.contains("failed loading language") || lowered.contains("error opening data file") {
        ErrorCode::RuntimeNotSupported
    } else if lowered.contains("image file") && lowered.contains("cannot be read") {
        ErrorCode::ImageLoadFailed
    } else {
        ErrorCode::OcrProcessingFailed
    };

    OcrError::new(code).with_details(json!({
        "engine": ENGINE_NAME,
        "exit_code": output.status.code(),
        "stderr": stderr.trim(),
    }))
}

/// Rebuild text and mean word confidence from tesseract TSV output.
///
/// Words on the same line are joined by spaces, lines by newlines and
/// paragraphs/blocks by a blank line.
pub fn parse_tsv(tsv: &str) -> EngineResult {
    let mut text = String::new();
    let mut confidence_sum = 0.0f64;
    let mut word_count = 0usize;
    let mut last_line: Option<(u32, u32, u32)> = None;

    for row in tsv.lines().skip(1) {
        let columns: Vec<&str> = row.split('\t').collect();
        if columns.len() < 12 || columns[0] != "5" {
            continue;
        }

        let word = columns[11..].join("\t");
        let word = word.trim();
        let conf: f32 = columns[10].trim().parse().unwrap_or(-1.0);
        if word.is_empty() || conf < 0.0 {
            continue;
        }

        let parse = |s: &str| s.trim().parse::<u32>().unwrap_or(0);
        let line = (parse(columns[2]), parse(columns[3]), parse(columns[4]));

        match last_line {
            None => {}
            Some(prev) if prev == line => text.push(' '),
            Some(prev) if (prev.0, prev.1) == (line.0, line.1) => text.push('\n'),
            Some(_) => text.push_str("\n\n"),
        }
        last_line = Some(line);

        text.push_str(word);
        confidence_sum += conf as f64;
        word_count += 1;
    }

    let confidence = if word_count == 0 {
        0.0
    } else {
        (confidence_sum / word_count as f64) as f32
    };
    debug!("Parsed {} words from tesseract TSV", word_count);

    EngineResult::new(text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    fn row(block: u32, par: u32, line: u32, word: u32, conf: &str, text: &str) -> String {
        format!("5\t1\t{block}\t{par}\t{line}\t{word}\t0\t0\t10\t10\t{conf}\t{text}")
    }

    #[test]
    fn test_parse_tsv_joins_words_and_lines() {
        let tsv = [
            HEADER.to_string(),
            "1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t".to_string(),
            row(1, 1, 1, 1, "90", "INVOICE"),
            row(1, 1, 1, 2, "80", "#1234"),
            row(1, 1, 2, 1, "85", "Total"),
            row(2, 1, 1, 1, "85", "Thanks"),
        ]
        .join("\n");

        let result = parse_tsv(&tsv);
        assert_eq!(result.text, "INVOICE #1234\nTotal\n\nThanks");
        assert!((result.confidence - 85.0).abs() < 0.001);
    }

    #[test]
    fn test_parse_tsv_skips_empty_and_negative_conf() {
        let tsv = [
            HEADER.to_string(),
            row(1, 1, 1, 1, "-1", ""),
            row(1, 1, 1, 2, "95.5", "x"),
            row(1, 1, 1, 3, "40", "   "),
        ]
        .join("\n");

        let result = parse_tsv(&tsv);
        assert_eq!(result.text, "x");
        assert!((result.confidence - 95.5).abs() < 0.001);
    }

    #[test]
    fn test_parse_tsv_empty_output() {
        let result = parse_tsv(HEADER);
        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
        assert!(parse_tsv("").text.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_runtime_not_supported() {
        let engine = TesseractEngine::new(TesseractConfig {
            binary: "textsieve-definitely-missing-tesseract".to_string(),
            ..Default::default()
        });
        let image = PixelBuffer::filled(4, 4, [255, 255, 255, 255]).unwrap();

        let err = engine.recognize(&image, &Progress::none()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RuntimeNotSupported);
        assert!(!err.is_recoverable());
        assert_eq!(err.technical_details()["engine"], "tesseract");
    }

    #[test]
    fn test_engine_identity() {
        let engine = TesseractEngine::default();
        assert_eq!(engine.kind(), EngineKind::Fast);
        assert_eq!(engine.name(), "tesseract");
        assert_eq!(engine.language(), "eng");
    }
}
