//! TextSieve
//!
//! Image text extraction with a fast OCR engine, an accurate neural fallback
//! and a deterministic preprocessing pipeline in front of both.
//!
//! ```no_run
//! use textsieve::{ExtractOptions, Extractor, InputFile, OcrConfig};
//!
//! # async fn run() -> Result<(), textsieve::OcrError> {
//! let extractor = Extractor::from_config(OcrConfig::default());
//! let bytes = std::fs::read("scan.png").unwrap_or_default();
//! let text = extractor
//!     .extract(InputFile::new(bytes, "image/png"), &ExtractOptions::default())
//!     .await?;
//! println!("{}", text);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod input;
pub mod pipeline;
pub mod storage;
pub mod vision;

pub use config::{load_config, load_or_default, save_config, OcrConfig};
pub use error::{backoff_delay, retry_with_backoff, with_timeout, ErrorCode, OcrError};
pub use input::{decode, validate_file, ImageMime, InputFile, PixelBuffer};
pub use pipeline::{
    estimate_best_method, ExtractOptions, ExtractionMode, ExtractionResult, Extractor,
    FallbackReason, QualityGate,
};
pub use vision::{
    auto_options, auto_preprocess, preprocess, EngineKind, EngineResult, OcrEngine,
    PreprocessOptions, Preprocessing, Progress,
};
