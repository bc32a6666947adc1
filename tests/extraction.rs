//! End-to-end extraction scenarios against scripted engines

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;
use textsieve::{
    auto_options, validate_file, EngineKind, EngineResult, ErrorCode, ExtractOptions, ExtractionMode,
    Extractor, FallbackReason, InputFile, OcrConfig, OcrEngine, OcrError, PixelBuffer, PreprocessOptions,
    Preprocessing, Progress,
};

/// Engine that returns a fixed response, optionally after a delay
struct ScriptedEngine {
    kind: EngineKind,
    response: Result<EngineResult, OcrError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    fn new(kind: EngineKind, response: Result<EngineResult, OcrError>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            response,
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn hanging(kind: EngineKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            response: Ok(EngineResult::new("too late", 99.0)),
            delay: Some(Duration::from_secs(24 * 3600)),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn name(&self) -> &str {
        match self.kind {
            EngineKind::Fast => "scripted-fast",
            EngineKind::Accurate => "scripted-accurate",
        }
    }

    async fn recognize(&self, _image: &PixelBuffer, _progress: &Progress) -> Result<EngineResult, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.clone()
    }
}

/// Log output for `RUST_LOG=textsieve=debug cargo test`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sample_png() -> InputFile {
    let png = PixelBuffer::filled(32, 16, [240, 240, 240, 255])
        .unwrap()
        .to_png()
        .unwrap();
    InputFile::new(png, "image/png")
}

fn no_preprocessing() -> ExtractOptions {
    ExtractOptions::default().with_preprocessing(Preprocessing::None)
}

#[tokio::test]
async fn confident_fast_result_is_used_directly() {
    init_tracing();
    let fast = ScriptedEngine::new(EngineKind::Fast, Ok(EngineResult::new("INVOICE #1234", 85.0)));
    let accurate = ScriptedEngine::new(EngineKind::Accurate, Ok(EngineResult::new("unused", 50.0)));
    let extractor = Extractor::new(fast.clone(), accurate.clone(), OcrConfig::default());

    let result = extractor
        .extract_with_details(sample_png(), &no_preprocessing())
        .await
        .unwrap();

    assert_eq!(result.method, EngineKind::Fast);
    assert!(!result.fallback_used);
    assert_eq!(result.confidence, Some(85.0));
    assert_eq!(result.text, "INVOICE #1234");
    assert_eq!((fast.calls(), accurate.calls()), (1, 0));
}

#[tokio::test]
async fn short_fast_result_falls_back_to_accurate() {
    init_tracing();
    let fast = ScriptedEngine::new(EngineKind::Fast, Ok(EngineResult::new("x", 95.0)));
    let accurate = ScriptedEngine::new(
        EngineKind::Accurate,
        Ok(EngineResult::new("Thank you for your purchase", 0.0)),
    );
    let extractor = Extractor::new(fast.clone(), accurate.clone(), OcrConfig::default());

    let result = extractor
        .extract_with_details(sample_png(), &no_preprocessing())
        .await
        .unwrap();

    assert_eq!(result.method, EngineKind::Accurate);
    assert!(result.fallback_used);
    assert_eq!(result.text, "Thank you for your purchase");
    assert_eq!(result.confidence, Some(95.0));
    assert_eq!((fast.calls(), accurate.calls()), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn fast_timeout_falls_back_and_keeps_cause() {
    init_tracing();
    let fast = ScriptedEngine::hanging(EngineKind::Fast);
    let accurate = ScriptedEngine::new(EngineKind::Accurate, Ok(EngineResult::new("Recovered text", 0.0)));
    let extractor = Extractor::new(fast, accurate, OcrConfig::default());

    let result = extractor
        .extract_with_details(sample_png(), &no_preprocessing())
        .await
        .unwrap();

    assert!(result.fallback_used);
    assert_eq!(result.method, EngineKind::Accurate);
    assert_eq!(result.confidence, None);

    let Some(FallbackReason::FastFailed(cause)) = result.fallback_reason else {
        panic!("expected the fast failure to be recorded");
    };
    assert_eq!(cause.code(), ErrorCode::OcrTimeout);
    assert_eq!(cause.technical_details()["timeout_ms"], 60_000);
}

#[tokio::test(start_paused = true)]
async fn accurate_timeout_after_fast_failure_is_combined() {
    let fast = ScriptedEngine::new(EngineKind::Fast, Err(OcrError::new(ErrorCode::OcrNoTextFound)));
    let accurate = ScriptedEngine::hanging(EngineKind::Accurate);
    let extractor = Extractor::new(fast, accurate, OcrConfig::default());

    let err = extractor
        .extract(sample_png(), &no_preprocessing())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::OcrProcessingFailed);
    let details = err.technical_details();
    assert_eq!(details["accurate_error"]["code"], "OCR_TIMEOUT");
    assert_eq!(details["accurate_error"]["technical_details"]["timeout_ms"], 120_000);
}

#[tokio::test]
async fn both_engines_failing_reports_both_causes() {
    init_tracing();
    let fast = ScriptedEngine::new(
        EngineKind::Fast,
        Err(OcrError::new(ErrorCode::RuntimeNotSupported).with_context("tesseract missing")),
    );
    let accurate = ScriptedEngine::new(
        EngineKind::Accurate,
        Err(OcrError::new(ErrorCode::NetworkError).with_context("connection refused")),
    );
    let extractor = Extractor::new(fast, accurate, OcrConfig::default());

    let err = extractor
        .extract(sample_png(), &no_preprocessing())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::OcrProcessingFailed);
    assert!(!err.suggestions().is_empty());

    let details = err.technical_details();
    assert_eq!(details["fast_error"]["code"], "RUNTIME_NOT_SUPPORTED");
    assert_eq!(details["fast_error"]["technical_details"]["message"], "tesseract missing");
    assert_eq!(details["accurate_error"]["code"], "NETWORK_ERROR");
    assert_eq!(details["accurate_error"]["technical_details"]["message"], "connection refused");
}

#[test]
fn dark_large_image_gets_dark_preset_without_upscale() {
    let image = PixelBuffer::filled(4000, 3000, [40, 40, 40, 255]).unwrap();

    let options = auto_options(&image);

    assert!(options.grayscale);
    assert!(options.sharpen);
    assert!(options.binarize);
    assert_eq!(options.brightness, Some(30.0));
    assert_eq!(options.contrast, Some(1.5));
    assert_eq!(options.upscale, None);
}

#[tokio::test]
async fn oversized_file_is_rejected_before_any_work() {
    init_tracing();
    let err = validate_file(22 * 1024 * 1024, "image/png", &OcrConfig::default().limits).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileTooLarge);

    let fast = ScriptedEngine::new(EngineKind::Fast, Ok(EngineResult::new("unused", 90.0)));
    let accurate = ScriptedEngine::new(EngineKind::Accurate, Ok(EngineResult::new("unused", 90.0)));
    let extractor = Extractor::new(fast.clone(), accurate.clone(), OcrConfig::default());

    let file = InputFile::new(vec![0u8; 25 * 1024 * 1024], "image/png");
    let err = extractor.extract(file, &ExtractOptions::default()).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::FileTooLarge);
    assert!(err.is_recoverable());
    assert_eq!((fast.calls(), accurate.calls()), (0, 0));
}

#[tokio::test]
async fn unsupported_type_is_rejected_before_any_work() {
    let fast = ScriptedEngine::new(EngineKind::Fast, Ok(EngineResult::new("unused", 90.0)));
    let accurate = ScriptedEngine::new(EngineKind::Accurate, Ok(EngineResult::new("unused", 90.0)));
    let extractor = Extractor::new(fast.clone(), accurate.clone(), OcrConfig::default());

    let file = InputFile::new(b"hello world".to_vec(), "text/plain");
    let err = extractor.extract(file, &ExtractOptions::default()).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::FileInvalidType);
    assert_eq!((fast.calls(), accurate.calls()), (0, 0));
}

#[tokio::test]
async fn forced_accurate_mode_skips_fast_engine() {
    let fast = ScriptedEngine::new(EngineKind::Fast, Ok(EngineResult::new("fast", 99.0)));
    let accurate = ScriptedEngine::new(EngineKind::Accurate, Ok(EngineResult::new("deep read", 70.0)));
    let extractor = Extractor::new(fast.clone(), accurate.clone(), OcrConfig::default());

    let options = no_preprocessing().with_mode(ExtractionMode::Accurate);
    let text = extractor.extract(sample_png(), &options).await.unwrap();

    assert_eq!(text, "deep read");
    assert_eq!((fast.calls(), accurate.calls()), (0, 1));
}

#[tokio::test]
async fn auto_preprocessing_runs_before_engines() {
    let fast = ScriptedEngine::new(EngineKind::Fast, Ok(EngineResult::new("Receipt total", 88.0)));
    let accurate = ScriptedEngine::new(EngineKind::Accurate, Ok(EngineResult::new("unused", 50.0)));
    let extractor = Extractor::new(fast.clone(), accurate, OcrConfig::default());

    let result = extractor
        .extract_with_details(sample_png(), &ExtractOptions::default())
        .await
        .unwrap();

    assert_eq!(result.method, EngineKind::Fast);
    assert_eq!(fast.calls(), 1);
}

#[tokio::test]
async fn oversized_upscale_request_still_extracts() {
    init_tracing();
    let fast = ScriptedEngine::new(EngineKind::Fast, Ok(EngineResult::new("INVOICE #1234", 85.0)));
    let accurate = ScriptedEngine::new(EngineKind::Accurate, Ok(EngineResult::new("unused", 50.0)));
    let extractor = Extractor::new(fast.clone(), accurate.clone(), OcrConfig::default());

    let options = ExtractOptions::default().with_preprocessing(Preprocessing::Custom(PreprocessOptions {
        upscale: Some(1e10),
        grayscale: true,
        ..Default::default()
    }));
    let result = extractor.extract_with_details(sample_png(), &options).await.unwrap();

    assert_eq!(result.method, EngineKind::Fast);
    assert_eq!(result.text, "INVOICE #1234");
    assert_eq!((fast.calls(), accurate.calls()), (1, 0));
}

#[test]
fn empty_file_of_wrong_type_reports_type() {
    let limits = OcrConfig::default().limits;

    let err = validate_file(0, "text/plain", &limits).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileInvalidType);

    let err = validate_file(0, "image/png", &limits).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FileCorrupted);
}
