//! Error taxonomy
//!
//! Every failure surfaced by the pipeline is an [`OcrError`] carrying a code
//! from the closed [`ErrorCode`] set, a short user-facing message, at least one
//! suggestion, a recoverability flag and opaque technical details for logs.

pub mod recovery;

pub use recovery::{backoff_delay, retry_with_backoff, with_timeout};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

/// Closed set of failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FileTooLarge,
    FileInvalidType,
    FileCorrupted,
    OcrNoTextFound,
    OcrLowQuality,
    OcrProcessingFailed,
    OcrTimeout,
    PreprocessingFailed,
    ImageLoadFailed,
    ModelLoadFailed,
    NetworkError,
    RuntimeNotSupported,
    OutOfMemory,
}

impl ErrorCode {
    /// All codes, in declaration order
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::FileTooLarge,
        ErrorCode::FileInvalidType,
        ErrorCode::FileCorrupted,
        ErrorCode::OcrNoTextFound,
        ErrorCode::OcrLowQuality,
        ErrorCode::OcrProcessingFailed,
        ErrorCode::OcrTimeout,
        ErrorCode::PreprocessingFailed,
        ErrorCode::ImageLoadFailed,
        ErrorCode::ModelLoadFailed,
        ErrorCode::NetworkError,
        ErrorCode::RuntimeNotSupported,
        ErrorCode::OutOfMemory,
    ];

    /// Machine-checkable code string
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::FileInvalidType => "FILE_INVALID_TYPE",
            ErrorCode::FileCorrupted => "FILE_CORRUPTED",
            ErrorCode::OcrNoTextFound => "OCR_NO_TEXT_FOUND",
            ErrorCode::OcrLowQuality => "OCR_LOW_QUALITY",
            ErrorCode::OcrProcessingFailed => "OCR_PROCESSING_FAILED",
            ErrorCode::OcrTimeout => "OCR_TIMEOUT",
            ErrorCode::PreprocessingFailed => "PREPROCESSING_FAILED",
            ErrorCode::ImageLoadFailed => "IMAGE_LOAD_FAILED",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::RuntimeNotSupported => "RUNTIME_NOT_SUPPORTED",
            ErrorCode::OutOfMemory => "OUT_OF_MEMORY",
        }
    }

    /// Whether the caller can reasonably try again (possibly after changing the input)
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorCode::FileCorrupted | ErrorCode::OcrNoTextFound | ErrorCode::RuntimeNotSupported
        )
    }

    /// Short message suitable for showing to an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::FileTooLarge => "The image is too large to process.",
            ErrorCode::FileInvalidType => "This file type is not supported.",
            ErrorCode::FileCorrupted => "The image could not be read. It may be damaged.",
            ErrorCode::OcrNoTextFound => "No text was found in the image.",
            ErrorCode::OcrLowQuality => "Text was found, but the recognition quality is low.",
            ErrorCode::OcrProcessingFailed => "Text extraction failed.",
            ErrorCode::OcrTimeout => "Text extraction took too long and was stopped.",
            ErrorCode::PreprocessingFailed => "The image could not be prepared for text extraction.",
            ErrorCode::ImageLoadFailed => "The image loaded but could not be used.",
            ErrorCode::ModelLoadFailed => "The text recognition model could not be loaded.",
            ErrorCode::NetworkError => "A network error occurred while fetching recognition data.",
            ErrorCode::RuntimeNotSupported => "This system is missing a component required for text extraction.",
            ErrorCode::OutOfMemory => "Not enough memory to process this image.",
        }
    }

    /// Non-empty list of next steps for the user
    pub fn suggestions(&self) -> &'static [&'static str] {
        match self {
            ErrorCode::FileTooLarge => &[
                "Resize or compress the image to under 20 MB",
                "Crop the image to the area containing text",
            ],
            ErrorCode::FileInvalidType => &["Use a PNG, JPEG or WEBP image"],
            ErrorCode::FileCorrupted => &[
                "Re-export or re-save the image and try again",
                "Try a different image file",
            ],
            ErrorCode::OcrNoTextFound => &[
                "Make sure the image contains readable text",
                "Try a higher resolution image",
                "Check that the text is not rotated or upside down",
            ],
            ErrorCode::OcrLowQuality => &[
                "Use a sharper, better lit image",
                "Enable image preprocessing",
                "Try the accurate recognition mode",
            ],
            ErrorCode::OcrProcessingFailed => &[
                "Try again",
                "Try a different image or recognition mode",
            ],
            ErrorCode::OcrTimeout => &[
                "Try a smaller image",
                "Crop the image to the area containing text",
                "Try again",
            ],
            ErrorCode::PreprocessingFailed => &[
                "Try again without preprocessing",
                "Try a smaller image",
            ],
            ErrorCode::ImageLoadFailed => &["Re-save the image in PNG format and try again"],
            ErrorCode::ModelLoadFailed => &[
                "Try again",
                "Free some memory and retry",
                "Use the fast recognition mode",
            ],
            ErrorCode::NetworkError => &[
                "Check your internet connection",
                "Try again in a moment",
            ],
            ErrorCode::RuntimeNotSupported => &[
                "Install the missing OCR component (for example tesseract-ocr)",
                "Use a different recognition mode",
            ],
            ErrorCode::OutOfMemory => &[
                "Try a smaller image",
                "Close other applications and try again",
            ],
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline failure
///
/// Fields are private: the only way to build one is [`OcrError::new`] (plus the
/// builder methods), so every error carries a message and suggestions.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{code}: {user_message}")]
pub struct OcrError {
    code: ErrorCode,
    user_message: String,
    suggestions: Vec<String>,
    recoverable: bool,
    technical_details: Value,
}

impl OcrError {
    /// Create an error for the given code with its standard message and suggestions
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            user_message: code.user_message().to_string(),
            suggestions: code.suggestions().iter().map(|s| s.to_string()).collect(),
            recoverable: code.is_recoverable(),
            technical_details: Value::Object(Map::new()),
        }
    }

    /// Merge extra technical details. Object keys are merged, anything else is
    /// stored under `"details"`.
    pub fn with_details(mut self, details: Value) -> Self {
        let map = self.details_mut();
        match details {
            Value::Object(extra) => map.extend(extra),
            other => {
                map.insert("details".to_string(), other);
            }
        }
        self
    }

    /// Attach the underlying technical cause as `"message"`
    pub fn with_context(mut self, message: impl Into<String>) -> Self {
        self.details_mut()
            .insert("message".to_string(), Value::String(message.into()));
        self
    }

    /// Timeout error for a named operation
    pub fn timeout(operation: &str, limit_ms: u64) -> Self {
        Self::new(ErrorCode::OcrTimeout).with_details(json!({
            "operation": operation,
            "timeout_ms": limit_ms,
        }))
    }

    /// Aggregate the failures of both engines into one error.
    ///
    /// The user message is the generic processing failure; both causes are kept
    /// in the technical details.
    pub fn combined(fast: &OcrError, accurate: &OcrError) -> Self {
        Self::new(ErrorCode::OcrProcessingFailed).with_details(json!({
            "message": "both OCR engines failed",
            "fast_error": fast.to_json(),
            "accurate_error": accurate.to_json(),
        }))
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Opaque details for logging; never the primary surfaced string
    pub fn technical_details(&self) -> &Value {
        &self.technical_details
    }

    /// Structured form used for logs and aggregated errors
    pub fn to_json(&self) -> Value {
        json!({
            "code": self.code.as_str(),
            "user_message": self.user_message,
            "recoverable": self.recoverable,
            "technical_details": self.technical_details,
        })
    }

    fn details_mut(&mut self) -> &mut Map<String, Value> {
        if !self.technical_details.is_object() {
            let previous = std::mem::replace(&mut self.technical_details, Value::Null);
            let mut map = Map::new();
            if !previous.is_null() {
                map.insert("details".to_string(), previous);
            }
            self.technical_details = Value::Object(map);
        }
        match &mut self.technical_details {
            Value::Object(map) => map,
            _ => unreachable!("technical details normalised to an object above"),
        }
    }
}

impl From<ErrorCode> for OcrError {
    fn from(code: ErrorCode) -> Self {
        OcrError::new(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_code_has_message_and_suggestions() {
        for code in ErrorCode::ALL {
            let err = OcrError::new(code);
            assert!(!err.user_message().is_empty(), "{code} has no message");
            assert!(!err.suggestions().is_empty(), "{code} has no suggestions");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_recoverability_table() {
        assert!(ErrorCode::FileTooLarge.is_recoverable());
        assert!(ErrorCode::FileInvalidType.is_recoverable());
        assert!(!ErrorCode::FileCorrupted.is_recoverable());
        assert!(!ErrorCode::OcrNoTextFound.is_recoverable());
        assert!(ErrorCode::OcrLowQuality.is_recoverable());
        assert!(ErrorCode::OcrTimeout.is_recoverable());
        assert!(ErrorCode::NetworkError.is_recoverable());
        assert!(!ErrorCode::RuntimeNotSupported.is_recoverable());
        assert!(ErrorCode::OutOfMemory.is_recoverable());
    }

    #[test]
    fn test_code_strings_match_serde() {
        for code in ErrorCode::ALL {
            let serialized = serde_json::to_value(code).unwrap();
            assert_eq!(serialized, Value::String(code.as_str().to_string()));
        }
    }

    #[test]
    fn test_display_uses_user_message_not_details() {
        let err = OcrError::new(ErrorCode::FileCorrupted).with_context("png: invalid chunk crc");
        let shown = err.to_string();
        assert_eq!(shown, "FILE_CORRUPTED: The image could not be read. It may be damaged.");
        assert_eq!(err.technical_details()["message"], "png: invalid chunk crc");
    }

    #[test]
    fn test_with_details_merges_objects() {
        let err = OcrError::new(ErrorCode::OcrProcessingFailed)
            .with_details(json!({"engine": "tesseract"}))
            .with_details(json!({"exit_code": 1}))
            .with_details(json!("raw"));

        let details = err.technical_details();
        assert_eq!(details["engine"], "tesseract");
        assert_eq!(details["exit_code"], 1);
        assert_eq!(details["details"], "raw");
    }

    #[test]
    fn test_timeout_details() {
        let err = OcrError::timeout("tesseract", 60_000);
        assert_eq!(err.code(), ErrorCode::OcrTimeout);
        assert!(err.is_recoverable());
        assert_eq!(err.technical_details()["operation"], "tesseract");
        assert_eq!(err.technical_details()["timeout_ms"], 60_000);
    }

    #[test]
    fn test_combined_keeps_both_causes() {
        let fast = OcrError::timeout("tesseract", 60_000);
        let accurate = OcrError::new(ErrorCode::ModelLoadFailed).with_context("bad onnx");
        let err = OcrError::combined(&fast, &accurate);

        assert_eq!(err.code(), ErrorCode::OcrProcessingFailed);
        assert_eq!(err.user_message(), ErrorCode::OcrProcessingFailed.user_message());
        let details = err.technical_details();
        assert_eq!(details["fast_error"]["code"], "OCR_TIMEOUT");
        assert_eq!(details["accurate_error"]["code"], "MODEL_LOAD_FAILED");
        assert_eq!(details["accurate_error"]["technical_details"]["message"], "bad onnx");
    }
}
