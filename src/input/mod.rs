//! Input Layer
//!
//! Validates the caller's byte buffer and decodes it into a [`PixelBuffer`].
//! Validation runs before anything is decoded or allocated.

pub mod frame;

pub use frame::{luma, PixelBuffer};

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use image::{ImageError, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::LimitsConfig;
use crate::error::{ErrorCode, OcrError};

/// Accepted image types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMime {
    Png,
    Jpeg,
    Webp,
}

impl ImageMime {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageMime::Png => "image/png",
            ImageMime::Jpeg => "image/jpeg",
            ImageMime::Webp => "image/webp",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            ImageMime::Png => ImageFormat::Png,
            ImageMime::Jpeg => ImageFormat::Jpeg,
            ImageMime::Webp => ImageFormat::WebP,
        }
    }
}

impl fmt::Display for ImageMime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageMime {
    type Err = OcrError;

    /// Parse a MIME type, ignoring case and parameters (`image/png; q=1`)
    fn from_str(mime: &str) -> Result<Self, Self::Err> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "image/png" => Ok(ImageMime::Png),
            "image/jpeg" | "image/jpg" => Ok(ImageMime::Jpeg),
            "image/webp" => Ok(ImageMime::Webp),
            _ => Err(OcrError::new(ErrorCode::FileInvalidType).with_details(json!({
                "mime_type": mime,
                "accepted": ["image/png", "image/jpeg", "image/webp"],
            }))),
        }
    }
}

/// An image as supplied by the caller
#[derive(Debug, Clone)]
pub struct InputFile {
    pub bytes: Vec<u8>,
    /// Declared MIME type, validated before decoding
    pub mime_type: String,
}

impl InputFile {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Check size, then type, then emptiness. Pure; touches no pixel data.
pub fn validate_file(size_bytes: u64, mime_type: &str, limits: &LimitsConfig) -> Result<ImageMime, OcrError> {
    if size_bytes > limits.max_file_bytes {
        return Err(OcrError::new(ErrorCode::FileTooLarge).with_details(json!({
            "size_bytes": size_bytes,
            "max_bytes": limits.max_file_bytes,
        })));
    }

    let mime: ImageMime = mime_type.parse()?;
    if size_bytes == 0 {
        return Err(OcrError::new(ErrorCode::FileCorrupted).with_context("file is empty"));
    }

    Ok(mime)
}

/// Decode an already validated file into an RGBA buffer
pub fn decode(bytes: &[u8], mime: ImageMime) -> Result<PixelBuffer, OcrError> {
    let reader = ImageReader::with_format(Cursor::new(bytes), mime.image_format());

    let image = reader.decode().map_err(|e| classify_decode_error(e, mime))?;
    debug!("Decoded {} image: {}x{}", mime, image.width(), image.height());

    PixelBuffer::from_rgba_image(image.to_rgba8())
}

fn classify_decode_error(error: ImageError, mime: ImageMime) -> OcrError {
    let code = match &error {
        ImageError::Limits(_) => ErrorCode::OutOfMemory,
        ImageError::IoError(e) if e.kind() == std::io::ErrorKind::OutOfMemory => ErrorCode::OutOfMemory,
        _ => ErrorCode::FileCorrupted,
    };

    OcrError::new(code)
        .with_context(error.to_string())
        .with_details(json!({ "mime_type": mime.as_str() }))
}
