//! Decoded pixel buffer

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};

use crate::error::{ErrorCode, OcrError};

/// A decoded RGBA image, `samples.len() == width * height * 4`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    samples: Vec<u8>,
}

impl PixelBuffer {
    /// Create a buffer, checking the sample length against the dimensions
    pub fn new(width: u32, height: u32, samples: Vec<u8>) -> Result<Self, OcrError> {
        if width == 0 || height == 0 {
            return Err(OcrError::new(ErrorCode::ImageLoadFailed)
                .with_context(format!("image has zero dimension ({}x{})", width, height)));
        }

        let expected = (width as u64) * (height as u64) * 4;
        if samples.len() as u64 != expected {
            return Err(OcrError::new(ErrorCode::ImageLoadFailed).with_context(format!(
                "sample length {} does not match {}x{} RGBA ({} bytes)",
                samples.len(),
                width,
                height,
                expected
            )));
        }

        Ok(Self {
            width,
            height,
            samples,
        })
    }

    /// A buffer filled with one RGBA colour
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, OcrError> {
        let pixels = (width as usize) * (height as usize);
        let samples = rgba.iter().copied().cycle().take(pixels * 4).collect();
        Self::new(width, height, samples)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Get dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    pub(crate) fn samples_mut(&mut self) -> &mut [u8] {
        &mut self.samples
    }

    pub fn into_samples(self) -> Vec<u8> {
        self.samples
    }

    /// RGBA value at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y as usize) * (self.width as usize) + x as usize) * 4;
        [
            self.samples[idx],
            self.samples[idx + 1],
            self.samples[idx + 2],
            self.samples[idx + 3],
        ]
    }

    /// Mean luma (0.299R + 0.587G + 0.114B) over the whole image
    pub fn mean_luma(&self) -> f32 {
        let total: f64 = self
            .samples
            .chunks_exact(4)
            .map(|px| luma(px[0], px[1], px[2]) as f64)
            .sum();
        (total / self.pixel_count() as f64) as f32
    }

    /// Encode as PNG for engines that consume files
    pub fn to_png(&self) -> Result<Vec<u8>, OcrError> {
        let image = self.to_rgba_image();
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).map_err(|e| {
            OcrError::new(ErrorCode::OcrProcessingFailed)
                .with_context(format!("failed to encode PNG: {}", e))
        })?;
        Ok(out.into_inner())
    }

    /// Copy into an `image` crate buffer
    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.samples.clone())
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    pub(crate) fn from_rgba_image(image: RgbaImage) -> Result<Self, OcrError> {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw())
    }
}

/// ITU-R BT.601 luma
#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}
