//! Image preprocessing filters for OCR optimization
//!
//! Stages run in a fixed order: upscale, denoise, grayscale, brightness,
//! contrast, sharpen, binarize. Each stage is optional. A stage that cannot run
//! is skipped with a warning and the previous buffer is kept; preprocessing
//! never aborts the extraction.

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::Progress;
use crate::config::LimitsConfig;
use crate::error::{ErrorCode, OcrError};
use crate::input::{luma, PixelBuffer};

/// Which transforms to apply. Absent / false means the stage is skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessOptions {
    pub grayscale: bool,
    /// Contrast factor fed to the 259/255 transfer function; 1.0 is treated as off
    pub contrast: Option<f32>,
    /// Additive per-channel offset
    pub brightness: Option<f32>,
    pub sharpen: bool,
    pub binarize: bool,
    pub denoise: bool,
    /// Scale factor, > 1 to take effect
    pub upscale: Option<f32>,
}

impl PreprocessOptions {
    /// Clean scans and printed documents
    pub fn document() -> Self {
        Self {
            grayscale: true,
            contrast: Some(1.2),
            sharpen: true,
            binarize: true,
            ..Default::default()
        }
    }

    /// Faded thermal receipts: lift brightness, push contrast, remove speckle
    pub fn receipt() -> Self {
        Self {
            grayscale: true,
            brightness: Some(10.0),
            contrast: Some(1.5),
            sharpen: true,
            binarize: true,
            denoise: true,
            ..Default::default()
        }
    }

    /// Screen captures: small UI text benefits from upscaling, no binarization
    pub fn screenshot() -> Self {
        Self {
            grayscale: true,
            upscale: Some(2.0),
            sharpen: true,
            ..Default::default()
        }
    }

    /// True if no stage is enabled
    pub fn is_noop(&self) -> bool {
        !self.grayscale
            && !self.sharpen
            && !self.binarize
            && !self.denoise
            && !contrast_enabled(self.contrast)
            && !brightness_enabled(self.brightness)
            && self.upscale.map_or(true, |s| !(s > 1.0))
    }
}

/// How a call wants its image conditioned
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preprocessing {
    /// Send the decoded image as-is
    None,
    /// Inspect the image and pick options
    #[default]
    Auto,
    /// Caller-supplied options (e.g. a per-tool preset)
    Custom(PreprocessOptions),
}

/// Result of preprocessing, including stages that were skipped
#[derive(Debug)]
pub struct PreprocessOutcome {
    pub buffer: PixelBuffer,
    /// One `PREPROCESSING_FAILED` error per stage that could not run; resource
    /// exhaustion is noted under `cause`
    pub degraded: Vec<OcrError>,
}

/// Apply `options` with default limits
pub fn preprocess(buffer: PixelBuffer, options: &PreprocessOptions) -> PixelBuffer {
    preprocess_with_report(buffer, options, &LimitsConfig::default(), &Progress::none()).buffer
}

/// Apply `options`, reporting skipped stages
pub fn preprocess_with_report(
    buffer: PixelBuffer,
    options: &PreprocessOptions,
    limits: &LimitsConfig,
    progress: &Progress,
) -> PreprocessOutcome {
    debug!(
        "OCR preprocessing: upscale={:?}, denoise={}, grayscale={}, brightness={:?}, contrast={:?}, sharpen={}, binarize={}",
        options.upscale,
        options.denoise,
        options.grayscale,
        options.brightness,
        options.contrast,
        options.sharpen,
        options.binarize
    );

    let mut degraded = Vec::new();
    let mut buffer = buffer;

    // Upscale first so every later filter works at final resolution
    if let Some(scale) = options.upscale {
        progress.report("upscaling", 0);
        match apply_upscale(&buffer, scale, limits.max_upscaled_pixels) {
            Ok(Some(scaled)) => buffer = scaled,
            Ok(None) => {}
            Err(e) => {
                warn!("Skipping upscale: {}", e.technical_details());
                degraded.push(e);
            }
        }
    }

    if options.denoise {
        progress.report("denoising", 15);
        apply_denoise(&mut buffer);
    }

    if options.grayscale {
        progress.report("grayscale", 40);
        apply_grayscale(buffer.samples_mut());
    }

    if let Some(offset) = options.brightness.filter(|b| brightness_enabled(Some(*b))) {
        progress.report("brightness", 50);
        apply_brightness(buffer.samples_mut(), offset);
    }

    if let Some(factor) = options.contrast.filter(|c| contrast_enabled(Some(*c))) {
        progress.report("contrast", 60);
        apply_contrast(buffer.samples_mut(), factor);
    }

    if options.sharpen {
        progress.report("sharpening", 70);
        apply_sharpen(&mut buffer);
    }

    // Destructive, always last
    if options.binarize {
        progress.report("binarizing", 90);
        apply_binarize(buffer.samples_mut());
    }

    progress.report("preprocessed", 100);

    PreprocessOutcome { buffer, degraded }
}

/// Options auto-mode would pick for this image
pub fn auto_options(buffer: &PixelBuffer) -> PreprocessOptions {
    let mean = buffer.mean_luma();

    let (brightness, contrast) = if mean < 100.0 {
        (30.0, 1.5)
    } else if mean > 180.0 {
        (-20.0, 1.3)
    } else {
        (0.0, 1.2)
    };

    let small = buffer.width() < 800 || buffer.height() < 600;

    debug!(
        "Auto preprocessing: mean luma {:.1}, {}x{}, upscale={}",
        mean,
        buffer.width(),
        buffer.height(),
        small
    );

    PreprocessOptions {
        grayscale: true,
        brightness: Some(brightness),
        contrast: Some(contrast),
        sharpen: true,
        binarize: true,
        denoise: false,
        upscale: small.then_some(2.0),
    }
}

/// Inspect the image, derive options and run the pipeline
pub fn auto_preprocess(buffer: PixelBuffer) -> PixelBuffer {
    let options = auto_options(&buffer);
    preprocess(buffer, &options)
}

fn contrast_enabled(contrast: Option<f32>) -> bool {
    contrast.is_some_and(|c| c.is_finite() && (c - 1.0).abs() > f32::EPSILON)
}

fn brightness_enabled(brightness: Option<f32>) -> bool {
    brightness.is_some_and(|b| b.is_finite() && b != 0.0)
}

#[inline]
fn to_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Upscale RGBA image using bilinear interpolation.
/// `Ok(None)` means nothing to do (scale <= 1).
fn apply_upscale(buffer: &PixelBuffer, scale: f32, max_pixels: u64) -> Result<Option<PixelBuffer>, OcrError> {
    if !scale.is_finite() {
        return Err(OcrError::new(ErrorCode::PreprocessingFailed)
            .with_details(json!({ "stage": "upscale", "reason": "non-finite scale" })));
    }
    if scale <= 1.0 {
        return Ok(None);
    }

    let (width, height) = buffer.dimensions();
    let new_width = ((width as f64) * scale as f64).round().max(1.0) as u64;
    let new_height = ((height as f64) * scale as f64).round().max(1.0) as u64;

    let too_large = new_width > u32::MAX as u64
        || new_height > u32::MAX as u64
        || new_width.checked_mul(new_height).map_or(true, |pixels| pixels > max_pixels);
    if too_large {
        return Err(OcrError::new(ErrorCode::PreprocessingFailed).with_details(json!({
            "stage": "upscale",
            "reason": "result exceeds pixel limit",
            "target": [new_width, new_height],
            "max_pixels": max_pixels,
        })));
    }

    let len = (new_width * new_height * 4) as usize;
    let mut result = Vec::new();
    if result.try_reserve_exact(len).is_err() {
        return Err(OcrError::new(ErrorCode::PreprocessingFailed).with_details(json!({
            "stage": "upscale",
            "reason": "allocation failed",
            "cause": ErrorCode::OutOfMemory.as_str(),
            "bytes": len,
        })));
    }
    result.resize(len, 0u8);

    let data = buffer.samples();
    let w = width as usize;
    let h = height as usize;
    let nw = new_width as usize;
    let nh = new_height as usize;
    let scale_x = new_width as f32 / width as f32;
    let scale_y = new_height as f32 / height as f32;

    for ny in 0..nh {
        // Map back to source coordinates
        let src_y = ny as f32 / scale_y;
        let y0 = (src_y.floor() as usize).min(h - 1);
        let y1 = (y0 + 1).min(h - 1);
        let y_weight = src_y - src_y.floor();

        for nx in 0..nw {
            let src_x = nx as f32 / scale_x;
            let x0 = (src_x.floor() as usize).min(w - 1);
            let x1 = (x0 + 1).min(w - 1);
            let x_weight = src_x - src_x.floor();

            let dst_idx = (ny * nw + nx) * 4;

            for c in 0..4 {
                let p00 = data[(y0 * w + x0) * 4 + c] as f32;
                let p10 = data[(y0 * w + x1) * 4 + c] as f32;
                let p01 = data[(y1 * w + x0) * 4 + c] as f32;
                let p11 = data[(y1 * w + x1) * 4 + c] as f32;

                let top = p00 * (1.0 - x_weight) + p10 * x_weight;
                let bottom = p01 * (1.0 - x_weight) + p11 * x_weight;

                result[dst_idx + c] = to_channel(top * (1.0 - y_weight) + bottom * y_weight);
            }
        }
    }

    PixelBuffer::new(new_width as u32, new_height as u32, result).map(Some)
}

/// 3x3 median per RGB channel; alpha forced opaque
fn apply_denoise(buffer: &mut PixelBuffer) {
    let (width, height) = buffer.dimensions();
    let mut rgb = RgbImage::new(width, height);
    for (px, chunk) in rgb.pixels_mut().zip(buffer.samples().chunks_exact(4)) {
        *px = Rgb([chunk[0], chunk[1], chunk[2]]);
    }

    let filtered = imageproc::filter::median_filter(&rgb, 1, 1);

    for (chunk, px) in buffer.samples_mut().chunks_exact_mut(4).zip(filtered.pixels()) {
        chunk[0] = px[0];
        chunk[1] = px[1];
        chunk[2] = px[2];
        chunk[3] = 255;
    }
}

/// Convert RGBA to grayscale (keeping RGBA format)
fn apply_grayscale(data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(4) {
        let gray = to_channel(luma(chunk[0], chunk[1], chunk[2]));
        chunk[0] = gray;
        chunk[1] = gray;
        chunk[2] = gray;
    }
}

fn apply_brightness(data: &mut [u8], offset: f32) {
    for chunk in data.chunks_exact_mut(4) {
        for value in chunk.iter_mut().take(3) {
            *value = to_channel(*value as f32 + offset);
        }
    }
}

/// Contrast around the midpoint using the 259/255 transfer function
fn apply_contrast(data: &mut [u8], contrast: f32) {
    // Keep the denominator away from zero
    let contrast = contrast.clamp(-255.0, 258.0);
    let factor = (259.0 * (contrast + 255.0)) / (255.0 * (259.0 - contrast));

    for chunk in data.chunks_exact_mut(4) {
        for value in chunk.iter_mut().take(3) {
            *value = to_channel(factor * (*value as f32 - 128.0) + 128.0);
        }
    }
}

/// 3x3 sharpen kernel [0,-1,0; -1,5,-1; 0,-1,0] on interior pixels.
/// The 1px border is left as-is.
fn apply_sharpen(buffer: &mut PixelBuffer) {
    let (width, height) = buffer.dimensions();
    let w = width as usize;
    let h = height as usize;
    if w < 3 || h < 3 {
        return;
    }

    let data = buffer.samples().to_vec();
    let result = buffer.samples_mut();

    for y in 1..(h - 1) {
        for x in 1..(w - 1) {
            let idx = (y * w + x) * 4;

            for c in 0..3 {
                let top = data[((y - 1) * w + x) * 4 + c] as f32;
                let bottom = data[((y + 1) * w + x) * 4 + c] as f32;
                let left = data[(y * w + x - 1) * 4 + c] as f32;
                let right = data[(y * w + x + 1) * 4 + c] as f32;
                let center = data[idx + c] as f32;

                result[idx + c] = to_channel(5.0 * center - top - bottom - left - right);
            }
        }
    }
}

/// Threshold chosen by Otsu's method over the luma histogram
pub fn otsu_threshold(data: &[u8]) -> u8 {
    let mut histogram = [0u64; 256];
    for chunk in data.chunks_exact(4) {
        histogram[to_channel(luma(chunk[0], chunk[1], chunk[2])) as usize] += 1;
    }

    let total: u64 = histogram.iter().sum();
    let sum_all: f64 = histogram
        .iter()
        .enumerate()
        .map(|(value, &count)| value as f64 * count as f64)
        .sum();

    let mut sum_background = 0.0f64;
    let mut weight_background = 0u64;
    let mut best_variance = 0.0f64;
    let mut threshold = 0u8;

    for t in 0..256usize {
        weight_background += histogram[t];
        if weight_background == 0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0 {
            break;
        }

        sum_background += t as f64 * histogram[t] as f64;
        let mean_background = sum_background / weight_background as f64;
        let mean_foreground = (sum_all - sum_background) / weight_foreground as f64;

        let between = weight_background as f64
            * weight_foreground as f64
            * (mean_background - mean_foreground).powi(2);

        if between > best_variance {
            best_variance = between;
            threshold = t as u8;
        }
    }

    threshold
}

/// Every pixel becomes pure black or white; alpha unchanged
fn apply_binarize(data: &mut [u8]) {
    let threshold = otsu_threshold(data);
    debug!("Otsu threshold: {}", threshold);

    for chunk in data.chunks_exact_mut(4) {
        let value = if to_channel(luma(chunk[0], chunk[1], chunk[2])) > threshold {
            255
        } else {
            0
        };
        chunk[0] = value;
        chunk[1] = value;
        chunk[2] = value;
    }
}
