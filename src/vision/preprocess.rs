//! Tensor preparation for the recognition model
//!
//! Splits a page into text lines, then resizes and normalizes each line into
//! the NCHW layout the CRNN recognizer expects.

use ndarray::{Array3, Array4};

use super::ocr_preprocess::otsu_threshold;
use crate::input::{luma, PixelBuffer};

/// Recognition input configuration
#[derive(Debug, Clone)]
pub struct RecognitionInput {
    /// Model input height (48 for PaddleOCR v3/v4 recognizers)
    pub target_height: u32,
    /// Maximum width after resizing
    pub max_width: u32,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl Default for RecognitionInput {
    fn default() -> Self {
        Self {
            target_height: 48,
            max_width: 2048,
            // (pixel / 255.0 - 0.5) / 0.5 maps [0, 255] -> [-1, 1]
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

/// A horizontal band of the page containing one line of text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Convert an RGBA region to an RGB f32 array in 0-1
pub fn rgba_to_rgb_f32(buffer: &PixelBuffer, region: LineRegion) -> Array3<f32> {
    let mut rgb = Array3::<f32>::zeros((region.height as usize, region.width as usize, 3));

    for y in 0..region.height {
        for x in 0..region.width {
            let px = buffer.pixel(region.x + x, region.y + y);
            for c in 0..3 {
                rgb[[y as usize, x as usize, c]] = px[c] as f32 / 255.0;
            }
        }
    }

    rgb
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let (h, w, _) = image.dim();
    let mut normalized = Array3::<f32>::zeros((h, w, 3));

    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                normalized[[y, x, c]] = (image[[y, x, c]] - mean[c]) / std[c];
            }
        }
    }

    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    let mut tensor = Array4::<f32>::zeros((1, c, h, w));

    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                tensor[[0, ch, y, x]] = image[[y, x, ch]];
            }
        }
    }

    tensor
}

/// Resize image for recognition model (fixed height, variable width)
pub fn resize_for_recognition(image: &Array3<f32>, target_height: u32, max_width: u32) -> Array3<f32> {
    let (h, w, c) = image.dim();

    let scale = target_height as f32 / h as f32;
    let new_w = (((w as f32) * scale).round() as u32).clamp(1, max_width.max(1)) as usize;
    let new_h = target_height as usize;
    let scale_x = new_w as f32 / w as f32;

    let mut resized = Array3::<f32>::zeros((new_h, new_w, c));

    for y in 0..new_h {
        for x in 0..new_w {
            let src_y = (y as f32 / scale).min(h as f32 - 1.0);
            let src_x = (x as f32 / scale_x).min(w as f32 - 1.0);

            // Bilinear interpolation
            let y0 = src_y.floor() as usize;
            let y1 = (y0 + 1).min(h - 1);
            let x0 = src_x.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);

            let fy = src_y - y0 as f32;
            let fx = src_x - x0 as f32;

            for ch in 0..c {
                let v00 = image[[y0, x0, ch]];
                let v01 = image[[y0, x1, ch]];
                let v10 = image[[y1, x0, ch]];
                let v11 = image[[y1, x1, ch]];

                let v0 = v00 * (1.0 - fx) + v01 * fx;
                let v1 = v10 * (1.0 - fx) + v11 * fx;
                resized[[y, x, ch]] = v0 * (1.0 - fy) + v1 * fy;
            }
        }
    }

    resized
}

/// Full preprocessing pipeline for one line
pub fn preprocess_for_recognition(buffer: &PixelBuffer, region: LineRegion, config: &RecognitionInput) -> Array4<f32> {
    let rgb = rgba_to_rgb_f32(buffer, region);
    let resized = resize_for_recognition(&rgb, config.target_height, config.max_width);
    let normalized = normalize(&resized, &config.mean, &config.std);
    hwc_to_nchw(&normalized)
}

/// Find text lines with a horizontal projection profile.
///
/// Ink is whatever falls on the minority side of the Otsu threshold, so both
/// dark-on-light and light-on-dark pages work. Returns the whole page when no
/// line can be isolated.
pub fn segment_lines(buffer: &PixelBuffer) -> Vec<LineRegion> {
    let (width, height) = buffer.dimensions();
    let whole = LineRegion {
        x: 0,
        y: 0,
        width,
        height,
    };

    let threshold = otsu_threshold(buffer.samples());
    let lumas: Vec<u8> = buffer
        .samples()
        .chunks_exact(4)
        .map(|px| luma(px[0], px[1], px[2]).round().clamp(0.0, 255.0) as u8)
        .collect();

    let dark = lumas.iter().filter(|&&v| v <= threshold).count();
    let ink_is_dark = dark * 2 <= lumas.len();
    let is_ink = |v: u8| if ink_is_dark { v <= threshold } else { v > threshold };

    let w = width as usize;
    let min_ink = (w / 200).max(1);
    let row_has_ink: Vec<bool> = lumas
        .chunks_exact(w)
        .map(|row| row.iter().filter(|&&v| is_ink(v)).count() >= min_ink)
        .collect();

    // Collect runs of inked rows, bridging 1-2 row gaps
    let mut bands: Vec<(u32, u32)> = Vec::new();
    let mut y = 0usize;
    while y < row_has_ink.len() {
        if !row_has_ink[y] {
            y += 1;
            continue;
        }
        let start = y;
        while y < row_has_ink.len() && row_has_ink[y] {
            y += 1;
        }
        match bands.last_mut() {
            Some(last) if start as u32 <= last.1 + 2 => last.1 = y as u32,
            _ => bands.push((start as u32, y as u32)),
        }
    }

    let lines: Vec<LineRegion> = bands
        .into_iter()
        .filter(|(top, bottom)| bottom - top >= 4)
        .filter_map(|(top, bottom)| {
            let pad = 2;
            let y0 = top.saturating_sub(pad);
            let y1 = (bottom + pad).min(height);

            // Horizontal ink extent of this band
            let mut x_min = u32::MAX;
            let mut x_max = 0;
            for row in y0..y1 {
                let row_lumas = &lumas[row as usize * w..(row as usize + 1) * w];
                for (x, &v) in row_lumas.iter().enumerate() {
                    if is_ink(v) {
                        x_min = x_min.min(x as u32);
                        x_max = x_max.max(x as u32);
                    }
                }
            }
            if x_min > x_max {
                return None;
            }
            let x0 = x_min.saturating_sub(pad);
            let x1 = (x_max + 1 + pad).min(width);

            Some(LineRegion {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
            })
        })
        .collect();

    if lines.is_empty() {
        vec![whole]
    } else {
        lines
    }
}
