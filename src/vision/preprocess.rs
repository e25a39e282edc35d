//! Image preprocessing ahead of the model oracles
//!
//! Detection runs on a gamma-corrected, brightness-normalized and sharpened
//! copy of the frame. Needle segmentation additionally gets a crop whose
//! illumination has been flattened, since shadows across the dial face are
//! the most common cause of broken needle masks.

use image::{GrayImage, Luma, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use serde::{Deserialize, Serialize};

/// Preprocessing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Run frame preprocessing before detection
    pub enabled: bool,
    /// Gamma applied through a lookup table (> 1 brightens midtones)
    pub gamma: f32,
    /// Mean luma below this is scaled up to it
    pub min_brightness: f32,
    /// Mean luma above this is scaled down to it
    pub max_brightness: f32,
    /// Gaussian sigma for the unsharp mask
    pub sharpen_sigma: f32,
    /// Flatten illumination on crops before needle segmentation
    pub remove_shadows: bool,
    /// Gaussian sigma of the illumination estimate
    pub shadow_sigma: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gamma: 1.2,
            min_brightness: 70.0,
            max_brightness: 180.0,
            sharpen_sigma: 3.0,
            remove_shadows: true,
            shadow_sigma: 15.0,
        }
    }
}

/// Full preprocessing for the detection pass
pub fn preprocess_frame(image: &RgbImage, config: &PreprocessConfig) -> RgbImage {
    if !config.enabled {
        return image.clone();
    }

    let mut out = adjust_gamma(image, config.gamma);

    let brightness = mean_luma(&out);
    if brightness > 0.0 && brightness < config.min_brightness {
        out = scale_intensity(&out, config.min_brightness / brightness);
    } else if brightness > config.max_brightness {
        out = scale_intensity(&out, config.max_brightness / brightness);
    }

    sharpen(&out, config.sharpen_sigma)
}

/// Apply `out = 255 * (in / 255)^(1 / gamma)` through a lookup table
pub fn adjust_gamma(image: &RgbImage, gamma: f32) -> RgbImage {
    if gamma <= 0.0 {
        return image.clone();
    }
    let inv_gamma = 1.0 / gamma;
    let table: Vec<u8> = (0..=255u8)
        .map(|i| ((i as f32 / 255.0).powf(inv_gamma) * 255.0).round() as u8)
        .collect();

    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = table[*c as usize];
        }
    }
    out
}

/// Mean Rec. 601 luma over the whole image
pub fn mean_luma(image: &RgbImage) -> f32 {
    let count = (image.width() as u64 * image.height() as u64).max(1);
    let sum: f64 = image.pixels().map(|p| luma(p.0) as f64).sum();
    (sum / count as f64) as f32
}

fn luma([r, g, b]: [u8; 3]) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

fn scale_intensity(image: &RgbImage, ratio: f32) -> RgbImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = (*c as f32 * ratio).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Unsharp mask: `1.5 * image - 0.5 * blur(image)`
pub fn sharpen(image: &RgbImage, sigma: f32) -> RgbImage {
    if sigma <= 0.0 || image.width() == 0 || image.height() == 0 {
        return image.clone();
    }
    let blurred = gaussian_blur_f32(image, sigma);

    let mut out = image.clone();
    for (dst, src) in out.pixels_mut().zip(blurred.pixels()) {
        for (c, b) in dst.0.iter_mut().zip(src.0) {
            *c = (1.5 * *c as f32 - 0.5 * b as f32).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Divide out a blurred illumination estimate so shadows become background
pub fn flatten_illumination(image: &RgbImage, sigma: f32) -> RgbImage {
    if sigma <= 0.0 || image.width() == 0 || image.height() == 0 {
        return image.clone();
    }

    let lightness = GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([luma(image.get_pixel(x, y).0).round() as u8])
    });
    let illumination = gaussian_blur_f32(&lightness, sigma);

    let mut out = image.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let l = lightness.get_pixel(x, y)[0] as f32;
        let background = illumination.get_pixel(x, y)[0].max(1) as f32;
        if l <= 0.0 {
            continue;
        }
        // Scale the pixel so its lightness becomes l * 255 / background
        let target = (l * 255.0 / background).min(255.0);
        let ratio = target / l;
        for c in pixel.0.iter_mut() {
            *c = (*c as f32 * ratio).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
