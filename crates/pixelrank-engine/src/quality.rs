//! Local quality gate: size and aspect, sharpness and exposure checks that
//! need no model. Runs after the brightness/entropy floors when enabled.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use pixelrank_contracts::config::LocalQualityConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum QualityVerdict {
    Pass { score: f64 },
    Reject { reason: String },
}

impl QualityVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, QualityVerdict::Pass { .. })
    }
}

pub fn evaluate(image: &DynamicImage, config: &LocalQualityConfig) -> QualityVerdict {
    let (width, height) = image.dimensions();
    if !size_and_aspect_ok(width, height, config) {
        return QualityVerdict::Reject {
            reason: format!(
                "{width}x{height} fails min side {} or aspect [{}, {}]",
                config.min_side, config.ar_min, config.ar_max
            ),
        };
    }

    let luma = resize_for_quality(image, config.resize_long).to_luma8();

    let vol = laplacian_variance(&luma);
    if vol < config.sharpness_min {
        return QualityVerdict::Reject {
            reason: format!(
                "sharpness {vol:.1} below floor {:.1}",
                config.sharpness_min
            ),
        };
    }
    let sharpness = if config.sharpness_good > 0.0 {
        (vol / config.sharpness_good).min(1.0)
    } else {
        0.0
    };

    let clip = clipped_fraction(&luma);
    if clip > config.clip_max {
        return QualityVerdict::Reject {
            reason: format!("clipped fraction {clip:.3} above {:.3}", config.clip_max),
        };
    }
    let exposure = if config.clip_max > 0.0 {
        (1.0 - clip / config.clip_max).max(0.0)
    } else {
        0.0
    };

    QualityVerdict::Pass {
        score: 0.5 * sharpness + 0.5 * exposure,
    }
}

fn size_and_aspect_ok(width: u32, height: u32, config: &LocalQualityConfig) -> bool {
    if width == 0 || height == 0 || width.min(height) < config.min_side {
        return false;
    }
    let aspect = width as f64 / height as f64;
    aspect >= config.ar_min && aspect <= config.ar_max
}

fn resize_for_quality(image: &DynamicImage, long_side: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if long_side == 0 || width.max(height) <= long_side {
        return image.clone();
    }
    let (new_w, new_h) = if width > height {
        (long_side, (height as u64 * long_side as u64 / width as u64).max(1) as u32)
    } else {
        ((width as u64 * long_side as u64 / height as u64).max(1) as u32, long_side)
    };
    image.resize_exact(new_w, new_h, FilterType::Lanczos3)
}

/// Variance of the 4-neighbour Laplacian over the whole frame, with borders
/// mirrored about the edge pixel (`dcb|abcd|cba`).
fn laplacian_variance(luma: &GrayImage) -> f64 {
    let (width, height) = luma.dimensions();
    if width < 2 || height < 2 {
        return 0.0;
    }
    let (w, h) = (i64::from(width), i64::from(height));
    let at = |x: i64, y: i64| luma.get_pixel(reflect_101(x, w), reflect_101(y, h))[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 0..h {
        for x in 0..w {
            let value = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += value;
            sum_sq += value * value;
        }
    }
    let count = (w * h) as f64;
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}

fn reflect_101(index: i64, len: i64) -> u32 {
    let index = if index < 0 {
        -index
    } else if index >= len {
        2 * (len - 1) - index
    } else {
        index
    };
    index as u32
}

/// Share of pixels crushed to black (<= 3) or blown to white (>= 252).
fn clipped_fraction(luma: &GrayImage) -> f64 {
    let total = luma.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let clipped = luma
        .as_raw()
        .iter()
        .filter(|value| **value <= 3 || **value >= 252)
        .count();
    clipped as f64 / total as f64
}
