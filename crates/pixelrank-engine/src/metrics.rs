//! Brightness and entropy of a raster, both computed on its 8-bit luma plane.

use image::{DynamicImage, GrayImage};

/// Mean luma on a 0-255 scale. An empty raster reads as 0.
pub fn brightness(image: &DynamicImage) -> f64 {
    brightness_of_luma(&image.to_luma8())
}

/// Shannon entropy (bits) of the 256-bin luma histogram, 0 to 8.
pub fn entropy(image: &DynamicImage) -> f64 {
    entropy_of_luma(&image.to_luma8())
}

fn brightness_of_luma(luma: &GrayImage) -> f64 {
    let count = luma.as_raw().len();
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = luma.as_raw().iter().map(|value| *value as u64).sum();
    sum as f64 / count as f64
}

fn entropy_of_luma(luma: &GrayImage) -> f64 {
    let count = luma.as_raw().len();
    if count == 0 {
        return 0.0;
    }
    let mut histogram = [0u64; 256];
    for value in luma.as_raw() {
        histogram[*value as usize] += 1;
    }
    let total = count as f64;
    histogram
        .iter()
        .filter(|bin| **bin > 0)
        .map(|bin| {
            let p = *bin as f64 / total;
            -p * p.log2()
        })
        .sum()
}
