//! DCT perceptual hash and the near-duplicate test against recent history.

use std::f64::consts::PI;

use image::imageops::{self, FilterType};
use image::DynamicImage;
use pixelrank_contracts::history::Fingerprint;

const SAMPLE_SIZE: usize = 32;
const HASH_SIZE: usize = 8;

/// Luma plane downsampled to 32x32, 2-D DCT-II, top-left 8x8 block thresholded at
/// its median. Bits are emitted row-major, first bit most significant.
pub fn phash(image: &DynamicImage) -> Fingerprint {
    let sample = imageops::resize(
        &image.to_luma8(),
        SAMPLE_SIZE as u32,
        SAMPLE_SIZE as u32,
        FilterType::Lanczos3,
    );
    let mut grid = [[0.0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (x, y, pixel) in sample.enumerate_pixels() {
        grid[y as usize][x as usize] = pixel[0] as f64;
    }

    let coefficients = dct_2d(&grid);
    let mut low = Vec::with_capacity(HASH_SIZE * HASH_SIZE);
    for row in coefficients.iter().take(HASH_SIZE) {
        low.extend_from_slice(&row[..HASH_SIZE]);
    }
    let threshold = median(&low);

    let bits = low
        .iter()
        .fold(0u64, |acc, value| (acc << 1) | u64::from(*value > threshold));
    Fingerprint::from_bits(bits)
}

/// Hex form of [`phash`], as stored in history manifests.
pub fn phash_hex(image: &DynamicImage) -> String {
    phash(image).to_hex()
}

/// True when any recent fingerprint lies strictly closer than `distance_min`.
pub fn is_duplicate(fingerprint: &Fingerprint, recent: &[Fingerprint], distance_min: u32) -> bool {
    recent
        .iter()
        .any(|previous| fingerprint.distance(previous) < distance_min)
}

fn dct_2d(grid: &[[f64; SAMPLE_SIZE]; SAMPLE_SIZE]) -> [[f64; SAMPLE_SIZE]; SAMPLE_SIZE] {
    let table = cosine_table();
    let mut rows = [[0.0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (y, row) in grid.iter().enumerate() {
        rows[y] = dct_1d(row, &table);
    }
    let mut out = [[0.0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for x in 0..SAMPLE_SIZE {
        let mut column = [0.0f64; SAMPLE_SIZE];
        for (y, row) in rows.iter().enumerate() {
            column[y] = row[x];
        }
        let transformed = dct_1d(&column, &table);
        for (y, value) in transformed.iter().enumerate() {
            out[y][x] = *value;
        }
    }
    out
}

fn dct_1d(input: &[f64; SAMPLE_SIZE], table: &[[f64; SAMPLE_SIZE]; SAMPLE_SIZE]) -> [f64; SAMPLE_SIZE] {
    let mut out = [0.0f64; SAMPLE_SIZE];
    for (k, slot) in out.iter_mut().enumerate() {
        *slot = 2.0
            * input
                .iter()
                .zip(table[k].iter())
                .map(|(value, cos)| value * cos)
                .sum::<f64>();
    }
    out
}

fn cosine_table() -> [[f64; SAMPLE_SIZE]; SAMPLE_SIZE] {
    let n = SAMPLE_SIZE as f64;
    let mut table = [[0.0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (k, row) in table.iter_mut().enumerate() {
        for (i, slot) in row.iter_mut().enumerate() {
            *slot = (PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos();
        }
    }
    table
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.is_empty() {
        0.0
    } else if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
