use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::{GenerateRequest, GeneratedImage, ImageProvider};

const DRYRUN_SIZE: u32 = 512;

/// Offline provider: a deterministic textured image derived from the prompt,
/// model and seed.
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let digest = prompt_digest(&request.prompt, &request.model, request.seed);
        Ok(GeneratedImage {
            image: DynamicImage::ImageRgb8(render(&digest, DRYRUN_SIZE)),
            seed: request.seed,
        })
    }
}

fn prompt_digest(prompt: &str, model: &str, seed: Option<i64>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in [prompt, model] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update(seed.unwrap_or_default().to_be_bytes());
    hasher.finalize().into()
}

fn render(digest: &[u8; 32], size: u32) -> RgbImage {
    // Mid-range base so block offsets and grain never clip.
    let base = [64 + digest[0] % 128, 64 + digest[1] % 128, 64 + digest[2] % 128];
    let mut state = u64::from_be_bytes([
        digest[8], digest[9], digest[10], digest[11], digest[12], digest[13], digest[14],
        digest[15],
    ]) | 1;
    let block = 32u32.max(size / 8);
    let blocks_per_row = size.div_ceil(block);
    let mut offsets = Vec::with_capacity((blocks_per_row * blocks_per_row) as usize);
    for _ in 0..blocks_per_row * blocks_per_row {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        offsets.push((state % 96) as i16 - 48);
    }
    RgbImage::from_fn(size, size, |x, y| {
        let offset = offsets[((y / block) * blocks_per_row + x / block) as usize];
        let grain = ((x ^ y) % 7) as i16;
        let channel = |value: u8| (value as i16 + offset + grain).clamp(0, 255) as u8;
        Rgb([channel(base[0]), channel(base[1]), channel(base[2])])
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::GenericImageView;

    use super::*;

    fn request(prompt: &str, seed: Option<i64>) -> GenerateRequest {
        GenerateRequest {
            prompt: prompt.to_string(),
            model: "dryrun-model".to_string(),
            seed,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn output_is_deterministic_per_prompt_and_seed() -> Result<()> {
        let first = DryrunProvider.generate(&request("lighthouse at dusk", Some(7)))?;
        let again = DryrunProvider.generate(&request("lighthouse at dusk", Some(7)))?;
        let other = DryrunProvider.generate(&request("lighthouse at dusk", Some(8)))?;
        assert_eq!(first.image.dimensions(), (DRYRUN_SIZE, DRYRUN_SIZE));
        assert_eq!(first.image.as_bytes(), again.image.as_bytes());
        assert_ne!(first.image.as_bytes(), other.image.as_bytes());
        assert_eq!(first.seed, Some(7));
        Ok(())
    }

    #[test]
    fn texture_clears_default_floors() -> Result<()> {
        let generated = DryrunProvider.generate(&request("a quiet harbor", None))?;
        let brightness = crate::metrics::brightness(&generated.image);
        let entropy = crate::metrics::entropy(&generated.image);
        assert!((10.0..=245.0).contains(&brightness), "{brightness}");
        assert!(entropy >= 3.5, "{entropy}");
        Ok(())
    }

    #[test]
    fn prompt_and_model_boundary_changes_the_image() -> Result<()> {
        assert_ne!(prompt_digest("ab", "c", None), prompt_digest("a", "bc", None));
        let split = |prompt: &str, model: &str| GenerateRequest {
            model: model.to_string(),
            ..request(prompt, Some(3))
        };
        let left = DryrunProvider.generate(&split("harbor lights", "v2"))?;
        let right = DryrunProvider.generate(&split("harbor light", "sv2"))?;
        assert_ne!(left.image.as_bytes(), right.image.as_bytes());
        Ok(())
    }
}
