//! Run configuration snapshot.
//!
//! Loaded once before a run and handed to each component by reference. Every
//! field carries a serde default so a partial file (or none at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SelectionConfig {
    pub image_generation: ImageGenerationConfig,
    pub ranking: RankingConfig,
    pub aesthetic_scoring: AestheticScoringConfig,
    pub local_quality: LocalQualityConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRoute {
    pub provider: String,
    pub model: String,
}

impl ProviderRoute {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageGenerationConfig {
    /// Tried strictly in order; the first route that yields an image wins.
    pub routes: Vec<ProviderRoute>,
    pub retries_per_image: u32,
    pub retry_backoff_s: f64,
    pub retry_backoff_max_s: f64,
    pub request_timeout_s: f64,
    pub max_parallel: usize,
    pub repetitions: usize,
    pub base_seed: Option<i64>,
}

impl Default for ImageGenerationConfig {
    fn default() -> Self {
        Self {
            routes: vec![
                ProviderRoute::new("fal", "fal-ai/flux/dev"),
                ProviderRoute::new("replicate", "black-forest-labs/flux-schnell"),
            ],
            retries_per_image: 2,
            retry_backoff_s: 4.0,
            retry_backoff_max_s: 10.0,
            request_timeout_s: 120.0,
            max_parallel: 4,
            repetitions: 1,
            base_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub w_brightness: f64,
    pub w_entropy: f64,
    pub w_aesthetic: f64,
    pub entropy_min: f64,
    pub brightness_min: f64,
    pub brightness_max: f64,
    pub phash_distance_min: u32,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            w_brightness: 0.25,
            w_entropy: 0.25,
            w_aesthetic: 0.50,
            entropy_min: 3.5,
            brightness_min: 10.0,
            brightness_max: 245.0,
            phash_distance_min: 6,
        }
    }
}

impl RankingConfig {
    pub fn weights(&self) -> RankingWeights {
        RankingWeights {
            brightness: self.w_brightness,
            entropy: self.w_entropy,
            aesthetic: self.w_aesthetic,
        }
    }
}

/// One weight triple applied identically to every candidate of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    pub brightness: f64,
    pub entropy: f64,
    pub aesthetic: f64,
}

impl RankingWeights {
    pub fn sum(&self) -> f64 {
        self.brightness + self.entropy + self.aesthetic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    #[default]
    Heuristic,
    Replicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AestheticScoringConfig {
    pub scorer: ScorerKind,
    pub model: Option<String>,
    pub timeout_s: f64,
    pub default_score: f64,
}

impl Default for AestheticScoringConfig {
    fn default() -> Self {
        Self {
            scorer: ScorerKind::Heuristic,
            model: None,
            timeout_s: 60.0,
            default_score: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalQualityConfig {
    pub enabled: bool,
    pub resize_long: u32,
    pub min_side: u32,
    pub ar_min: f64,
    pub ar_max: f64,
    pub sharpness_min: f64,
    pub sharpness_good: f64,
    pub clip_max: f64,
}

impl Default for LocalQualityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            resize_long: 768,
            min_side: 512,
            ar_min: 0.5,
            ar_max: 2.0,
            sharpness_min: 50.0,
            sharpness_good: 300.0,
            clip_max: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub manifest_path: PathBuf,
    pub recent_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("manifest/index.json"),
            recent_limit: 200,
        }
    }
}

/// Upper bound for any configured timeout or backoff: one day.
pub const MAX_SECONDS: f64 = 86_400.0;

/// Converts a configured number of seconds into a `Duration`. Negative,
/// non-finite and out-of-range values are errors.
pub fn seconds(label: &str, value: f64) -> anyhow::Result<Duration> {
    if !(0.0..=MAX_SECONDS).contains(&value) {
        bail!("{label} must lie in [0, {MAX_SECONDS}] seconds (got {value})");
    }
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{label} is not a representable duration ({value})"))
}

impl SelectionConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let ranking = &self.ranking;
        for (label, weight) in [
            ("w_brightness", ranking.w_brightness),
            ("w_entropy", ranking.w_entropy),
            ("w_aesthetic", ranking.w_aesthetic),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                bail!("ranking.{label} must be a non-negative number (got {weight})");
            }
        }
        if ranking.brightness_min > ranking.brightness_max {
            bail!(
                "ranking.brightness_min ({}) exceeds brightness_max ({})",
                ranking.brightness_min,
                ranking.brightness_max
            );
        }

        let generation = &self.image_generation;
        if generation.routes.is_empty() {
            bail!("image_generation.routes must list at least one provider");
        }
        if let Some(route) = generation
            .routes
            .iter()
            .find(|route| route.provider.trim().is_empty() || route.model.trim().is_empty())
        {
            bail!("image_generation.routes has an incomplete entry: {route:?}");
        }
        if generation.max_parallel == 0 {
            bail!("image_generation.max_parallel must be at least 1");
        }
        if generation.repetitions == 0 {
            bail!("image_generation.repetitions must be at least 1");
        }
        seconds("image_generation.retry_backoff_s", generation.retry_backoff_s)?;
        seconds(
            "image_generation.retry_backoff_max_s",
            generation.retry_backoff_max_s,
        )?;
        if seconds("image_generation.request_timeout_s", generation.request_timeout_s)?.is_zero() {
            bail!("image_generation.request_timeout_s must be positive");
        }

        let scoring = &self.aesthetic_scoring;
        if !(0.0..=1.0).contains(&scoring.default_score) {
            bail!(
                "aesthetic_scoring.default_score must lie in [0,1] (got {})",
                scoring.default_score
            );
        }
        if seconds("aesthetic_scoring.timeout_s", scoring.timeout_s)?.is_zero() {
            bail!("aesthetic_scoring.timeout_s must be positive");
        }
        if scoring.scorer == ScorerKind::Replicate
            && scoring
                .model
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            bail!("aesthetic_scoring.model is required for the replicate scorer");
        }

        let quality = &self.local_quality;
        if quality.ar_min > quality.ar_max {
            bail!(
                "local_quality.ar_min ({}) exceeds ar_max ({})",
                quality.ar_min,
                quality.ar_max
            );
        }
        Ok(())
    }
}
