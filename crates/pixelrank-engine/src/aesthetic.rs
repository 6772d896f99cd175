//! Aesthetic scoring: pluggable scorers behind an adapter that bounds every
//! call in time and degrades to a neutral default instead of failing.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use image::{DynamicImage, GenericImageView};
use pixelrank_contracts::config::{seconds, AestheticScoringConfig, ScorerKind};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use crate::candidate::AestheticScore;
use crate::http::{api_base_from_env, non_empty_env, png_data_url, response_json_or_error};
use crate::timeout::call_with_timeout;

pub trait AestheticScorer: Send + Sync {
    fn name(&self) -> &str;
    /// Raw score; the adapter clamps it to [0,1].
    fn score(&self, image: &DynamicImage) -> Result<f64>;
}

pub struct AestheticAdapter {
    scorer: Arc<dyn AestheticScorer>,
    timeout: Duration,
    default_score: f64,
}

impl AestheticAdapter {
    pub fn new(scorer: Arc<dyn AestheticScorer>, config: &AestheticScoringConfig) -> Result<Self> {
        Ok(Self {
            scorer,
            timeout: seconds("aesthetic_scoring.timeout_s", config.timeout_s)?,
            default_score: config.default_score,
        })
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    pub fn score(&self, image: &DynamicImage) -> AestheticScore {
        let scorer = Arc::clone(&self.scorer);
        let owned = image.clone();
        let label = format!("{} scorer", self.scorer.name());
        let outcome = call_with_timeout(&label, self.timeout, move || scorer.score(&owned))
            .and_then(|raw| {
                if raw.is_finite() {
                    Ok(raw.clamp(0.0, 1.0))
                } else {
                    Err(anyhow!("scorer returned a non-finite value ({raw})"))
                }
            });
        match outcome {
            Ok(score) => AestheticScore::Scored(score),
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::warn!(
                    scorer = self.scorer.name(),
                    default = self.default_score,
                    "aesthetic scoring degraded: {reason}"
                );
                AestheticScore::Degraded {
                    score: self.default_score,
                    reason,
                }
            }
        }
    }
}

pub fn scorer_from_config(config: &AestheticScoringConfig) -> Result<Arc<dyn AestheticScorer>> {
    match config.scorer {
        ScorerKind::Heuristic => Ok(Arc::new(HeuristicScorer)),
        ScorerKind::Replicate => {
            let model = config
                .model
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| anyhow!("replicate scorer needs aesthetic_scoring.model"))?;
            Ok(Arc::new(ReplicateAestheticScorer::new(
                model,
                seconds("aesthetic_scoring.timeout_s", config.timeout_s)?,
            )))
        }
    }
}

/// Model-free score from framing: common aspect ratios and pixel count.
pub struct HeuristicScorer;

const GOLDEN_RATIO: f64 = 1.618;
const FULL_HD_PIXELS: f64 = 1920.0 * 1080.0;

impl AestheticScorer for HeuristicScorer {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn score(&self, image: &DynamicImage) -> Result<f64> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            bail!("cannot score an empty raster");
        }
        let aspect = width as f64 / height as f64;
        let common = [
            1.0,
            4.0 / 3.0,
            3.0 / 2.0,
            16.0 / 9.0,
            GOLDEN_RATIO,
            1.0 / GOLDEN_RATIO,
        ];
        let ratio_score = if common.iter().any(|ratio| (aspect - ratio).abs() < 0.1) {
            0.8
        } else {
            0.5
        };
        let size_score = ((width as f64 * height as f64) / FULL_HD_PIXELS).min(1.0);
        Ok((ratio_score * 0.6 + size_score * 0.4).clamp(0.0, 1.0))
    }
}

/// Hosted aesthetic predictor run as a Replicate prediction.
pub struct ReplicateAestheticScorer {
    api_base: String,
    model: String,
    timeout: Duration,
    http: HttpClient,
}

impl ReplicateAestheticScorer {
    pub fn new(model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_from_env("REPLICATE_API_BASE", "https://api.replicate.com/v1"),
            model: model.into(),
            timeout,
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("REPLICATE_API_TOKEN").or_else(|| non_empty_env("REPLICATE_API_KEY"))
    }

    fn poll(&self, poll_url: &str, api_key: &str, started: Instant) -> Result<Value> {
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_key)
                .timeout(self.timeout)
                .send()
                .with_context(|| format!("Replicate scorer poll failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate scorer poll", response)?;
            match prediction_status(&payload).as_str() {
                "succeeded" => return Ok(payload),
                "failed" | "canceled" => bail!("Replicate scorer prediction failed: {payload}"),
                _ => {}
            }
            if started.elapsed() >= self.timeout {
                bail!(
                    "Replicate scorer polling timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                );
            }
            thread::sleep(Duration::from_millis(500));
        }
    }
}

impl AestheticScorer for ReplicateAestheticScorer {
    fn name(&self) -> &str {
        "replicate"
    }

    fn score(&self, image: &DynamicImage) -> Result<f64> {
        let Some(api_key) = Self::api_key() else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        let endpoint = format!("{}/predictions", self.api_base);
        let payload = json!({
            "model": self.model,
            "input": { "image": png_data_url(image)? },
        });
        let started = Instant::now();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header("Prefer", "wait")
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Replicate scorer request failed ({endpoint})"))?;
        let mut prediction = response_json_or_error("Replicate scorer", response)?;
        if prediction_status(&prediction) != "succeeded" {
            let poll_url = prediction
                .get("urls")
                .and_then(|urls| urls.get("get"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("Replicate scorer prediction missing poll URL"))?;
            prediction = self.poll(&poll_url, &api_key, started)?;
        }
        let output = prediction.get("output").cloned().unwrap_or(Value::Null);
        parse_score_output(&output)
    }
}

fn prediction_status(payload: &Value) -> String {
    payload
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Accepts a bare number, a list led by a number, or an object with `score` /
/// `aesthetic_score`; the result is clamped to [0,1].
pub(crate) fn parse_score_output(output: &Value) -> Result<f64> {
    let raw = match output {
        Value::Number(number) => number.as_f64(),
        Value::Array(rows) => rows.first().and_then(Value::as_f64),
        Value::Object(obj) => obj
            .get("score")
            .or_else(|| obj.get("aesthetic_score"))
            .and_then(Value::as_f64),
        _ => None,
    };
    let Some(score) = raw.filter(|value| value.is_finite()) else {
        bail!("malformed scorer output: {output}");
    };
    Ok(score.clamp(0.0, 1.0))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{Rgb, RgbImage};

    use super::*;

    pub(crate) struct FailingScorer {
        pub calls: AtomicUsize,
    }

    impl AestheticScorer for FailingScorer {
        fn name(&self) -> &str {
            "failing"
        }

        fn score(&self, _image: &DynamicImage) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("scoring backend unavailable")
        }
    }

    struct FixedScorer(f64);

    impl AestheticScorer for FixedScorer {
        fn name(&self) -> &str {
            "fixed"
        }

        fn score(&self, _image: &DynamicImage) -> Result<f64> {
            Ok(self.0)
        }
    }

    struct SlowScorer;

    impl AestheticScorer for SlowScorer {
        fn name(&self) -> &str {
            "slow"
        }

        fn score(&self, _image: &DynamicImage) -> Result<f64> {
            thread::sleep(Duration::from_millis(500));
            Ok(0.9)
        }
    }

    fn image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 90, 90])))
    }

    fn config(timeout_s: f64) -> AestheticScoringConfig {
        AestheticScoringConfig {
            timeout_s,
            ..AestheticScoringConfig::default()
        }
    }

    #[test]
    fn successful_score_is_clamped() -> Result<()> {
        let adapter = AestheticAdapter::new(Arc::new(FixedScorer(1.7)), &config(5.0))?;
        assert_eq!(adapter.score(&image(4, 4)), AestheticScore::Scored(1.0));
        let adapter = AestheticAdapter::new(Arc::new(FixedScorer(0.42)), &config(5.0))?;
        assert_eq!(adapter.score(&image(4, 4)), AestheticScore::Scored(0.42));
        Ok(())
    }

    #[test]
    fn oversized_timeout_is_rejected() {
        let err = AestheticAdapter::new(Arc::new(FixedScorer(0.5)), &config(1e300))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("aesthetic_scoring.timeout_s"), "{err}");

        let replicate = AestheticScoringConfig {
            scorer: ScorerKind::Replicate,
            model: Some("owner/aesthetic-predictor".to_string()),
            timeout_s: f64::INFINITY,
            ..AestheticScoringConfig::default()
        };
        assert!(scorer_from_config(&replicate).is_err());
    }

    #[test]
    fn failure_degrades_to_default() -> Result<()> {
        let scorer = Arc::new(FailingScorer {
            calls: AtomicUsize::new(0),
        });
        let adapter = AestheticAdapter::new(scorer.clone(), &config(5.0))?;
        let score = adapter.score(&image(4, 4));
        assert_eq!(score.value(), 0.5);
        match score {
            AestheticScore::Degraded { reason, .. } => {
                assert!(reason.contains("unavailable"))
            }
            other => panic!("expected degraded score, got {other:?}"),
        }
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn timeout_degrades_to_default() -> Result<()> {
        let adapter = AestheticAdapter::new(Arc::new(SlowScorer), &config(0.02))?;
        let score = adapter.score(&image(4, 4));
        assert!(score.is_degraded());
        assert_eq!(score.value(), 0.5);
        Ok(())
    }

    #[test]
    fn non_finite_score_degrades() -> Result<()> {
        let adapter = AestheticAdapter::new(Arc::new(FixedScorer(f64::NAN)), &config(5.0))?;
        assert!(adapter.score(&image(4, 4)).is_degraded());
        Ok(())
    }

    #[test]
    fn heuristic_prefers_common_ratios_and_large_frames() -> Result<()> {
        let scorer = HeuristicScorer;
        let full_hd = scorer.score(&image(1920, 1080))?;
        assert!((full_hd - (0.8 * 0.6 + 0.4)).abs() < 1e-9);
        let odd = scorer.score(&image(300, 100))?;
        let expected_odd = 0.5 * 0.6 + 0.4 * (30000.0 / FULL_HD_PIXELS);
        assert!((odd - expected_odd).abs() < 1e-9);
        assert!(full_hd > odd);
        Ok(())
    }

    #[test]
    fn parse_score_output_accepts_known_shapes() -> Result<()> {
        assert_eq!(parse_score_output(&json!(0.7))?, 0.7);
        assert_eq!(parse_score_output(&json!([0.3, 0.9]))?, 0.3);
        assert_eq!(parse_score_output(&json!({"score": 2.5}))?, 1.0);
        assert_eq!(parse_score_output(&json!({"aesthetic_score": 0.25}))?, 0.25);
        assert!(parse_score_output(&json!("high")).is_err());
        assert!(parse_score_output(&json!({"label": "nice"})).is_err());
        assert!(parse_score_output(&Value::Null).is_err());
        Ok(())
    }

    #[test]
    fn config_selects_scorer_variant() -> Result<()> {
        let heuristic = scorer_from_config(&AestheticScoringConfig::default())?;
        assert_eq!(heuristic.name(), "heuristic");

        let mut config = AestheticScoringConfig {
            scorer: ScorerKind::Replicate,
            ..AestheticScoringConfig::default()
        };
        assert!(scorer_from_config(&config).is_err());
        config.model = Some("owner/aesthetic-predictor".to_string());
        assert_eq!(scorer_from_config(&config)?.name(), "replicate");
        Ok(())
    }
}
