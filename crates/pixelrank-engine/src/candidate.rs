use image::DynamicImage;

/// One image to acquire: a prompt variant at a given repetition.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub variant: usize,
    pub repetition: usize,
    pub prompt: String,
    pub seed: Option<i64>,
}

impl GenerationRequest {
    pub fn id(&self) -> String {
        format!("v{}-r{}", self.variant, self.repetition)
    }

    /// Requests in batch order: every repetition of variant 0, then variant 1, ...
    /// With a base seed, request `i` in that order is seeded `base_seed + i`.
    pub fn expand(
        prompts: &[String],
        repetitions: usize,
        base_seed: Option<i64>,
    ) -> Vec<GenerationRequest> {
        let mut requests = Vec::with_capacity(prompts.len() * repetitions);
        for (variant, prompt) in prompts.iter().enumerate() {
            for repetition in 0..repetitions {
                let position = requests.len() as i64;
                requests.push(GenerationRequest {
                    variant,
                    repetition,
                    prompt: prompt.clone(),
                    seed: base_seed.map(|seed| seed.saturating_add(position)),
                });
            }
        }
        requests
    }
}

/// Outcome of the aesthetic adapter. A degraded score stands in for a failed
/// scorer call and carries the failure reason.
#[derive(Debug, Clone, PartialEq)]
pub enum AestheticScore {
    Scored(f64),
    Degraded { score: f64, reason: String },
}

impl AestheticScore {
    pub fn value(&self) -> f64 {
        match self {
            AestheticScore::Scored(score) => *score,
            AestheticScore::Degraded { score, .. } => *score,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, AestheticScore::Degraded { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scores {
    pub brightness: Option<f64>,
    pub entropy: Option<f64>,
    pub aesthetic: Option<AestheticScore>,
    pub local_quality: Option<f64>,
    pub brightness_norm: Option<f64>,
    pub entropy_norm: Option<f64>,
    /// Only meaningful against other candidates of the same batch.
    pub final_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    /// Position in the batch; breaks ranking ties.
    pub index: usize,
    pub request_id: String,
    pub image: DynamicImage,
    pub prompt: String,
    pub provider: String,
    pub model: String,
    pub seed: Option<i64>,
    pub scores: Scores,
}

impl Candidate {
    pub fn final_score(&self) -> Option<f64> {
        self.scores.final_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_orders_by_variant_then_repetition() {
        let prompts = vec!["a misty forest".to_string(), "neon city".to_string()];
        let requests = GenerationRequest::expand(&prompts, 3, None);
        let ids: Vec<String> = requests.iter().map(GenerationRequest::id).collect();
        assert_eq!(ids, vec!["v0-r0", "v0-r1", "v0-r2", "v1-r0", "v1-r1", "v1-r2"]);
        assert_eq!(requests[4].prompt, "neon city");
        assert!(requests.iter().all(|request| request.seed.is_none()));
    }

    #[test]
    fn expand_assigns_sequential_seeds_from_base() {
        let prompts = vec!["a".to_string(), "b".to_string()];
        let seeds: Vec<Option<i64>> = GenerationRequest::expand(&prompts, 2, Some(100))
            .into_iter()
            .map(|request| request.seed)
            .collect();
        assert_eq!(seeds, vec![Some(100), Some(101), Some(102), Some(103)]);
    }

    #[test]
    fn degraded_score_reports_its_default_value() {
        let degraded = AestheticScore::Degraded {
            score: 0.5,
            reason: "timed out".to_string(),
        };
        assert_eq!(degraded.value(), 0.5);
        assert!(degraded.is_degraded());
        assert!(!AestheticScore::Scored(0.9).is_degraded());
    }
}
