//! Batch-relative min-max normalization and weighted final scores.

use pixelrank_contracts::config::RankingWeights;

use crate::candidate::Candidate;

/// Scales `values` into [0,1]. A batch without spread maps every value to 0.5.
pub fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    values
        .iter()
        .map(|value| {
            if span > 0.0 && span.is_finite() {
                ((value - min) / span).clamp(0.0, 1.0)
            } else {
                0.5
            }
        })
        .collect()
}

pub fn weighted_score(
    weights: &RankingWeights,
    brightness_norm: f64,
    entropy_norm: f64,
    aesthetic: f64,
) -> f64 {
    weights.brightness * brightness_norm
        + weights.entropy * entropy_norm
        + weights.aesthetic * aesthetic
}

/// Attaches normalized metrics and `final_score` to every candidate. Candidates
/// missing a raw metric cannot be compared and are dropped.
pub fn normalize_and_rescore(candidates: Vec<Candidate>, weights: &RankingWeights) -> Vec<Candidate> {
    let mut rankable = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let scores = &candidate.scores;
        if scores.brightness.is_some() && scores.entropy.is_some() && scores.aesthetic.is_some() {
            rankable.push(candidate);
        } else {
            tracing::warn!(
                candidate = %candidate.request_id,
                "dropping candidate with incomplete scores"
            );
        }
    }

    let brightness: Vec<f64> = rankable
        .iter()
        .map(|candidate| candidate.scores.brightness.unwrap_or_default())
        .collect();
    let entropy: Vec<f64> = rankable
        .iter()
        .map(|candidate| candidate.scores.entropy.unwrap_or_default())
        .collect();
    let brightness_norm = min_max_normalize(&brightness);
    let entropy_norm = min_max_normalize(&entropy);

    for (idx, candidate) in rankable.iter_mut().enumerate() {
        let aesthetic = candidate
            .scores
            .aesthetic
            .as_ref()
            .map(|score| score.value())
            .unwrap_or_default();
        let final_score =
            weighted_score(weights, brightness_norm[idx], entropy_norm[idx], aesthetic);
        candidate.scores.brightness_norm = Some(brightness_norm[idx]);
        candidate.scores.entropy_norm = Some(entropy_norm[idx]);
        candidate.scores.final_score = Some(final_score);
    }
    rankable
}
