//! Winner selection: rank by final score, then take the first candidate that
//! is not a near-duplicate of recent history.

use std::cmp::Ordering;

use pixelrank_contracts::history::Fingerprint;

use crate::candidate::Candidate;
use crate::phash::{is_duplicate, phash};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    Ranking,
    Scanning,
    Found,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDuplicate {
    pub candidate_id: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug)]
pub enum Selection {
    Found {
        candidate: Candidate,
        fingerprint: Fingerprint,
        /// Position of the winner in the ranked order, zero-based.
        rank: usize,
        skipped: Vec<SkippedDuplicate>,
    },
    Exhausted {
        skipped: Vec<SkippedDuplicate>,
    },
}

impl Selection {
    pub fn state(&self) -> SelectorState {
        match self {
            Selection::Found { .. } => SelectorState::Found,
            Selection::Exhausted { .. } => SelectorState::Exhausted,
        }
    }

    pub fn skipped(&self) -> &[SkippedDuplicate] {
        match self {
            Selection::Found { skipped, .. } | Selection::Exhausted { skipped } => skipped,
        }
    }
}

/// Stable order: higher final score first, batch index breaks ties.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        let left = a.final_score().unwrap_or(f64::NEG_INFINITY);
        let right = b.final_score().unwrap_or(f64::NEG_INFINITY);
        right
            .partial_cmp(&left)
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
}

pub struct WinnerSelector<'a> {
    recent: &'a [Fingerprint],
    distance_min: u32,
    state: SelectorState,
}

impl<'a> WinnerSelector<'a> {
    pub fn new(recent: &'a [Fingerprint], distance_min: u32) -> Self {
        Self {
            recent,
            distance_min,
            state: SelectorState::Ranking,
        }
    }

    pub fn state(&self) -> SelectorState {
        self.state
    }

    pub fn select(&mut self, candidates: Vec<Candidate>) -> Selection {
        self.select_with(candidates, |candidate| phash(&candidate.image))
    }

    /// Same as [`select`](Self::select) with a caller-supplied fingerprint
    /// function; fingerprints are computed lazily, in rank order.
    pub fn select_with<F>(&mut self, mut candidates: Vec<Candidate>, mut fingerprint_of: F) -> Selection
    where
        F: FnMut(&Candidate) -> Fingerprint,
    {
        self.state = SelectorState::Ranking;
        rank(&mut candidates);

        self.state = SelectorState::Scanning;
        let mut skipped = Vec::new();
        for (position, candidate) in candidates.into_iter().enumerate() {
            let fingerprint = fingerprint_of(&candidate);
            if is_duplicate(&fingerprint, self.recent, self.distance_min) {
                tracing::debug!(
                    candidate = %candidate.request_id,
                    %fingerprint,
                    "skipping near-duplicate of recent history"
                );
                skipped.push(SkippedDuplicate {
                    candidate_id: candidate.request_id.clone(),
                    fingerprint,
                });
                continue;
            }
            self.state = SelectorState::Found;
            return Selection::Found {
                candidate,
                fingerprint,
                rank: position,
                skipped,
            };
        }
        self.state = SelectorState::Exhausted;
        Selection::Exhausted { skipped }
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, RgbImage};

    use super::*;
    use crate::candidate::Scores;

    fn scored(index: usize, final_score: f64) -> Candidate {
        Candidate {
            index,
            request_id: format!("v{index}-r0"),
            image: DynamicImage::ImageRgb8(RgbImage::new(1, 1)),
            prompt: "p".to_string(),
            provider: "dryrun".to_string(),
            model: "m".to_string(),
            seed: None,
            scores: Scores {
                final_score: Some(final_score),
                ..Scores::default()
            },
        }
    }

    fn fingerprint_by_index(candidate: &Candidate) -> Fingerprint {
        // Spread indices far apart in Hamming space.
        Fingerprint::from_bits(0x0101_0101_0101_0101u64.wrapping_mul(candidate.index as u64 + 1) ^ 0xff)
    }

    #[test]
    fn ties_keep_batch_order() {
        let mut candidates = vec![scored(2, 0.7), scored(0, 0.7), scored(1, 0.9), scored(3, 0.1)];
        rank(&mut candidates);
        let order: Vec<usize> = candidates.iter().map(|candidate| candidate.index).collect();
        assert_eq!(order, vec![1, 0, 2, 3]);
    }

    #[test]
    fn selection_is_deterministic() {
        let batch = || vec![scored(0, 0.4), scored(1, 0.8), scored(2, 0.8)];
        for _ in 0..5 {
            let mut selector = WinnerSelector::new(&[], 6);
            match selector.select_with(batch(), fingerprint_by_index) {
                Selection::Found { candidate, rank, .. } => {
                    assert_eq!(candidate.index, 1);
                    assert_eq!(rank, 0);
                }
                other => panic!("expected a winner, got {other:?}"),
            }
            assert_eq!(selector.state(), SelectorState::Found);
        }
    }

    #[test]
    fn duplicate_top_candidate_is_never_selected() {
        let candidates = vec![scored(0, 0.99), scored(1, 0.5)];
        let top = fingerprint_by_index(&candidates[0]);
        let near = Fingerprint::from_bits(top.bits() ^ 0b101);
        let recent = [near];
        let mut selector = WinnerSelector::new(&recent, 6);
        let selection = selector.select_with(candidates, fingerprint_by_index);
        assert_eq!(selection.skipped().len(), 1);
        assert_eq!(selection.skipped()[0].candidate_id, "v0-r0");
        match selection {
            Selection::Found { candidate, rank, .. } => {
                assert_eq!(candidate.index, 1);
                assert_eq!(rank, 1);
            }
            other => panic!("expected runner-up to win, got {other:?}"),
        }
    }

    #[test]
    fn all_duplicates_exhaust_the_scan() {
        let candidates = vec![scored(0, 0.3), scored(1, 0.6), scored(2, 0.9)];
        let recent: Vec<Fingerprint> = candidates.iter().map(fingerprint_by_index).collect();
        let mut selector = WinnerSelector::new(&recent, 6);
        let selection = selector.select_with(candidates, fingerprint_by_index);
        assert_eq!(selection.state(), SelectorState::Exhausted);
        assert_eq!(selector.state(), SelectorState::Exhausted);
        let scanned: Vec<&str> = selection
            .skipped()
            .iter()
            .map(|skip| skip.candidate_id.as_str())
            .collect();
        assert_eq!(scanned, vec!["v2-r0", "v1-r0", "v0-r0"]);
    }

    #[test]
    fn distance_at_threshold_is_not_a_duplicate() {
        let candidates = vec![scored(0, 0.5)];
        let own = fingerprint_by_index(&candidates[0]);
        let recent = [Fingerprint::from_bits(own.bits() ^ 0b11_1111)];
        let mut selector = WinnerSelector::new(&recent, 6);
        let selection = selector.select_with(candidates, fingerprint_by_index);
        assert_eq!(selection.state(), SelectorState::Found);
    }
}
