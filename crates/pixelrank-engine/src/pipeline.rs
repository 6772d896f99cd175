//! One selection run end to end: acquire, score, rank, pick.

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use pixelrank_contracts::config::SelectionConfig;
use pixelrank_contracts::events::{EventLog, RunEvent};
use pixelrank_contracts::history::{Fingerprint, FingerprintHistory};
use serde::Serialize;

use crate::aesthetic::{AestheticAdapter, AestheticScorer};
use crate::candidate::{AestheticScore, Candidate, GenerationRequest};
use crate::error::SelectionError;
use crate::metrics;
use crate::orchestrator::ProviderOrchestrator;
use crate::providers::ImageProviderRegistry;
use crate::quality::{self, QualityVerdict};
use crate::ranking::normalize_and_rescore;
use crate::sanity::floor_violation;
use crate::selector::{rank, Selection, WinnerSelector};

/// Counters for the most recent run, kept even when the run fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub requested: usize,
    pub acquired: usize,
    pub acquisition_failures: usize,
    pub sanity_rejections: usize,
    pub quality_rejections: usize,
    pub degraded_scores: usize,
    pub ranked: usize,
    pub duplicates_skipped: usize,
}

#[derive(Debug)]
pub struct Winner {
    pub candidate: Candidate,
    pub fingerprint: Fingerprint,
    /// Zero-based position in the ranked order.
    pub rank: usize,
}

#[derive(Debug)]
pub enum SelectionOutcome {
    Winner(Winner),
    /// Every ranked candidate was a near-duplicate of recent history.
    Exhausted { scanned: usize },
}

impl SelectionOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            SelectionOutcome::Winner(_) => "winner",
            SelectionOutcome::Exhausted { .. } => "exhausted",
        }
    }

    pub fn winner(&self) -> Option<&Winner> {
        match self {
            SelectionOutcome::Winner(winner) => Some(winner),
            SelectionOutcome::Exhausted { .. } => None,
        }
    }
}

enum Rejection {
    Sanity,
    Quality,
}

enum Assessment {
    Accepted(Candidate),
    Rejected {
        candidate_id: String,
        stage: Rejection,
        reason: String,
        brightness: f64,
        entropy: f64,
    },
}

pub struct SelectionEngine {
    config: SelectionConfig,
    orchestrator: ProviderOrchestrator,
    aesthetic: AestheticAdapter,
    events: Option<EventLog>,
    last_stats: RunStats,
}

impl SelectionEngine {
    pub fn new(
        config: SelectionConfig,
        providers: &ImageProviderRegistry,
        scorer: Arc<dyn AestheticScorer>,
    ) -> Result<Self> {
        config.validate()?;
        let orchestrator = ProviderOrchestrator::new(&config.image_generation, providers)?;
        let aesthetic = AestheticAdapter::new(scorer, &config.aesthetic_scoring)?;
        Ok(Self {
            config,
            orchestrator,
            aesthetic,
            events: None,
            last_stats: RunStats::default(),
        })
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    pub fn last_stats(&self) -> &RunStats {
        &self.last_stats
    }

    pub fn run<H>(
        &mut self,
        requests: &[GenerationRequest],
        history: &H,
    ) -> Result<SelectionOutcome, SelectionError>
    where
        H: FingerprintHistory + ?Sized,
    {
        self.last_stats = RunStats {
            requested: requests.len(),
            ..RunStats::default()
        };
        self.emit(RunEvent::RunStarted {
            requests: requests.len(),
            routes: self.orchestrator.route_labels(),
        });
        tracing::info!(
            requests = requests.len(),
            scorer = self.aesthetic.scorer_name(),
            "selection run started"
        );

        let result = self.run_stages(requests, history);
        let outcome = match &result {
            Ok(outcome) => outcome.code(),
            Err(err) => err.code(),
        };
        self.emit(RunEvent::RunFinished {
            outcome: outcome.to_string(),
        });
        match &result {
            Ok(SelectionOutcome::Exhausted { scanned }) => {
                tracing::warn!(scanned, "no acceptable winner (duplicates only)")
            }
            Ok(SelectionOutcome::Winner(winner)) => tracing::info!(
                candidate = %winner.candidate.request_id,
                provider = %winner.candidate.provider,
                fingerprint = %winner.fingerprint,
                "winner selected"
            ),
            Err(err) => tracing::error!(code = err.code(), "selection run failed: {err}"),
        }
        result
    }

    fn run_stages<H>(
        &mut self,
        requests: &[GenerationRequest],
        history: &H,
    ) -> Result<SelectionOutcome, SelectionError>
    where
        H: FingerprintHistory + ?Sized,
    {
        let recent = history
            .recent_fingerprints(self.config.history.recent_limit)
            .map_err(|err| SelectionError::History(format!("{err:#}")))?;

        let batch = self.acquire(requests);
        if batch.is_empty() {
            return Err(SelectionError::NoImagesProduced);
        }

        let survivors = self.assess(batch);
        if survivors.is_empty() {
            return Err(SelectionError::AllCandidatesRejected);
        }

        let mut ranked = normalize_and_rescore(survivors, &self.config.ranking.weights());
        if ranked.is_empty() {
            return Err(SelectionError::AllCandidatesRejected);
        }
        rank(&mut ranked);
        self.last_stats.ranked = ranked.len();
        for (position, candidate) in ranked.iter().enumerate() {
            let scores = &candidate.scores;
            self.emit(RunEvent::CandidateRanked {
                candidate_id: candidate.request_id.clone(),
                rank: position,
                brightness_norm: scores.brightness_norm.unwrap_or_default(),
                entropy_norm: scores.entropy_norm.unwrap_or_default(),
                aesthetic: scores.aesthetic.as_ref().map(AestheticScore::value).unwrap_or_default(),
                final_score: scores.final_score.unwrap_or_default(),
            });
        }

        let mut selector = WinnerSelector::new(&recent, self.config.ranking.phash_distance_min);
        let selection = selector.select(ranked);
        self.last_stats.duplicates_skipped = selection.skipped().len();
        for skipped in selection.skipped() {
            self.emit(RunEvent::DuplicateSkipped {
                candidate_id: skipped.candidate_id.clone(),
                fingerprint: skipped.fingerprint.to_hex(),
            });
        }

        Ok(match selection {
            Selection::Found {
                candidate,
                fingerprint,
                rank,
                ..
            } => {
                self.emit(RunEvent::WinnerSelected {
                    candidate_id: candidate.request_id.clone(),
                    fingerprint: fingerprint.to_hex(),
                    final_score: candidate.final_score().unwrap_or_default(),
                });
                SelectionOutcome::Winner(Winner {
                    candidate,
                    fingerprint,
                    rank,
                })
            }
            Selection::Exhausted { skipped } => SelectionOutcome::Exhausted {
                scanned: skipped.len(),
            },
        })
    }

    fn acquire(&mut self, requests: &[GenerationRequest]) -> Vec<Candidate> {
        let mut batch = Vec::with_capacity(requests.len());
        for result in self.orchestrator.acquire_batch(requests) {
            match result {
                Ok(acquired) => {
                    let candidate = acquired.candidate;
                    self.emit(RunEvent::CandidateAcquired {
                        candidate_id: candidate.request_id.clone(),
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        seed: candidate.seed,
                        attempts: acquired.attempts,
                    });
                    batch.push(candidate);
                }
                Err(failure) => {
                    tracing::warn!("{failure}");
                    self.last_stats.acquisition_failures += 1;
                    self.emit(RunEvent::AcquisitionFailed {
                        request_id: failure.request_id,
                        attempts: failure.attempts,
                        last_error: failure.last_error,
                    });
                }
            }
        }
        self.last_stats.acquired = batch.len();
        batch
    }

    /// Scores every candidate with at most `max_parallel` in flight and drops
    /// the ones that fail a floor.
    fn assess(&mut self, batch: Vec<Candidate>) -> Vec<Candidate> {
        let max_parallel = self.config.image_generation.max_parallel.max(1);
        let mut assessments = Vec::with_capacity(batch.len());
        let mut pending = batch.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<Candidate> = pending.by_ref().take(max_parallel).collect();
            let engine = &*self;
            thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .into_iter()
                    .map(|candidate| {
                        let candidate_id = candidate.request_id.clone();
                        (candidate_id, scope.spawn(move || engine.assess_one(candidate)))
                    })
                    .collect();
                for (candidate_id, handle) in handles {
                    assessments.push(handle.join().unwrap_or_else(|_| Assessment::Rejected {
                        candidate_id,
                        stage: Rejection::Sanity,
                        reason: "scoring worker panicked".to_string(),
                        brightness: f64::NAN,
                        entropy: f64::NAN,
                    }));
                }
            });
        }

        let mut survivors = Vec::with_capacity(assessments.len());
        for assessment in assessments {
            match assessment {
                Assessment::Accepted(candidate) => {
                    if let Some(AestheticScore::Degraded { score, reason }) =
                        &candidate.scores.aesthetic
                    {
                        self.last_stats.degraded_scores += 1;
                        self.emit(RunEvent::ScoreDegraded {
                            candidate_id: candidate.request_id.clone(),
                            score: *score,
                            reason: reason.clone(),
                        });
                    }
                    survivors.push(candidate);
                }
                Assessment::Rejected {
                    candidate_id,
                    stage,
                    reason,
                    brightness,
                    entropy,
                } => {
                    match stage {
                        Rejection::Sanity => self.last_stats.sanity_rejections += 1,
                        Rejection::Quality => self.last_stats.quality_rejections += 1,
                    }
                    tracing::debug!(candidate = %candidate_id, "rejected: {reason}");
                    self.emit(RunEvent::CandidateRejected {
                        candidate_id,
                        reason,
                        brightness,
                        entropy,
                    });
                }
            }
        }
        survivors
    }

    fn assess_one(&self, mut candidate: Candidate) -> Assessment {
        let brightness = metrics::brightness(&candidate.image);
        let entropy = metrics::entropy(&candidate.image);
        candidate.scores.brightness = Some(brightness);
        candidate.scores.entropy = Some(entropy);

        if let Some(reason) = floor_violation(brightness, entropy, &self.config.ranking) {
            return Assessment::Rejected {
                candidate_id: candidate.request_id,
                stage: Rejection::Sanity,
                reason,
                brightness,
                entropy,
            };
        }

        if self.config.local_quality.enabled {
            match quality::evaluate(&candidate.image, &self.config.local_quality) {
                QualityVerdict::Pass { score } => candidate.scores.local_quality = Some(score),
                QualityVerdict::Reject { reason } => {
                    return Assessment::Rejected {
                        candidate_id: candidate.request_id,
                        stage: Rejection::Quality,
                        reason,
                        brightness,
                        entropy,
                    }
                }
            }
        }

        candidate.scores.aesthetic = Some(self.aesthetic.score(&candidate.image));
        Assessment::Accepted(candidate)
    }

    fn emit(&self, event: RunEvent) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(&event) {
            tracing::warn!(event = event.kind(), "failed to write run event: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use image::{DynamicImage, GrayImage, Luma};
    use pixelrank_contracts::config::ImageGenerationConfig;
    use serde_json::Value;

    use super::*;
    use crate::aesthetic::tests::FailingScorer;
    use crate::orchestrator::tests::{
        fast_config, registry_of, seeded_image, Behavior, MockProvider,
    };
    use crate::phash::phash;
    use crate::providers::{GenerateRequest, GeneratedImage, ImageProvider};

    /// Scores by mean luma so brighter candidates also look better.
    struct LumaScorer {
        calls: AtomicUsize,
    }

    impl LumaScorer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl AestheticScorer for LumaScorer {
        fn name(&self) -> &str {
            "luma"
        }

        fn score(&self, image: &DynamicImage) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(metrics::brightness(image) / 255.0)
        }
    }

    /// Flat, featureless frames for odd seeds; textured ones otherwise.
    struct FlatOnOddSeeds;

    impl ImageProvider for FlatOnOddSeeds {
        fn name(&self) -> &str {
            "flaky-texture"
        }

        fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
            let seed = request.seed.unwrap_or_default();
            let image = if seed % 2 == 1 {
                DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 64, Luma([128])))
            } else {
                seeded_image(seed)
            };
            Ok(GeneratedImage {
                image,
                seed: request.seed,
            })
        }
    }

    struct BrokenHistory;

    impl FingerprintHistory for BrokenHistory {
        fn recent_fingerprints(&self, _limit: usize) -> Result<Vec<Fingerprint>> {
            bail!("manifest is locked")
        }
    }

    fn config_with(generation: ImageGenerationConfig) -> SelectionConfig {
        SelectionConfig {
            image_generation: generation,
            ..SelectionConfig::default()
        }
    }

    fn batch(variants: usize, repetitions: usize) -> Vec<GenerationRequest> {
        let prompts: Vec<String> = (0..variants).map(|idx| format!("scene {idx}")).collect();
        GenerationRequest::expand(&prompts, repetitions, Some(0))
    }

    fn no_history() -> Vec<Fingerprint> {
        Vec::new()
    }

    fn read_events(path: &std::path::Path) -> Result<Vec<Value>> {
        let raw = std::fs::read_to_string(path)?;
        raw.lines()
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }

    #[test]
    fn dominant_candidate_wins_happy_path() -> Result<()> {
        let primary = MockProvider::new("primary", Behavior::Succeed);
        let registry = registry_of(&[primary.clone()]);
        let mut engine = SelectionEngine::new(
            config_with(fast_config(&["primary"], 0)),
            &registry,
            LumaScorer::new(),
        )?;

        let requests = batch(3, 3);
        assert_eq!(requests.len(), 9);
        let outcome = engine.run(&requests, &no_history())?;
        let Some(winner) = outcome.winner() else {
            panic!("expected a winner, got {outcome:?}");
        };
        assert_eq!(winner.candidate.request_id, "v2-r2");
        assert_eq!(winner.candidate.seed, Some(8));
        assert_eq!(winner.rank, 0);
        assert_eq!(winner.fingerprint, phash(&winner.candidate.image));

        let scores = &winner.candidate.scores;
        assert_eq!(scores.brightness_norm, Some(1.0));
        assert_eq!(scores.entropy_norm, Some(1.0));
        let aesthetic = scores.aesthetic.as_ref().map(AestheticScore::value).unwrap_or_default();
        let expected = 0.25 + 0.25 + 0.5 * aesthetic;
        assert!((winner.candidate.final_score().unwrap_or_default() - expected).abs() < 1e-12);

        let stats = engine.last_stats();
        assert_eq!(stats.requested, 9);
        assert_eq!(stats.acquired, 9);
        assert_eq!(stats.ranked, 9);
        assert_eq!(stats.duplicates_skipped, 0);
        Ok(())
    }

    #[test]
    fn all_duplicates_end_exhausted() -> Result<()> {
        let primary = MockProvider::new("primary", Behavior::Succeed);
        let registry = registry_of(&[primary]);
        let mut engine = SelectionEngine::new(
            config_with(fast_config(&["primary"], 0)),
            &registry,
            LumaScorer::new(),
        )?;
        let requests = batch(3, 1);
        let history: Vec<Fingerprint> = requests
            .iter()
            .map(|request| phash(&seeded_image(request.seed.unwrap_or_default())))
            .collect();

        let outcome = engine.run(&requests, &history)?;
        assert!(matches!(outcome, SelectionOutcome::Exhausted { scanned: 3 }));
        assert_eq!(outcome.code(), "exhausted");
        assert_eq!(engine.last_stats().duplicates_skipped, 3);
        Ok(())
    }

    #[test]
    fn empty_batch_reports_no_images_without_ranking() -> Result<()> {
        let primary = MockProvider::new("primary", Behavior::Fail);
        let secondary = MockProvider::new("secondary", Behavior::Fail);
        let registry = registry_of(&[primary.clone(), secondary.clone()]);
        let scorer = LumaScorer::new();
        let mut engine = SelectionEngine::new(
            config_with(fast_config(&["primary", "secondary"], 1)),
            &registry,
            scorer.clone(),
        )?;

        let err = engine.run(&batch(2, 2), &no_history()).err();
        assert_eq!(err, Some(SelectionError::NoImagesProduced));
        assert_eq!(err.map(|err| err.to_string()).unwrap_or_default(), "no images produced");
        assert_eq!(primary.calls(), 8);
        assert_eq!(secondary.calls(), 8);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
        let stats = engine.last_stats();
        assert_eq!(stats.acquisition_failures, 4);
        assert_eq!(stats.ranked, 0);
        Ok(())
    }

    #[test]
    fn fallback_provider_supplies_the_winner() -> Result<()> {
        let primary = MockProvider::new("primary", Behavior::Fail);
        let secondary = MockProvider::new("secondary", Behavior::Succeed);
        let registry = registry_of(&[primary, secondary]);
        let mut engine = SelectionEngine::new(
            config_with(fast_config(&["primary", "secondary"], 1)),
            &registry,
            LumaScorer::new(),
        )?;
        let outcome = engine.run(&batch(2, 2), &no_history())?;
        let Some(winner) = outcome.winner() else {
            panic!("expected a winner");
        };
        assert_eq!(winner.candidate.provider, "secondary");
        assert_eq!(engine.last_stats().acquired, 4);
        Ok(())
    }

    #[test]
    fn failing_scorer_degrades_every_candidate() -> Result<()> {
        let primary = MockProvider::new("primary", Behavior::Succeed);
        let registry = registry_of(&[primary]);
        let scorer = Arc::new(FailingScorer {
            calls: AtomicUsize::new(0),
        });
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let mut engine = SelectionEngine::new(
            config_with(fast_config(&["primary"], 0)),
            &registry,
            scorer.clone(),
        )?
        .with_events(EventLog::new(&events_path, "run-degraded"));

        let outcome = engine.run(&batch(2, 2), &no_history())?;
        let Some(winner) = outcome.winner() else {
            panic!("ranking should complete with degraded scores");
        };
        assert_eq!(
            winner.candidate.scores.aesthetic.as_ref().map(AestheticScore::value),
            Some(0.5)
        );
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 4);
        assert_eq!(engine.last_stats().degraded_scores, 4);

        let events = read_events(&events_path)?;
        let degraded: Vec<&Value> = events
            .iter()
            .filter(|event| event["type"] == "score_degraded")
            .collect();
        assert_eq!(degraded.len(), 4);
        assert!(degraded.iter().all(|event| event["score"] == 0.5));
        assert_eq!(events.first().map(|event| event["type"].clone()), Some("run_started".into()));
        assert_eq!(events.last().map(|event| event["outcome"].clone()), Some("winner".into()));
        Ok(())
    }

    #[test]
    fn low_entropy_candidates_never_reach_ranking() -> Result<()> {
        let mut registry = ImageProviderRegistry::new();
        registry.register(FlatOnOddSeeds);
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let mut engine = SelectionEngine::new(
            config_with(fast_config(&["flaky-texture"], 0)),
            &registry,
            LumaScorer::new(),
        )?
        .with_events(EventLog::new(&events_path, "run-floors"));

        let requests = batch(1, 6);
        let outcome = engine.run(&requests, &no_history())?;
        let Some(winner) = outcome.winner() else {
            panic!("expected a textured winner");
        };
        assert_eq!(winner.candidate.seed.map(|seed| seed % 2), Some(0));
        assert_eq!(engine.last_stats().sanity_rejections, 3);
        assert_eq!(engine.last_stats().ranked, 3);

        let events = read_events(&events_path)?;
        let ranked_ids: Vec<String> = events
            .iter()
            .filter(|event| event["type"] == "candidate_ranked")
            .filter_map(|event| event["candidate_id"].as_str().map(str::to_string))
            .collect();
        assert_eq!(ranked_ids.len(), 3);
        for id in ["v0-r1", "v0-r3", "v0-r5"] {
            assert!(!ranked_ids.iter().any(|ranked| ranked == id), "{id} was ranked");
        }
        let rejected = events
            .iter()
            .filter(|event| event["type"] == "candidate_rejected")
            .count();
        assert_eq!(rejected, 3);
        Ok(())
    }

    #[test]
    fn all_rejected_is_terminal() -> Result<()> {
        let primary = MockProvider::new("primary", Behavior::Succeed);
        let registry = registry_of(&[primary]);
        let mut config = config_with(fast_config(&["primary"], 0));
        config.local_quality.enabled = true;
        let mut engine = SelectionEngine::new(config, &registry, LumaScorer::new())?;

        let err = engine.run(&batch(1, 3), &no_history()).err();
        assert_eq!(err, Some(SelectionError::AllCandidatesRejected));
        assert_eq!(engine.last_stats().quality_rejections, 3);
        Ok(())
    }

    #[test]
    fn oversized_timeout_is_rejected_at_construction() {
        let registry = registry_of(&[MockProvider::new("primary", Behavior::Succeed)]);
        let mut generation = fast_config(&["primary"], 0);
        generation.request_timeout_s = 1e30;
        let built = SelectionEngine::new(config_with(generation), &registry, LumaScorer::new());
        assert!(built.is_err());

        let mut config = config_with(fast_config(&["primary"], 0));
        config.aesthetic_scoring.timeout_s = 1e300;
        assert!(SelectionEngine::new(config, &registry, LumaScorer::new()).is_err());
    }

    #[test]
    fn unreadable_history_is_terminal() -> Result<()> {
        let primary = MockProvider::new("primary", Behavior::Succeed);
        let registry = registry_of(&[primary.clone()]);
        let mut engine = SelectionEngine::new(
            config_with(fast_config(&["primary"], 0)),
            &registry,
            LumaScorer::new(),
        )?;
        let err = engine.run(&batch(1, 1), &BrokenHistory).err();
        assert!(matches!(err, Some(SelectionError::History(reason)) if reason.contains("locked")));
        assert_eq!(primary.calls(), 0);
        Ok(())
    }
}
