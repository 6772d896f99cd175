//! Candidate ranking and selection: turns a batch of generated images into a
//! single winner, or a clean "nothing new to publish" outcome.

pub mod aesthetic;
pub mod candidate;
pub mod error;
mod http;
pub mod metrics;
pub mod orchestrator;
pub mod phash;
pub mod pipeline;
pub mod providers;
pub mod quality;
pub mod ranking;
pub mod sanity;
pub mod selector;
mod timeout;

pub use aesthetic::{scorer_from_config, AestheticAdapter, AestheticScorer, HeuristicScorer};
pub use candidate::{AestheticScore, Candidate, GenerationRequest, Scores};
pub use error::{AcquisitionFailure, SelectionError};
pub use pipeline::{RunStats, SelectionEngine, SelectionOutcome, Winner};
pub use providers::{default_provider_registry, ImageProvider, ImageProviderRegistry};
