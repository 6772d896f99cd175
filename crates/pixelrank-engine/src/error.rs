use thiserror::Error;

/// Terminal outcomes of a run. "Exhausted without winner" is deliberately not
/// here: it is a clean, non-fatal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no images produced")]
    NoImagesProduced,
    #[error("all candidates failed sanity/scoring")]
    AllCandidatesRejected,
    #[error("recent fingerprint history unavailable: {0}")]
    History(String),
}

impl SelectionError {
    pub fn code(&self) -> &'static str {
        match self {
            SelectionError::NoImagesProduced => "no_images_produced",
            SelectionError::AllCandidatesRejected => "all_rejected",
            SelectionError::History(_) => "history_unavailable",
        }
    }
}

/// Every route for one request ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("all providers exhausted for {request_id} after {attempts} attempts: {last_error}")]
pub struct AcquisitionFailure {
    pub request_id: String,
    pub attempts: u32,
    pub last_error: String,
}
