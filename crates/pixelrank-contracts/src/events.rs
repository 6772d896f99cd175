use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Lifecycle of one selection run as written to `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        requests: usize,
        routes: Vec<String>,
    },
    CandidateAcquired {
        candidate_id: String,
        provider: String,
        model: String,
        seed: Option<i64>,
        attempts: u32,
    },
    AcquisitionFailed {
        request_id: String,
        attempts: u32,
        last_error: String,
    },
    CandidateRejected {
        candidate_id: String,
        reason: String,
        brightness: f64,
        entropy: f64,
    },
    ScoreDegraded {
        candidate_id: String,
        score: f64,
        reason: String,
    },
    CandidateRanked {
        candidate_id: String,
        rank: usize,
        brightness_norm: f64,
        entropy_norm: f64,
        aesthetic: f64,
        final_score: f64,
    },
    DuplicateSkipped {
        candidate_id: String,
        fingerprint: String,
    },
    WinnerSelected {
        candidate_id: String,
        fingerprint: String,
        final_score: f64,
    },
    RunFinished {
        outcome: String,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::CandidateAcquired { .. } => "candidate_acquired",
            RunEvent::AcquisitionFailed { .. } => "acquisition_failed",
            RunEvent::CandidateRejected { .. } => "candidate_rejected",
            RunEvent::ScoreDegraded { .. } => "score_degraded",
            RunEvent::CandidateRanked { .. } => "candidate_ranked",
            RunEvent::DuplicateSkipped { .. } => "duplicate_skipped",
            RunEvent::WinnerSelected { .. } => "winner_selected",
            RunEvent::RunFinished { .. } => "run_finished",
        }
    }
}

/// Append-only writer for `events.jsonl`: one compact object per line with
/// `type`, `run_id` and `ts` alongside the event fields.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event: &RunEvent) -> anyhow::Result<Value> {
        let mut record = Map::new();
        record.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        record.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(fields) = serde_json::to_value(event)? {
            record.extend(fields);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&record)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(record))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
