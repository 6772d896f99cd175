//! Published-image history: the fingerprint value type, the read-only
//! collaborator trait the engine dedupes against, and a JSON manifest store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 64-bit perceptual hash. The first grid bit is the most significant one, so
/// the hex form matches manifests written by earlier tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const BITS: u32 = 64;

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Hamming distance over the 64 hash bits.
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    pub fn from_hex(raw: &str) -> anyhow::Result<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != 16 {
            bail!("fingerprint must be 16 hex digits (got {:?})", trimmed);
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(trimmed, &mut bytes)
            .with_context(|| format!("fingerprint is not valid hex ({trimmed})"))?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Source of recently published fingerprints, most recent last.
pub trait FingerprintHistory {
    fn recent_fingerprints(&self, limit: usize) -> anyhow::Result<Vec<Fingerprint>>;
}

impl FingerprintHistory for [Fingerprint] {
    fn recent_fingerprints(&self, limit: usize) -> anyhow::Result<Vec<Fingerprint>> {
        let start = self.len().saturating_sub(limit);
        Ok(self[start..].to_vec())
    }
}

impl FingerprintHistory for Vec<Fingerprint> {
    fn recent_fingerprints(&self, limit: usize) -> anyhow::Result<Vec<Fingerprint>> {
        self.as_slice().recent_fingerprints(limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HistoryEntry {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub phash: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Append-only list of published images stored as a JSON array.
#[derive(Debug, Clone)]
pub struct HistoryManifest {
    path: PathBuf,
}

impl HistoryManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> anyhow::Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed reading manifest {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("manifest {} is not a JSON array", self.path.display()))
    }

    pub fn append(&self, entry: HistoryEntry) -> anyhow::Result<()> {
        let mut entries = self.entries()?;
        entries.push(entry);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?)
            .with_context(|| format!("failed writing manifest {}", self.path.display()))?;
        Ok(())
    }
}

impl FingerprintHistory for HistoryManifest {
    fn recent_fingerprints(&self, limit: usize) -> anyhow::Result<Vec<Fingerprint>> {
        let entries = self.entries()?;
        let start = entries.len().saturating_sub(limit);
        let mut out = Vec::new();
        for entry in &entries[start..] {
            let Some(raw) = entry.phash.as_deref() else {
                continue;
            };
            match Fingerprint::from_hex(raw) {
                Ok(fingerprint) => out.push(fingerprint),
                Err(err) => {
                    tracing::warn!(entry = %entry.id, "skipping manifest fingerprint: {err}");
                }
            }
        }
        Ok(out)
    }
}
