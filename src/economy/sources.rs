//! Inbound Collaborators
//!
//! The engine only reads what external ingestion produces: drafted
//! hypotheses, classified error records, regime snapshots, and trial
//! evidence. These traits are the seams; [`JsonDirectorySource`] reads them
//! from a feed directory and [`InMemorySources`] holds them in memory.
//!
//! Feed directory layout:
//!
//! ```text
//! <root>/drafts/*.json                      HypothesisDraft
//! <root>/errors/<id>.json                   ErrorRecord
//! <root>/regimes/<id>.json                  RegimeSnapshot
//! <root>/returns/<code>.json                backtest returns, [f64]
//! <root>/evidence/<code>/t<N>_<class>.json  TrialEvidence
//! ```

use crate::economy::criteria::TrialEvidence;
use crate::economy::models::{
    ErrorRecord, Hypothesis, HypothesisCode, HypothesisDraft, RegimeSnapshot, Tier, TrialClass,
};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Source of newly originated hypothesis drafts.
pub trait OriginFeed: Send + Sync {
    fn pending_drafts(&self) -> Result<Vec<HypothesisDraft>>;

    /// Per-period backtest returns behind a draft, when the originator
    /// supplied them.
    fn backtest_returns(&self, _code: &HypothesisCode) -> Result<Option<Vec<f64>>> {
        Ok(None)
    }
}

/// Resolves provenance references. A lookup failure is reported as absent.
pub trait ProvenanceSource: Send + Sync {
    fn error_record(&self, id: &str) -> Option<ErrorRecord>;
    fn regime_snapshot(&self, id: &str) -> Option<RegimeSnapshot>;
}

/// Supplies evidence for a trial. `Ok(None)` means not yet available.
pub trait EvidenceSource: Send + Sync {
    fn evidence_for(
        &self,
        hypothesis: &Hypothesis,
        tier: Tier,
        trial_class: TrialClass,
    ) -> Result<Option<TrialEvidence>>;
}

// =============================================================================
// IN-MEMORY
// =============================================================================

#[derive(Default)]
pub struct InMemorySources {
    drafts: RwLock<Vec<HypothesisDraft>>,
    returns: RwLock<HashMap<String, Vec<f64>>>,
    errors: RwLock<HashMap<String, ErrorRecord>>,
    snapshots: RwLock<HashMap<String, RegimeSnapshot>>,
    evidence: RwLock<HashMap<(String, Tier, TrialClass), TrialEvidence>>,
}

impl InMemorySources {
    pub fn add_draft(&self, draft: HypothesisDraft) {
        self.drafts.write().push(draft);
    }

    pub fn add_returns(&self, code: &str, returns: Vec<f64>) {
        self.returns.write().insert(code.to_string(), returns);
    }

    pub fn add_error(&self, record: ErrorRecord) {
        self.errors.write().insert(record.id.clone(), record);
    }

    pub fn add_snapshot(&self, snapshot: RegimeSnapshot) {
        self.snapshots.write().insert(snapshot.id.clone(), snapshot);
    }

    /// Replaces any evidence already staged for the same trial.
    pub fn add_evidence(&self, code: &str, tier: Tier, trial_class: TrialClass, evidence: TrialEvidence) {
        self.evidence
            .write()
            .insert((code.to_string(), tier, trial_class), evidence);
    }
}

impl OriginFeed for InMemorySources {
    fn pending_drafts(&self) -> Result<Vec<HypothesisDraft>> {
        Ok(self.drafts.read().clone())
    }

    fn backtest_returns(&self, code: &HypothesisCode) -> Result<Option<Vec<f64>>> {
        Ok(self.returns.read().get(code.as_str()).cloned())
    }
}

impl ProvenanceSource for InMemorySources {
    fn error_record(&self, id: &str) -> Option<ErrorRecord> {
        self.errors.read().get(id).cloned()
    }

    fn regime_snapshot(&self, id: &str) -> Option<RegimeSnapshot> {
        self.snapshots.read().get(id).cloned()
    }
}

impl EvidenceSource for InMemorySources {
    fn evidence_for(
        &self,
        hypothesis: &Hypothesis,
        tier: Tier,
        trial_class: TrialClass,
    ) -> Result<Option<TrialEvidence>> {
        let key = (hypothesis.code.as_str().to_string(), tier, trial_class);
        Ok(self.evidence.read().get(&key).cloned())
    }
}

// =============================================================================
// JSON DIRECTORY
// =============================================================================

/// Reads collaborator payloads from a feed directory.
#[derive(Debug, Clone)]
pub struct JsonDirectorySource {
    root: PathBuf,
}

impl JsonDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn lookup<T: DeserializeOwned>(&self, dir: &str, id: &str) -> Option<T> {
        if !is_safe_component(id) {
            warn!(dir, id, "Rejected unsafe provenance reference");
            return None;
        }
        let path = self.root.join(dir).join(format!("{}.json", id));
        if !path.exists() {
            return None;
        }
        match read_json(&path) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable provenance record");
                None
            }
        }
    }
}

impl OriginFeed for JsonDirectorySource {
    fn pending_drafts(&self) -> Result<Vec<HypothesisDraft>> {
        let dir = self.root.join("drafts");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        paths.sort();

        let mut drafts = Vec::with_capacity(paths.len());
        for path in paths {
            drafts.push(read_json(&path)?);
        }
        Ok(drafts)
    }

    fn backtest_returns(&self, code: &HypothesisCode) -> Result<Option<Vec<f64>>> {
        let code = code.as_str();
        if !is_safe_component(code) {
            anyhow::bail!("hypothesis code '{}' is not a valid file name", code);
        }
        let path = self.root.join("returns").join(format!("{}.json", code));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }
}

impl ProvenanceSource for JsonDirectorySource {
    fn error_record(&self, id: &str) -> Option<ErrorRecord> {
        self.lookup("errors", id)
    }

    fn regime_snapshot(&self, id: &str) -> Option<RegimeSnapshot> {
        self.lookup("regimes", id)
    }
}

impl EvidenceSource for JsonDirectorySource {
    fn evidence_for(
        &self,
        hypothesis: &Hypothesis,
        tier: Tier,
        trial_class: TrialClass,
    ) -> Result<Option<TrialEvidence>> {
        let code = hypothesis.code.as_str();
        if !is_safe_component(code) {
            anyhow::bail!("hypothesis code '{}' is not a valid directory name", code);
        }
        let path = self
            .root
            .join("evidence")
            .join(code)
            .join(format!("t{}_{}.json", tier.number(), trial_class.as_str()));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.contains(|c: char| c == '/' || c == '\\' || c == '\0')
}
