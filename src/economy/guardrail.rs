//! Epistemic Guardrails
//!
//! Admission checks every experiment passes before it is recorded:
//!
//! 1. **Provenance**: the regime snapshot must resolve, and an ERROR_DRIVEN
//!    hypothesis must cite its own originating error record, which must
//!    resolve. Missing provenance is rejected, never defaulted.
//! 2. **Dataset reuse**: a hypothesis may consume a dataset signature once
//!    unless reuse is explicitly authorized.
//! 3. **Degrees of freedom**: every admitted experiment counts against the
//!    hypothesis. The count lowers a ceiling on attainable confidence.
//!
//! Ledger updates run inside the caller's transaction so a rejected or
//! rolled-back experiment leaves no trace.

use crate::economy::error::{EngineError, EngineResult};
use crate::economy::models::{Hypothesis, HypothesisCode};
use crate::economy::criteria::TrialEvidence;
use crate::economy::sources::ProvenanceSource;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Degrees-of-freedom ceiling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Confidence ceiling lost per experiment beyond the first.
    pub dof_penalty: f64,
    /// Lowest the ceiling may fall.
    pub ceiling_floor: f64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            dof_penalty: 0.02,
            ceiling_floor: 0.5,
        }
    }
}

impl GuardrailConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.dof_penalty >= 0.0 && self.dof_penalty < 1.0) {
            return Err(format!("dof_penalty {} outside [0,1)", self.dof_penalty));
        }
        if !(0.0..=1.0).contains(&self.ceiling_floor) {
            return Err(format!("ceiling_floor {} outside [0,1]", self.ceiling_floor));
        }
        Ok(())
    }
}

/// Ledger state after an experiment has been admitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub degrees_of_freedom: u32,
    /// Times this hypothesis has now used the dataset, including this one.
    pub dataset_usage: u32,
    pub confidence_ceiling: f64,
}

/// Guardrail ledger view for one hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailEntry {
    pub code: HypothesisCode,
    pub degrees_of_freedom: u32,
    pub confidence_ceiling: f64,
    pub datasets: Vec<DatasetUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetUsage {
    pub dataset_signature: String,
    pub uses: u32,
    pub last_used_at: DateTime<Utc>,
}

pub(crate) const LEDGER_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS guardrail_dataset_usage (
        dataset_signature TEXT NOT NULL,
        hypothesis_code TEXT NOT NULL,
        uses INTEGER NOT NULL,
        last_used_at INTEGER NOT NULL,
        PRIMARY KEY (dataset_signature, hypothesis_code)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS guardrail_dof (
        hypothesis_code TEXT PRIMARY KEY,
        degrees_of_freedom INTEGER NOT NULL
    ) WITHOUT ROWID;
"#;

/// The guardrail.
#[derive(Debug, Clone, Default)]
pub struct Guardrail {
    config: GuardrailConfig,
}

impl Guardrail {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }

    /// Maximum attainable confidence after `dof` experiments.
    pub fn confidence_ceiling(&self, dof: u32) -> f64 {
        let extra = dof.saturating_sub(1) as f64;
        (1.0 - self.config.dof_penalty * extra).max(self.config.ceiling_floor)
    }

    /// Fails closed unless every provenance reference resolves.
    pub fn check_provenance(
        &self,
        hypothesis: &Hypothesis,
        evidence: &TrialEvidence,
        source: &dyn ProvenanceSource,
    ) -> EngineResult<()> {
        let missing = |what: String| {
            warn!(code = %hypothesis.code, missing = %what, "Provenance check failed");
            Err(EngineError::ProvenanceMissing {
                code: hypothesis.code.clone(),
                missing: what,
            })
        };

        let snapshot = evidence.regime_snapshot_ref.trim();
        if snapshot.is_empty() {
            return missing("regime snapshot reference".to_string());
        }
        if source.regime_snapshot(snapshot).is_none() {
            return missing(format!("regime snapshot '{}' does not resolve", snapshot));
        }

        if hypothesis.origin.is_error_driven() {
            let Some(expected) = hypothesis.origin.error_ref.as_deref() else {
                return missing("originating error reference on hypothesis".to_string());
            };
            match evidence.error_ref.as_deref().map(str::trim) {
                None | Some("") => return missing("error reference".to_string()),
                Some(cited) if cited != expected => {
                    return missing(format!(
                        "error reference '{}' is not the originating error '{}'",
                        cited, expected
                    ))
                }
                Some(cited) => {
                    if source.error_record(cited).is_none() {
                        return missing(format!("error record '{}' does not resolve", cited));
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies the reuse check and bumps the ledger counters.
    pub(crate) fn admit(
        &self,
        conn: &Connection,
        code: &HypothesisCode,
        dataset_signature: &str,
        reuse_authorized: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<Admission> {
        let prior = dataset_uses(conn, code, dataset_signature)?;
        if prior > 0 && !reuse_authorized {
            warn!(
                code = %code,
                dataset = %dataset_signature,
                prior_uses = prior,
                "Dataset reuse rejected"
            );
            return Err(EngineError::DatasetReuseViolation {
                code: code.clone(),
                dataset_signature: dataset_signature.to_string(),
            });
        }

        conn.execute(
            r#"INSERT INTO guardrail_dataset_usage (dataset_signature, hypothesis_code, uses, last_used_at)
               VALUES (?1, ?2, 1, ?3)
               ON CONFLICT(dataset_signature, hypothesis_code)
               DO UPDATE SET uses = uses + 1, last_used_at = excluded.last_used_at"#,
            params![dataset_signature, code.as_str(), now.timestamp_millis()],
        )?;
        conn.execute(
            r#"INSERT INTO guardrail_dof (hypothesis_code, degrees_of_freedom) VALUES (?1, 1)
               ON CONFLICT(hypothesis_code) DO UPDATE SET degrees_of_freedom = degrees_of_freedom + 1"#,
            [code.as_str()],
        )?;

        let dof = degrees_of_freedom(conn, code)?;
        Ok(Admission {
            degrees_of_freedom: dof,
            dataset_usage: prior + 1,
            confidence_ceiling: self.confidence_ceiling(dof),
        })
    }

    pub(crate) fn entry(&self, conn: &Connection, code: &HypothesisCode) -> EngineResult<GuardrailEntry> {
        let dof = degrees_of_freedom(conn, code)?;
        let mut stmt = conn.prepare(
            r#"SELECT dataset_signature, uses, last_used_at FROM guardrail_dataset_usage
               WHERE hypothesis_code = ? ORDER BY last_used_at, dataset_signature"#,
        )?;
        let rows = stmt.query_map([code.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut datasets = Vec::new();
        for row in rows {
            let (dataset_signature, uses, millis) = row?;
            datasets.push(DatasetUsage {
                dataset_signature,
                uses,
                last_used_at: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
            });
        }
        Ok(GuardrailEntry {
            code: code.clone(),
            degrees_of_freedom: dof,
            confidence_ceiling: self.confidence_ceiling(dof),
            datasets,
        })
    }
}

pub(crate) fn dataset_uses(conn: &Connection, code: &HypothesisCode, dataset_signature: &str) -> EngineResult<u32> {
    let uses: Option<u32> = conn
        .query_row(
            "SELECT uses FROM guardrail_dataset_usage WHERE dataset_signature = ? AND hypothesis_code = ?",
            params![dataset_signature, code.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(uses.unwrap_or(0))
}

pub(crate) fn degrees_of_freedom(conn: &Connection, code: &HypothesisCode) -> EngineResult<u32> {
    let dof: Option<u32> = conn
        .query_row(
            "SELECT degrees_of_freedom FROM guardrail_dof WHERE hypothesis_code = ?",
            [code.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(dof.unwrap_or(0))
}
