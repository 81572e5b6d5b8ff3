//! Hypothesis Registry
//!
//! SQLite-backed single source of truth for hypothesis records. Every other
//! component reads and writes hypotheses through this type.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE hypotheses (
//!     code TEXT PRIMARY KEY,
//!     state TEXT NOT NULL,
//!     current_tier INTEGER,
//!     current_confidence REAL,
//!     falsification_count INTEGER NOT NULL,
//!     eligible_for_paper INTEGER NOT NULL,
//!     pre_registered_at INTEGER,
//!     updated_at INTEGER NOT NULL,
//!     claim_token TEXT,           -- worker claim
//!     claimed_until INTEGER,      -- lease expiry (ms)
//!     hypothesis_json TEXT NOT NULL
//! ) WITHOUT ROWID;
//! ```
//!
//! `experiments` (append-only) and the guardrail ledger tables are owned by
//! their modules; `verdict_applications` records which experiments have had
//! their verdict applied, and `eligibility_reports` holds the latest
//! eligibility projection per hypothesis.
//!
//! # Atomicity
//!
//! Experiment creation, guardrail admission, confidence application and tier
//! advancement share one IMMEDIATE transaction. An experiment without an
//! application row can only come from an interrupted writer and is repaired
//! by [`HypothesisRegistry::reconcile`].

use crate::config::EngineConfig;
use crate::economy::confidence::ConfidenceEngine;
use crate::economy::eligibility::{EligibilityChecker, EligibilityReport};
use crate::economy::error::{EngineError, EngineResult};
use crate::economy::experimentation::{
    self, append_experiment, classes_at_tier, load_experiment, load_experiments, TierConfig,
    TrialOutcome, TrialRequest,
};
use crate::economy::guardrail::{self, Guardrail, GuardrailEntry};
use crate::economy::models::{
    Experiment, ExperimentSummary, Hypothesis, HypothesisAmendment, HypothesisCode,
    HypothesisDraft, HypothesisState, Tier, TrialClass, Verdict,
};
use crate::economy::pre_validation::{GateReport, PreValidationGate};
use crate::economy::sources::ProvenanceSource;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Schema version for migrations.
/// Version history:
/// - v1: Initial schema
const SCHEMA_VERSION: u32 = 1;

const REGISTRY_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS hypotheses (
        code TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        current_tier INTEGER,
        current_confidence REAL,
        falsification_count INTEGER NOT NULL,
        eligible_for_paper INTEGER NOT NULL,
        pre_registered_at INTEGER,
        updated_at INTEGER NOT NULL,
        claim_token TEXT,
        claimed_until INTEGER,
        hypothesis_json TEXT NOT NULL
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS idx_hypotheses_state ON hypotheses(state, updated_at);
    CREATE INDEX IF NOT EXISTS idx_hypotheses_claim ON hypotheses(claim_token);

    CREATE TABLE IF NOT EXISTS verdict_applications (
        experiment_id TEXT PRIMARY KEY,
        hypothesis_code TEXT NOT NULL,
        outcome TEXT NOT NULL,
        applied_at INTEGER NOT NULL,
        application_json TEXT NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS eligibility_reports (
        hypothesis_code TEXT PRIMARY KEY,
        eligible INTEGER NOT NULL,
        evaluated_at INTEGER NOT NULL,
        report_json TEXT NOT NULL
    ) WITHOUT ROWID;
"#;

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Result of `lock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOutcome {
    pub code: HypothesisCode,
    pub state: HypothesisState,
    pub pre_registration_timestamp: DateTime<Utc>,
    pub current_confidence: f64,
    /// False when the hypothesis was already locked.
    pub newly_locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationOutcome {
    Applied,
    /// The hypothesis was already terminal when reconciliation reached it.
    SkippedTerminal,
}

impl ApplicationOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::SkippedTerminal => "skipped_terminal",
        }
    }
}

/// Recorded application of one experiment's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedVerdict {
    pub experiment_id: String,
    pub code: HypothesisCode,
    pub verdict: Verdict,
    pub outcome: ApplicationOutcome,
    pub confidence_before: f64,
    pub confidence_after: f64,
    pub state_after: HypothesisState,
    pub falsification_count: u32,
    pub tier_after: Option<Tier>,
    pub eligible_for_paper: bool,
    pub confidence_ceiling: f64,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    /// Experiment id and reason for applications that failed.
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// Set of hypotheses claimed by one worker run.
#[derive(Debug, Clone)]
pub struct Claim {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub hypotheses: Vec<Hypothesis>,
}

impl Claim {
    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }
}

/// Observed falsification share per tier against its calibration target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDeathRate {
    pub tier: Tier,
    pub experiments: u32,
    pub falsified: u32,
    pub observed: f64,
    pub target: (f64, f64),
}

impl TierDeathRate {
    pub fn within_target(&self) -> bool {
        self.observed >= self.target.0 && self.observed <= self.target.1
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Storage and lifecycle state machine for hypotheses.
pub struct HypothesisRegistry {
    conn: Arc<Mutex<Connection>>,
    gate: PreValidationGate,
    guardrail: Guardrail,
    confidence: ConfidenceEngine,
    eligibility: EligibilityChecker,
    tiers: TierConfig,
}

impl HypothesisRegistry {
    /// Open (or create) a registry database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: &EngineConfig) -> EngineResult<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, config)
    }

    /// Create an in-memory registry (for testing).
    pub fn in_memory(config: &EngineConfig) -> EngineResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: &EngineConfig) -> EngineResult<Self> {
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
            gate: PreValidationGate::new(config.gate.clone()),
            guardrail: Guardrail::new(config.guardrail.clone()),
            confidence: ConfidenceEngine::new(config.confidence.clone()),
            eligibility: EligibilityChecker::new(config.eligibility.clone()),
            tiers: config.tiers.clone(),
        };
        registry.initialize_schema()?;
        Ok(registry)
    }

    fn initialize_schema(&self) -> EngineResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current_version {
            None => {
                conn.execute_batch(REGISTRY_SCHEMA)?;
                conn.execute_batch(experimentation::EXPERIMENT_SCHEMA)?;
                conn.execute_batch(guardrail::LEDGER_SCHEMA)?;
                conn.execute("INSERT INTO schema_version (version) VALUES (?)", [SCHEMA_VERSION])?;
                info!("Created hypothesis registry schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Hypothesis registry schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Hypothesis registry schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }
        Ok(())
    }

    pub fn gate(&self) -> &PreValidationGate {
        &self.gate
    }

    pub fn guardrail(&self) -> &Guardrail {
        &self.guardrail
    }

    pub fn tiers(&self) -> &TierConfig {
        &self.tiers
    }

    // ===== LIFECYCLE =====

    /// Store a new DRAFT with confidence unset.
    pub fn create(&self, draft: HypothesisDraft) -> EngineResult<Hypothesis> {
        let errors = draft.shape_errors();
        if !errors.is_empty() {
            return Err(EngineError::InvalidDraft(format!(
                "{}: {}",
                draft.code,
                errors.join("; ")
            )));
        }

        let conn = self.conn.lock();
        if read_hypothesis(&conn, &draft.code)?.is_some() {
            return Err(EngineError::AlreadyExists(draft.code.to_string()));
        }
        let hypothesis = Hypothesis::from_draft(draft, Utc::now());
        insert_hypothesis(&conn, &hypothesis)?;

        info!(
            code = %hypothesis.code,
            origin = ?hypothesis.origin.origin_type,
            "Hypothesis drafted"
        );
        Ok(hypothesis)
    }

    pub fn get(&self, code: &HypothesisCode) -> EngineResult<Option<Hypothesis>> {
        let conn = self.conn.lock();
        read_hypothesis(&conn, code)
    }

    pub fn require(&self, code: &HypothesisCode) -> EngineResult<Hypothesis> {
        let conn = self.conn.lock();
        require_hypothesis(&conn, code)
    }

    /// All hypotheses, optionally filtered by state, ordered by code.
    pub fn list(&self, state: Option<HypothesisState>) -> EngineResult<Vec<Hypothesis>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match state {
            Some(state) => {
                let mut stmt = conn.prepare(
                    "SELECT hypothesis_json FROM hypotheses WHERE state = ? ORDER BY code",
                )?;
                let rows = stmt.query_map([state.as_str()], |row| row.get::<_, String>(0))?;
                for json in rows {
                    out.push(serde_json::from_str(&json?)?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT hypothesis_json FROM hypotheses ORDER BY code")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                for json in rows {
                    out.push(serde_json::from_str(&json?)?);
                }
            }
        }
        Ok(out)
    }

    /// Edit a DRAFT. Touching any field of a locked hypothesis is an
    /// `ImmutabilityViolation`.
    pub fn amend(&self, code: &HypothesisCode, amendment: &HypothesisAmendment) -> EngineResult<Hypothesis> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = require_hypothesis(&tx, code)?;

        if before.is_locked() {
            if let Some(field) = amendment.touched_fields().first().copied() {
                error!(code = %code, field, "Attempted amendment of a locked hypothesis");
                return Err(EngineError::ImmutabilityViolation {
                    code: code.clone(),
                    field,
                });
            }
        }
        if amendment.is_empty() {
            return Ok(before);
        }
        if before.state != HypothesisState::Draft {
            return Err(EngineError::InvalidStateTransition {
                code: code.clone(),
                from: before.state,
                attempted: "amend",
            });
        }

        let mut after = before.clone();
        amendment.apply_to(&mut after);
        let errors = draft_of(&after).shape_errors();
        if !errors.is_empty() {
            return Err(EngineError::InvalidDraft(format!("{}: {}", code, errors.join("; "))));
        }
        after.updated_at = Utc::now();
        update_hypothesis(&tx, &before, &after)?;
        tx.commit()?;

        debug!(code = %code, fields = ?amendment.touched_fields(), "Draft amended");
        Ok(after)
    }

    /// Gate evaluation without side effects.
    pub fn evaluate_gate(&self, code: &HypothesisCode) -> EngineResult<GateReport> {
        let hypothesis = self.require(code)?;
        Ok(self.gate.evaluate(&hypothesis))
    }

    /// DRAFT → PRE_VALIDATED if the gate passes, stamping the
    /// pre-registration timestamp. Locking an already-locked hypothesis
    /// returns the existing result.
    pub fn lock(&self, code: &HypothesisCode) -> EngineResult<LockOutcome> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = require_hypothesis(&tx, code)?;

        if let Some(stamped) = before.pre_registration_timestamp {
            debug!(code = %code, "Lock requested on already-locked hypothesis");
            return Ok(LockOutcome {
                code: before.code.clone(),
                state: before.state,
                pre_registration_timestamp: stamped,
                current_confidence: before.confidence(),
                newly_locked: false,
            });
        }
        if before.state != HypothesisState::Draft {
            return Err(EngineError::InvalidStateTransition {
                code: code.clone(),
                from: before.state,
                attempted: "lock",
            });
        }

        let report = self.gate.evaluate(&before);
        if !report.passed {
            warn!(
                code = %code,
                failures = ?report.failure_codes(),
                "Pre-validation gate rejected hypothesis"
            );
            return Err(EngineError::ValidationFailure {
                code: code.clone(),
                failures: report.failures,
            });
        }

        let mut after = before.clone();
        after.pre_validation_passed = true;
        after.pre_registration_timestamp = Some(now);
        after.current_confidence = Some(before.initial_confidence);
        after.state = HypothesisState::PreValidated;
        after.updated_at = now;
        update_hypothesis(&tx, &before, &after)?;
        tx.commit()?;

        info!(code = %code, confidence = before.initial_confidence, "Hypothesis pre-registered");
        Ok(LockOutcome {
            code: after.code,
            state: after.state,
            pre_registration_timestamp: now,
            current_confidence: before.initial_confidence,
            newly_locked: true,
        })
    }

    /// PRE_VALIDATED → ACTIVE at Tier 1. No-op on an ACTIVE hypothesis.
    pub fn activate(&self, code: &HypothesisCode) -> EngineResult<Hypothesis> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = require_hypothesis(&tx, code)?;

        match before.state {
            HypothesisState::Active => Ok(before),
            HypothesisState::PreValidated => {
                let mut after = before.clone();
                after.state = HypothesisState::Active;
                after.current_tier = Some(Tier::One);
                after.updated_at = Utc::now();
                update_hypothesis(&tx, &before, &after)?;
                tx.commit()?;
                info!(code = %code, tier = %Tier::One, "Hypothesis activated");
                Ok(after)
            }
            from => Err(EngineError::InvalidStateTransition {
                code: code.clone(),
                from,
                attempted: "activate",
            }),
        }
    }

    /// Any non-terminal state → RETIRED. No-op on a RETIRED hypothesis.
    pub fn retire(&self, code: &HypothesisCode) -> EngineResult<Hypothesis> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let before = require_hypothesis(&tx, code)?;

        match before.state {
            HypothesisState::Retired => Ok(before),
            HypothesisState::Falsified => Err(EngineError::InvalidStateTransition {
                code: code.clone(),
                from: before.state,
                attempted: "retire",
            }),
            _ => {
                let mut after = before.clone();
                after.state = HypothesisState::Retired;
                after.updated_at = Utc::now();
                update_hypothesis(&tx, &before, &after)?;
                self.refresh_eligibility(&tx, &after)?;
                tx.commit()?;
                info!(code = %code, from = %before.state, "Hypothesis retired");
                Ok(after)
            }
        }
    }

    // ===== EXPERIMENTS =====

    /// Records one experiment and applies its verdict in a single
    /// transaction: state re-check, provenance, guardrail admission,
    /// evaluation, append, confidence application, tier advancement.
    pub fn commit_experiment<F>(
        &self,
        provenance: &dyn ProvenanceSource,
        request: &TrialRequest,
        evaluate: F,
    ) -> EngineResult<AppliedVerdict>
    where
        F: FnOnce(&Hypothesis) -> EngineResult<TrialOutcome>,
    {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let hypothesis = require_hypothesis(&tx, &request.code)?;

        if !hypothesis.state.is_testable() {
            error!(
                code = %hypothesis.code,
                state = %hypothesis.state,
                "Experiment requested for a hypothesis that is not testable"
            );
            return Err(EngineError::InvalidStateTransition {
                code: hypothesis.code.clone(),
                from: hypothesis.state,
                attempted: "create experiment",
            });
        }
        if !request.trial_class.permitted_at(request.tier) {
            error!(
                code = %hypothesis.code,
                tier = %request.tier,
                trial_class = %request.trial_class,
                "Trial class not permitted at tier"
            );
            return Err(EngineError::TrialNotPermitted {
                tier: request.tier,
                trial_class: request.trial_class,
            });
        }
        if hypothesis.current_tier != Some(request.tier) {
            error!(
                code = %hypothesis.code,
                current = ?hypothesis.current_tier,
                requested = %request.tier,
                "Experiment targets the wrong tier"
            );
            return Err(EngineError::TierMismatch {
                code: hypothesis.code.clone(),
                current: hypothesis.current_tier,
                requested: request.tier,
            });
        }

        let evidence = &request.evidence;
        self.guardrail.check_provenance(&hypothesis, evidence, provenance)?;
        let admission = self.guardrail.admit(
            &tx,
            &hypothesis.code,
            &evidence.dataset_signature,
            evidence.reuse_authorized,
            now,
        )?;

        let outcome = evaluate(&hypothesis)?;
        let experiment = Experiment {
            id: Uuid::new_v4().to_string(),
            hypothesis_code: hypothesis.code.clone(),
            tier: request.tier,
            trial_class: request.trial_class,
            dataset_signature: evidence.dataset_signature.clone(),
            regime_snapshot_ref: evidence.regime_snapshot_ref.clone(),
            error_ref: evidence.error_ref.clone(),
            reuse_authorized: evidence.reuse_authorized,
            criteria: outcome.criteria,
            advisory_score: outcome.advisory_score,
            verdict: outcome.verdict,
            created_at: now,
        };
        append_experiment(&tx, &experiment)?;

        let applied = self.apply_in_tx(&tx, hypothesis, &experiment, admission.confidence_ceiling, now)?;
        tx.commit()?;
        Ok(applied)
    }

    /// Applies a recorded experiment's verdict. Idempotent: an experiment
    /// that already has an application returns the recorded result.
    pub fn apply_verdict(&self, experiment_id: &str) -> EngineResult<AppliedVerdict> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = load_application(&tx, experiment_id)? {
            debug!(experiment_id, "Verdict already applied");
            return Ok(existing);
        }
        let experiment = load_experiment(&tx, experiment_id)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "Experiment",
                id: experiment_id.to_string(),
            })?;
        let hypothesis = require_hypothesis(&tx, &experiment.hypothesis_code)?;
        let dof = guardrail::degrees_of_freedom(&tx, &hypothesis.code)?;
        let ceiling = self.guardrail.confidence_ceiling(dof);

        let applied = self.apply_in_tx(&tx, hypothesis, &experiment, ceiling, now)?;
        tx.commit()?;
        Ok(applied)
    }

    /// Applies every experiment lacking an application. Experiments whose
    /// hypothesis is no longer testable are recorded as skipped.
    pub fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let pending: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                r#"SELECT e.id FROM experiments e
                   LEFT JOIN verdict_applications a ON a.experiment_id = e.id
                   WHERE a.experiment_id IS NULL
                   ORDER BY e.rowid"#,
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let ids = rows.collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut report = ReconcileReport::default();
        for id in pending {
            match self.reconcile_one(&id) {
                Ok(applied) if applied.outcome == ApplicationOutcome::Applied => report.applied.push(id),
                Ok(_) => report.skipped.push(id),
                Err(e) => {
                    warn!(experiment_id = %id, error = %e, "Reconciliation failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.is_empty() {
            info!(
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "Reconciled unapplied experiments"
            );
        }
        Ok(report)
    }

    fn reconcile_one(&self, experiment_id: &str) -> EngineResult<AppliedVerdict> {
        let now = Utc::now();
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = load_application(&tx, experiment_id)? {
            return Ok(existing);
        }
        let experiment = load_experiment(&tx, experiment_id)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "Experiment",
                id: experiment_id.to_string(),
            })?;
        let hypothesis = require_hypothesis(&tx, &experiment.hypothesis_code)?;
        let dof = guardrail::degrees_of_freedom(&tx, &hypothesis.code)?;
        let ceiling = self.guardrail.confidence_ceiling(dof);

        let applied = if hypothesis.state.is_testable() {
            self.apply_in_tx(&tx, hypothesis, &experiment, ceiling, now)?
        } else {
            let skipped = AppliedVerdict {
                experiment_id: experiment.id.clone(),
                code: hypothesis.code.clone(),
                verdict: experiment.verdict,
                outcome: ApplicationOutcome::SkippedTerminal,
                confidence_before: hypothesis.confidence(),
                confidence_after: hypothesis.confidence(),
                state_after: hypothesis.state,
                falsification_count: hypothesis.falsification_count,
                tier_after: hypothesis.current_tier,
                eligible_for_paper: hypothesis.eligible_for_paper,
                confidence_ceiling: ceiling,
            };
            record_application(&tx, &skipped, now)?;
            skipped
        };
        tx.commit()?;
        Ok(applied)
    }

    fn apply_in_tx(
        &self,
        conn: &Connection,
        before: Hypothesis,
        experiment: &Experiment,
        ceiling: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<AppliedVerdict> {
        let update = self.confidence.apply(&before, experiment.verdict, ceiling).map_err(|e| {
            error!(
                code = %before.code,
                experiment_id = %experiment.id,
                state = %before.state,
                "Verdict applied to a hypothesis that is not testable"
            );
            e
        })?;

        let mut after = before.clone();
        after.current_confidence = Some(update.confidence);
        after.state = update.state;
        after.falsification_count = update.falsification_count;
        after.updated_at = now;

        if before.current_tier == Some(experiment.tier) {
            let (_, validated) = classes_at_tier(conn, &before.code, experiment.tier)?;
            let advance = self.tiers.advance(
                experiment.tier,
                experiment.trial_class,
                experiment.verdict,
                update.state,
                &validated,
            );
            if advance.tier != experiment.tier {
                info!(code = %before.code, from = %experiment.tier, to = %advance.tier, "Tier advanced");
            }
            if advance.eligible_for_paper && !before.eligible_for_paper {
                info!(code = %before.code, "Promotion review validated, eligible for paper");
            }
            after.current_tier = Some(advance.tier);
            after.eligible_for_paper = before.eligible_for_paper || advance.eligible_for_paper;
        }

        update_hypothesis(conn, &before, &after)?;
        if after.state != before.state {
            self.refresh_eligibility(conn, &after)?;
        }

        let applied = AppliedVerdict {
            experiment_id: experiment.id.clone(),
            code: after.code.clone(),
            verdict: experiment.verdict,
            outcome: ApplicationOutcome::Applied,
            confidence_before: before.confidence(),
            confidence_after: update.confidence,
            state_after: update.state,
            falsification_count: update.falsification_count,
            tier_after: after.current_tier,
            eligible_for_paper: after.eligible_for_paper,
            confidence_ceiling: ceiling,
        };
        record_application(conn, &applied, now)?;

        if update.state == HypothesisState::Falsified {
            info!(
                code = %after.code,
                experiment_id = %experiment.id,
                falsification_count = update.falsification_count,
                "Hypothesis falsified"
            );
        }
        Ok(applied)
    }

    /// Re-evaluates the eligibility projection after a state change, so a
    /// hypothesis leaving ACTIVE never keeps a stale eligible report.
    fn refresh_eligibility(&self, conn: &Connection, hypothesis: &Hypothesis) -> EngineResult<()> {
        let summary = summarize_experiments(conn, &hypothesis.code)?;
        let report = self.eligibility.evaluate(hypothesis, &summary, hypothesis.updated_at);
        upsert_eligibility(conn, &report)?;
        debug!(
            code = %hypothesis.code,
            state = %hypothesis.state,
            eligible = report.eligible,
            "Eligibility projection refreshed"
        );
        Ok(())
    }

    pub fn experiment(&self, id: &str) -> EngineResult<Option<Experiment>> {
        let conn = self.conn.lock();
        load_experiment(&conn, id)
    }

    /// Experiments of a hypothesis in the order they were recorded.
    pub fn experiments(&self, code: &HypothesisCode) -> EngineResult<Vec<Experiment>> {
        let conn = self.conn.lock();
        load_experiments(&conn, code)
    }

    pub fn experiment_summary(&self, code: &HypothesisCode) -> EngineResult<ExperimentSummary> {
        let conn = self.conn.lock();
        summarize_experiments(&conn, code)
    }

    /// Trial classes run, and validated, at `tier`.
    pub fn trials_at_tier(
        &self,
        code: &HypothesisCode,
        tier: Tier,
    ) -> EngineResult<(HashSet<TrialClass>, HashSet<TrialClass>)> {
        let conn = self.conn.lock();
        classes_at_tier(&conn, code, tier)
    }

    pub fn dataset_used(&self, code: &HypothesisCode, dataset_signature: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        Ok(guardrail::dataset_uses(&conn, code, dataset_signature)? > 0)
    }

    pub fn guardrail_entry(&self, code: &HypothesisCode) -> EngineResult<GuardrailEntry> {
        let conn = self.conn.lock();
        self.guardrail.entry(&conn, code)
    }

    pub fn application(&self, experiment_id: &str) -> EngineResult<Option<AppliedVerdict>> {
        let conn = self.conn.lock();
        load_application(&conn, experiment_id)
    }

    /// Observed falsification share per tier.
    pub fn death_rates(&self) -> EngineResult<Vec<TierDeathRate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT tier, COUNT(*), SUM(CASE WHEN verdict = 'FALSIFIED' THEN 1 ELSE 0 END)
               FROM experiments GROUP BY tier ORDER BY tier"#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, u8>(0)?, row.get::<_, u32>(1)?, row.get::<_, u32>(2)?))
        })?;
        let mut rates = Vec::new();
        for row in rows {
            let (tier, experiments, falsified) = row?;
            let Some(tier) = Tier::from_number(tier) else {
                continue;
            };
            rates.push(TierDeathRate {
                tier,
                experiments,
                falsified,
                observed: if experiments == 0 {
                    0.0
                } else {
                    falsified as f64 / experiments as f64
                },
                target: tier.target_death_rate(),
            });
        }
        Ok(rates)
    }

    // ===== CLAIMS =====

    /// Atomically claims up to `limit` unclaimed hypotheses in `states` for
    /// `lease`. Expired claims are reclaimable.
    pub fn claim(&self, states: &[HypothesisState], limit: usize, lease: Duration) -> EngineResult<Claim> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + lease;
        if states.is_empty() || limit == 0 {
            return Ok(Claim {
                token,
                expires_at,
                hypotheses: Vec::new(),
            });
        }

        // States are rendered from a closed enum, never from input.
        let state_list = states
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"UPDATE hypotheses SET claim_token = ?1, claimed_until = ?2
               WHERE code IN (
                   SELECT code FROM hypotheses
                   WHERE state IN ({})
                     AND (claimed_until IS NULL OR claimed_until < ?3)
                   ORDER BY updated_at, code
                   LIMIT ?4
               )"#,
            state_list
        );

        let conn = self.conn.lock();
        let claimed = conn.execute(
            &sql,
            params![
                token,
                expires_at.timestamp_millis(),
                now.timestamp_millis(),
                limit as i64
            ],
        )?;

        let mut hypotheses = Vec::with_capacity(claimed);
        let mut stmt = conn.prepare(
            "SELECT hypothesis_json FROM hypotheses WHERE claim_token = ? ORDER BY updated_at, code",
        )?;
        let rows = stmt.query_map([&token], |row| row.get::<_, String>(0))?;
        for json in rows {
            hypotheses.push(serde_json::from_str(&json?)?);
        }

        debug!(token = %token, claimed, "Claimed hypotheses");
        Ok(Claim {
            token,
            expires_at,
            hypotheses,
        })
    }

    /// Releases every hypothesis held by `claim`.
    pub fn release(&self, claim: &Claim) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let released = conn.execute(
            "UPDATE hypotheses SET claim_token = NULL, claimed_until = NULL WHERE claim_token = ?",
            [&claim.token],
        )?;
        Ok(released)
    }

    // ===== ELIGIBILITY PROJECTION =====

    pub fn record_eligibility(&self, report: &EligibilityReport) -> EngineResult<()> {
        let conn = self.conn.lock();
        upsert_eligibility(&conn, report)
    }

    pub fn latest_eligibility(&self, code: &HypothesisCode) -> EngineResult<Option<EligibilityReport>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT report_json FROM eligibility_reports WHERE hypothesis_code = ?",
                [code.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// ROW HELPERS
// =============================================================================

fn read_hypothesis(conn: &Connection, code: &HypothesisCode) -> EngineResult<Option<Hypothesis>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT hypothesis_json FROM hypotheses WHERE code = ?",
            [code.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn require_hypothesis(conn: &Connection, code: &HypothesisCode) -> EngineResult<Hypothesis> {
    read_hypothesis(conn, code)?.ok_or_else(|| EngineError::NotFound {
        kind: "Hypothesis",
        id: code.to_string(),
    })
}

fn insert_hypothesis(conn: &Connection, h: &Hypothesis) -> EngineResult<()> {
    let json = serde_json::to_string(h)?;
    conn.execute(
        r#"INSERT INTO hypotheses (
            code, state, current_tier, current_confidence, falsification_count,
            eligible_for_paper, pre_registered_at, updated_at, hypothesis_json
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        params![
            h.code.as_str(),
            h.state.as_str(),
            h.current_tier.map(|t| t.number()),
            h.current_confidence,
            h.falsification_count,
            h.eligible_for_paper as i32,
            h.pre_registration_timestamp.map(|t| t.timestamp_millis()),
            h.updated_at.timestamp_millis(),
            json,
        ],
    )?;
    Ok(())
}

/// Writes `after` over `before`, refusing to change any field frozen by
/// pre-registration. Claim columns are left untouched.
fn update_hypothesis(conn: &Connection, before: &Hypothesis, after: &Hypothesis) -> EngineResult<()> {
    if let Some(field) = frozen_field_changed(before, after) {
        error!(code = %before.code, field, "Write would change a locked field");
        return Err(EngineError::ImmutabilityViolation {
            code: before.code.clone(),
            field,
        });
    }
    let json = serde_json::to_string(after)?;
    conn.execute(
        r#"UPDATE hypotheses SET
            state = ?2, current_tier = ?3, current_confidence = ?4, falsification_count = ?5,
            eligible_for_paper = ?6, pre_registered_at = ?7, updated_at = ?8, hypothesis_json = ?9
           WHERE code = ?1"#,
        params![
            after.code.as_str(),
            after.state.as_str(),
            after.current_tier.map(|t| t.number()),
            after.current_confidence,
            after.falsification_count,
            after.eligible_for_paper as i32,
            after.pre_registration_timestamp.map(|t| t.timestamp_millis()),
            after.updated_at.timestamp_millis(),
            json,
        ],
    )?;
    Ok(())
}

/// First frozen field that differs between `before` and `after`, if
/// `before` is locked.
fn frozen_field_changed(before: &Hypothesis, after: &Hypothesis) -> Option<&'static str> {
    if !before.is_locked() {
        return None;
    }
    let checks = [
        ("rationale", before.content.rationale != after.content.rationale),
        ("causal_mechanism", before.content.causal_mechanism != after.content.causal_mechanism),
        ("behavioral_basis", before.content.behavioral_basis != after.content.behavioral_basis),
        (
            "counterfactual_scenario",
            before.content.counterfactual_scenario != after.content.counterfactual_scenario,
        ),
        ("claim", before.claim != after.claim),
        ("regime_scope", before.regime_scope != after.regime_scope),
        ("falsification_criteria", before.falsification_criteria != after.falsification_criteria),
        ("confidence_decay_rate", before.confidence_decay_rate != after.confidence_decay_rate),
        ("max_falsifications", before.max_falsifications != after.max_falsifications),
        ("pre_validation", before.pre_validation != after.pre_validation),
        ("initial_confidence", before.initial_confidence != after.initial_confidence),
        (
            "pre_registration_timestamp",
            before.pre_registration_timestamp != after.pre_registration_timestamp,
        ),
        ("origin", before.origin != after.origin),
    ];
    checks.iter().find(|(_, changed)| *changed).map(|(field, _)| *field)
}

fn draft_of(h: &Hypothesis) -> HypothesisDraft {
    HypothesisDraft {
        code: h.code.clone(),
        content: h.content.clone(),
        claim: h.claim.clone(),
        regime_scope: h.regime_scope.clone(),
        falsification_criteria: h.falsification_criteria.clone(),
        confidence_decay_rate: h.confidence_decay_rate,
        max_falsifications: h.max_falsifications,
        pre_validation: h.pre_validation.clone(),
        initial_confidence: h.initial_confidence,
        origin: h.origin.clone(),
    }
}

fn summarize_experiments(conn: &Connection, code: &HypothesisCode) -> EngineResult<ExperimentSummary> {
    let mut stmt = conn.prepare("SELECT verdict FROM experiments WHERE hypothesis_code = ?")?;
    let rows = stmt.query_map([code.as_str()], |row| row.get::<_, String>(0))?;
    let mut summary = ExperimentSummary::default();
    for verdict in rows {
        if let Some(v) = Verdict::parse(&verdict?) {
            summary.record(v);
        }
    }
    Ok(summary)
}

fn upsert_eligibility(conn: &Connection, report: &EligibilityReport) -> EngineResult<()> {
    let json = serde_json::to_string(report)?;
    conn.execute(
        r#"INSERT INTO eligibility_reports (hypothesis_code, eligible, evaluated_at, report_json)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT(hypothesis_code) DO UPDATE SET
               eligible = excluded.eligible,
               evaluated_at = excluded.evaluated_at,
               report_json = excluded.report_json"#,
        params![
            report.code.as_str(),
            report.eligible as i32,
            report.evaluated_at.timestamp_millis(),
            json
        ],
    )?;
    Ok(())
}

fn record_application(conn: &Connection, applied: &AppliedVerdict, now: DateTime<Utc>) -> EngineResult<()> {
    let json = serde_json::to_string(applied)?;
    conn.execute(
        r#"INSERT INTO verdict_applications (experiment_id, hypothesis_code, outcome, applied_at, application_json)
           VALUES (?, ?, ?, ?, ?)"#,
        params![
            applied.experiment_id,
            applied.code.as_str(),
            applied.outcome.as_str(),
            now.timestamp_millis(),
            json,
        ],
    )?;
    Ok(())
}

fn load_application(conn: &Connection, experiment_id: &str) -> EngineResult<Option<AppliedVerdict>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT application_json FROM verdict_applications WHERE experiment_id = ?",
            [experiment_id],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}
