//! Batch Workers
//!
//! Four independent, externally-triggered workers. Each `run_once` is one
//! idempotent batch: it claims a disjoint set of hypotheses through the
//! registry, processes them, and releases the claim. A failure on one
//! hypothesis is recorded in the run report and never stops the batch.
//!
//! - **Origination**: drafts new hypotheses from the origin feed, deflating
//!   the Sharpe estimate from backtest returns when the feed has them
//! - **Gate & lock**: runs the pre-validation gate, locks and activates
//! - **Experimentation**: reconciles, then runs pending trials at each
//!   hypothesis's current tier
//! - **Eligibility**: evaluates and persists eligibility reports

use crate::economy::eligibility::EligibilityChecker;
use crate::economy::error::EngineError;
use crate::economy::experimentation::{ExperimentationEngine, TrialRequest};
use crate::economy::models::{Hypothesis, HypothesisCode, HypothesisDraft, HypothesisState};
use crate::economy::registry::{Claim, HypothesisRegistry};
use crate::economy::sources::{EvidenceSource, OriginFeed, ProvenanceSource};
use crate::economy::stats::{self, TRADING_PERIODS_PER_YEAR};
use anyhow::Result;
use chrono::{Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum hypotheses claimed per run.
    pub batch_size: usize,
    pub claim_lease_secs: u64,
    /// Activate hypotheses as soon as they lock.
    pub auto_activate: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            claim_lease_secs: 300,
            auto_activate: true,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be positive".to_string());
        }
        if self.claim_lease_secs == 0 {
            return Err("claim_lease_secs must be positive".to_string());
        }
        Ok(())
    }

    fn lease(&self) -> Duration {
        Duration::seconds(self.claim_lease_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerKind {
    Origination,
    GateLock,
    Experimentation,
    Eligibility,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Origination => "origination",
            Self::GateLock => "gate-lock",
            Self::Experimentation => "experimentation",
            Self::Eligibility => "eligibility",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One hypothesis the run could not process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub code: HypothesisCode,
    pub reason: String,
    pub message: String,
    pub recoverable: bool,
}

impl WorkerFailure {
    fn from_engine(code: &HypothesisCode, e: &EngineError) -> Self {
        Self {
            code: code.clone(),
            reason: e.reason_code().to_string(),
            message: e.to_string(),
            recoverable: e.is_recoverable(),
        }
    }

    fn from_source(code: &HypothesisCode, e: &anyhow::Error) -> Self {
        Self {
            code: code.clone(),
            reason: "source_unavailable".to_string(),
            message: format!("{:#}", e),
            recoverable: true,
        }
    }
}

/// Hypothesis left untouched this run, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSkip {
    pub code: HypothesisCode,
    pub reason: String,
}

/// Summary of one worker run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRunReport {
    pub worker: WorkerKind,
    pub claimed: usize,
    pub processed: usize,
    pub skipped: Vec<WorkerSkip>,
    pub failures: Vec<WorkerFailure>,
}

impl WorkerRunReport {
    fn new(worker: WorkerKind) -> Self {
        Self {
            worker,
            claimed: 0,
            processed: 0,
            skipped: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn skip(&mut self, code: &HypothesisCode, reason: impl Into<String>) {
        self.skipped.push(WorkerSkip {
            code: code.clone(),
            reason: reason.into(),
        });
    }

    fn fail(&mut self, failure: WorkerFailure) {
        warn!(
            worker = %self.worker,
            code = %failure.code,
            reason = %failure.reason,
            "{}",
            failure.message
        );
        self.failures.push(failure);
    }

    fn log_summary(&self) {
        info!(
            worker = %self.worker,
            claimed = self.claimed,
            processed = self.processed,
            skipped = self.skipped.len(),
            failed = self.failures.len(),
            "Worker run complete"
        );
    }
}

/// A periodically-triggered batch worker.
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;
    fn run_once(&self) -> Result<WorkerRunReport>;
}

/// Runs `body` over a claim and always releases it.
fn with_claim<F>(
    registry: &HypothesisRegistry,
    states: &[HypothesisState],
    config: &WorkerConfig,
    report: &mut WorkerRunReport,
    body: F,
) -> Result<()>
where
    F: FnOnce(&Claim, &mut WorkerRunReport),
{
    let claim = registry.claim(states, config.batch_size, config.lease())?;
    report.claimed = claim.hypotheses.len();
    body(&claim, report);
    let released = registry.release(&claim)?;
    debug!(worker = %report.worker, token = %claim.token, released, "Claim released");
    Ok(())
}

// =============================================================================
// ORIGINATION
// =============================================================================

pub struct OriginationWorker {
    registry: Arc<HypothesisRegistry>,
    feed: Arc<dyn OriginFeed>,
    provenance: Arc<dyn ProvenanceSource>,
}

impl OriginationWorker {
    pub fn new(
        registry: Arc<HypothesisRegistry>,
        feed: Arc<dyn OriginFeed>,
        provenance: Arc<dyn ProvenanceSource>,
    ) -> Self {
        Self {
            registry,
            feed,
            provenance,
        }
    }

    /// Replaces the supplied deflated Sharpe with one computed from the
    /// draft's backtest returns, when the feed carries them.
    fn with_deflated_sharpe(&self, mut draft: HypothesisDraft) -> Result<HypothesisDraft, WorkerFailure> {
        let code = draft.code.clone();
        let returns = match self.feed.backtest_returns(&code) {
            Ok(Some(returns)) => returns,
            Ok(None) => return Ok(draft),
            Err(e) => return Err(WorkerFailure::from_source(&code, &e)),
        };

        let trials = draft.pre_validation.prior_hypotheses_count.saturating_add(1);
        let Some(deflated) = stats::deflated_sharpe(&returns, trials, TRADING_PERIODS_PER_YEAR) else {
            let e = EngineError::InvalidDraft(format!(
                "{}: backtest returns are degenerate ({} observations)",
                code,
                returns.len()
            ));
            return Err(WorkerFailure::from_engine(&code, &e));
        };

        debug!(
            code = %code,
            supplied = draft.pre_validation.deflated_sharpe_estimate,
            deflated = deflated.deflated_annualized,
            probability = deflated.probability,
            "Deflated Sharpe derived from backtest returns"
        );
        draft.pre_validation.deflated_sharpe_estimate = deflated.deflated_annualized;
        Ok(draft)
    }
}

impl Worker for OriginationWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Origination
    }

    fn run_once(&self) -> Result<WorkerRunReport> {
        let mut report = WorkerRunReport::new(self.kind());
        let drafts = self.feed.pending_drafts()?;
        report.claimed = drafts.len();

        for draft in drafts {
            let code = draft.code.clone();
            if self.registry.get(&code)?.is_some() {
                report.skip(&code, "already_exists");
                continue;
            }
            if draft.origin.is_error_driven() {
                let resolved = draft
                    .origin
                    .error_ref
                    .as_deref()
                    .and_then(|r| self.provenance.error_record(r));
                if resolved.is_none() {
                    report.fail(WorkerFailure::from_engine(
                        &code,
                        &EngineError::ProvenanceMissing {
                            code: code.clone(),
                            missing: "originating error record does not resolve".to_string(),
                        },
                    ));
                    continue;
                }
            }
            let draft = match self.with_deflated_sharpe(draft) {
                Ok(draft) => draft,
                Err(failure) => {
                    report.fail(failure);
                    continue;
                }
            };
            match self.registry.create(draft) {
                Ok(_) => report.processed += 1,
                Err(e) => report.fail(WorkerFailure::from_engine(&code, &e)),
            }
        }

        report.log_summary();
        Ok(report)
    }
}

// =============================================================================
// GATE & LOCK
// =============================================================================

pub struct GateLockWorker {
    registry: Arc<HypothesisRegistry>,
    config: WorkerConfig,
}

impl GateLockWorker {
    pub fn new(registry: Arc<HypothesisRegistry>, config: WorkerConfig) -> Self {
        Self { registry, config }
    }

    fn process(&self, hypothesis: &Hypothesis, report: &mut WorkerRunReport) {
        let code = &hypothesis.code;
        if hypothesis.state == HypothesisState::Draft {
            if let Err(e) = self.registry.lock(code) {
                report.fail(WorkerFailure::from_engine(code, &e));
                return;
            }
        } else if !self.config.auto_activate {
            report.skip(code, "awaiting_activation");
            return;
        }
        if self.config.auto_activate {
            if let Err(e) = self.registry.activate(code) {
                report.fail(WorkerFailure::from_engine(code, &e));
                return;
            }
        }
        report.processed += 1;
    }
}

impl Worker for GateLockWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::GateLock
    }

    fn run_once(&self) -> Result<WorkerRunReport> {
        let mut report = WorkerRunReport::new(self.kind());
        let states: &[HypothesisState] = if self.config.auto_activate {
            &[HypothesisState::Draft, HypothesisState::PreValidated]
        } else {
            &[HypothesisState::Draft]
        };
        with_claim(&self.registry, states, &self.config, &mut report, |claim, report| {
            for h in &claim.hypotheses {
                self.process(h, report);
            }
        })?;
        report.log_summary();
        Ok(report)
    }
}

// =============================================================================
// EXPERIMENTATION
// =============================================================================

pub struct ExperimentationWorker {
    registry: Arc<HypothesisRegistry>,
    engine: ExperimentationEngine,
    evidence: Arc<dyn EvidenceSource>,
    provenance: Arc<dyn ProvenanceSource>,
    config: WorkerConfig,
}

/// What happened to one claimed hypothesis.
enum Progress {
    Ran(usize),
    Skipped(&'static str),
}

impl ExperimentationWorker {
    pub fn new(
        registry: Arc<HypothesisRegistry>,
        evidence: Arc<dyn EvidenceSource>,
        provenance: Arc<dyn ProvenanceSource>,
        config: WorkerConfig,
    ) -> Self {
        let engine = ExperimentationEngine::new(registry.tiers().clone());
        Self {
            registry,
            engine,
            evidence,
            provenance,
            config,
        }
    }

    /// Runs every pending trial at the hypothesis's current tier for which
    /// fresh evidence is available. Stops as soon as the hypothesis leaves
    /// its tier or stops being testable.
    fn advance(&self, code: &HypothesisCode, report: &mut WorkerRunReport) -> Result<Progress, WorkerFailure> {
        let engine_err = |e: EngineError| WorkerFailure::from_engine(code, &e);

        let hypothesis = self.registry.require(code).map_err(engine_err)?;
        let Some(tier) = hypothesis.current_tier else {
            return Ok(Progress::Skipped("untiered"));
        };
        let (run, validated) = self.registry.trials_at_tier(code, tier).map_err(engine_err)?;
        let pending = self.engine.config().pending_trials(tier, &run, &validated);
        if pending.is_empty() {
            return Ok(Progress::Skipped("tier_complete"));
        }

        let mut ran = 0;
        for trial_class in pending {
            let current = self.registry.require(code).map_err(engine_err)?;
            if !current.state.is_testable() || current.current_tier != Some(tier) {
                break;
            }
            let evidence = match self.evidence.evidence_for(&current, tier, trial_class) {
                Ok(Some(evidence)) => evidence,
                Ok(None) => continue,
                Err(e) => return Err(WorkerFailure::from_source(code, &e)),
            };
            if !evidence.reuse_authorized
                && self
                    .registry
                    .dataset_used(code, &evidence.dataset_signature)
                    .map_err(engine_err)?
            {
                debug!(code = %code, trial_class = %trial_class, "Awaiting a fresh dataset");
                continue;
            }

            let request = TrialRequest {
                code: code.clone(),
                tier,
                trial_class,
                evidence,
            };
            match self.engine.run_trial(&self.registry, self.provenance.as_ref(), request) {
                Ok(_) => ran += 1,
                Err(e) => {
                    report.fail(WorkerFailure::from_engine(code, &e));
                    return Ok(Progress::Ran(ran));
                }
            }
        }

        if ran == 0 {
            Ok(Progress::Skipped("awaiting_evidence"))
        } else {
            Ok(Progress::Ran(ran))
        }
    }
}

impl Worker for ExperimentationWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Experimentation
    }

    fn run_once(&self) -> Result<WorkerRunReport> {
        let mut report = WorkerRunReport::new(self.kind());

        let reconciled = self.registry.reconcile()?;
        for (experiment_id, reason) in &reconciled.failed {
            warn!(experiment_id = %experiment_id, reason = %reason, "Experiment left unapplied");
        }

        with_claim(
            &self.registry,
            &[HypothesisState::Active, HypothesisState::Weakened],
            &self.config,
            &mut report,
            |claim, report| {
                for h in &claim.hypotheses {
                    match self.advance(&h.code, report) {
                        Ok(Progress::Ran(n)) if n > 0 => report.processed += 1,
                        Ok(Progress::Ran(_)) => {}
                        Ok(Progress::Skipped(reason)) => report.skip(&h.code, reason),
                        Err(failure) => report.fail(failure),
                    }
                }
            },
        )?;

        report.log_summary();
        Ok(report)
    }
}

// =============================================================================
// ELIGIBILITY
// =============================================================================

pub struct EligibilityWorker {
    registry: Arc<HypothesisRegistry>,
    checker: EligibilityChecker,
    config: WorkerConfig,
}

impl EligibilityWorker {
    pub fn new(registry: Arc<HypothesisRegistry>, checker: EligibilityChecker, config: WorkerConfig) -> Self {
        Self {
            registry,
            checker,
            config,
        }
    }
}

impl Worker for EligibilityWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Eligibility
    }

    fn run_once(&self) -> Result<WorkerRunReport> {
        let mut report = WorkerRunReport::new(self.kind());
        let now = Utc::now();

        with_claim(
            &self.registry,
            &[HypothesisState::Active, HypothesisState::Weakened],
            &self.config,
            &mut report,
            |claim, report| {
                let mut inputs = Vec::with_capacity(claim.hypotheses.len());
                for h in &claim.hypotheses {
                    match self.registry.experiment_summary(&h.code) {
                        Ok(summary) => inputs.push((h, summary)),
                        Err(e) => report.fail(WorkerFailure::from_engine(&h.code, &e)),
                    }
                }

                let reports: Vec<_> = inputs
                    .par_iter()
                    .map(|(h, summary)| self.checker.evaluate(h, summary, now))
                    .collect();

                for eligibility in reports {
                    if eligibility.eligible {
                        info!(code = %eligibility.code, "Hypothesis eligible for paper trading");
                    }
                    match self.registry.record_eligibility(&eligibility) {
                        Ok(()) => report.processed += 1,
                        Err(e) => report.fail(WorkerFailure::from_engine(&eligibility.code, &e)),
                    }
                }
            },
        )?;

        report.log_summary();
        Ok(report)
    }
}
