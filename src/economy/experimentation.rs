//! Tiered Experimentation
//!
//! Runs trials of increasing rigor against ACTIVE and WEAKENED hypotheses
//! and produces immutable [`Experiment`] records.
//!
//! # Tiers
//!
//! | Tier | Trial classes | Verdict rule |
//! |---|---|---|
//! | T1 | falsification sweep | binary AND of six criteria, any miss falsifies |
//! | T2 | walk-forward, sensitivity, antithesis | fold / perturbation pass share |
//! | T3 | promotion review, antithesis | binary AND at stricter thresholds |
//!
//! Antithesis classes (mechanism inversion, regime-boundary stress,
//! tail-condition stress) try to break the hypothesis rather than confirm it,
//! and are never permitted at T1.
//!
//! A validated sweep moves a hypothesis to T2. It reaches T3 once every
//! required T2 class has a validated experiment while the hypothesis is
//! ACTIVE. A validated promotion review marks it eligible for paper trading;
//! T3 antithesis runs on fresh datasets carry the experiment count toward
//! the eligibility floor.
//!
//! The experiment log is append-only: triggers reject UPDATE and DELETE.

use crate::economy::criteria::{
    self, all_passed, advisory_score, CriteriaThresholds, TrialEvidence, TrialMetrics,
    WindowObservation,
};
use crate::economy::error::{EngineError, EngineResult};
use crate::economy::models::{
    CriterionResult, Direction, Experiment, Hypothesis, HypothesisCode, HypothesisState, Tier,
    TrialClass, Verdict,
};
use crate::economy::registry::{AppliedVerdict, HypothesisRegistry};
use crate::economy::sources::ProvenanceSource;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, info};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Thresholds and plan for every tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub tier1: CriteriaThresholds,
    /// Per-fold thresholds for walk-forward and sensitivity perturbations.
    pub tier2: CriteriaThresholds,
    pub tier3: CriteriaThresholds,
    pub walk_forward_folds: usize,
    /// Bootstrap resamples per cost multiplier.
    pub sensitivity_resamples: usize,
    /// Multipliers applied to the magnitude floor.
    pub sensitivity_cost_multipliers: Vec<f64>,
    pub sensitivity_validate_share: f64,
    pub sensitivity_weaken_share: f64,
    pub sensitivity_seed: u64,
    /// Directional accuracy required on regime-transition windows.
    pub boundary_min_accuracy: f64,
    /// Share of worst windows forming the tail.
    pub tail_quantile: f64,
    /// Tail aligned return (%) below which the hypothesis is weakened.
    pub tail_weaken_pct: f64,
    /// Tail aligned return (%) below which the hypothesis is falsified.
    pub tail_falsify_pct: f64,
    pub promotion_min_trials: u32,
    /// T2 classes that must each validate before promotion to T3.
    pub tier2_required: Vec<TrialClass>,
    /// Antithesis classes the experimentation worker runs at T2.
    pub tier2_antithesis: Vec<TrialClass>,
    /// Antithesis classes re-run at T3 on fresh data, alongside the
    /// promotion review.
    pub tier3_antithesis: Vec<TrialClass>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            tier1: CriteriaThresholds::falsification_sweep(),
            tier2: CriteriaThresholds::falsification_sweep(),
            tier3: CriteriaThresholds::promotion_review(),
            walk_forward_folds: 4,
            sensitivity_resamples: 24,
            sensitivity_cost_multipliers: vec![1.0, 1.25, 1.5],
            sensitivity_validate_share: 0.8,
            sensitivity_weaken_share: 0.5,
            sensitivity_seed: 0x5EED_0F_EC0,
            boundary_min_accuracy: 0.5,
            tail_quantile: 0.10,
            tail_weaken_pct: -5.0,
            tail_falsify_pct: -10.0,
            promotion_min_trials: 200,
            tier2_required: vec![TrialClass::WalkForward, TrialClass::Sensitivity],
            tier2_antithesis: vec![
                TrialClass::MechanismInversion,
                TrialClass::RegimeBoundaryStress,
                TrialClass::TailConditionStress,
            ],
            tier3_antithesis: vec![
                TrialClass::MechanismInversion,
                TrialClass::RegimeBoundaryStress,
                TrialClass::TailConditionStress,
            ],
        }
    }
}

impl TierConfig {
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        for (name, t) in [("tier1", &self.tier1), ("tier2", &self.tier2), ("tier3", &self.tier3)] {
            errors.extend(t.shape_errors().into_iter().map(|e| format!("{}: {}", name, e)));
        }
        if self.walk_forward_folds < 2 {
            errors.push("walk_forward_folds must be at least 2".to_string());
        }
        if self.sensitivity_resamples == 0 || self.sensitivity_cost_multipliers.is_empty() {
            errors.push("sensitivity needs at least one resample and one cost multiplier".to_string());
        }
        if self.sensitivity_cost_multipliers.iter().any(|m| !(*m > 0.0)) {
            errors.push("sensitivity cost multipliers must be positive".to_string());
        }
        if !(self.sensitivity_weaken_share <= self.sensitivity_validate_share) {
            errors.push("sensitivity_weaken_share must not exceed sensitivity_validate_share".to_string());
        }
        if !(self.tail_quantile > 0.0 && self.tail_quantile <= 1.0) {
            errors.push(format!("tail_quantile {} outside (0,1]", self.tail_quantile));
        }
        if !(self.tail_falsify_pct <= self.tail_weaken_pct) {
            errors.push("tail_falsify_pct must not exceed tail_weaken_pct".to_string());
        }
        for class in &self.tier2_required {
            if !class.permitted_at(Tier::Two) {
                errors.push(format!("{} is not a T2 trial class", class));
            }
        }
        for class in self.tier2_antithesis.iter().chain(&self.tier3_antithesis) {
            if !class.is_antithesis() {
                errors.push(format!("{} is not an antithesis class", class));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    /// Tier and paper-eligibility after a verdict has been applied.
    ///
    /// `validated_at_tier` must include the experiment being applied.
    pub fn advance(
        &self,
        current: Tier,
        trial_class: TrialClass,
        verdict: Verdict,
        state_after: HypothesisState,
        validated_at_tier: &HashSet<TrialClass>,
    ) -> TierAdvance {
        let stay = TierAdvance {
            tier: current,
            eligible_for_paper: false,
        };
        if state_after.is_terminal() {
            return stay;
        }
        match current {
            Tier::One if trial_class == TrialClass::FalsificationSweep && verdict == Verdict::Validated => {
                TierAdvance {
                    tier: Tier::Two,
                    eligible_for_paper: false,
                }
            }
            Tier::Two
                if state_after == HypothesisState::Active
                    && self.tier2_required.iter().all(|c| validated_at_tier.contains(c)) =>
            {
                TierAdvance {
                    tier: Tier::Three,
                    eligible_for_paper: false,
                }
            }
            Tier::Three
                if trial_class == TrialClass::PromotionReview && verdict == Verdict::Validated =>
            {
                TierAdvance {
                    tier: Tier::Three,
                    eligible_for_paper: true,
                }
            }
            _ => stay,
        }
    }

    /// Trial classes still to run at `tier`, antithesis first so promotion
    /// never skips the adversarial checks.
    pub fn pending_trials(
        &self,
        tier: Tier,
        run_at_tier: &HashSet<TrialClass>,
        validated_at_tier: &HashSet<TrialClass>,
    ) -> Vec<TrialClass> {
        match tier {
            Tier::One => {
                if validated_at_tier.contains(&TrialClass::FalsificationSweep) {
                    Vec::new()
                } else {
                    vec![TrialClass::FalsificationSweep]
                }
            }
            Tier::Two => self
                .tier2_antithesis
                .iter()
                .filter(|c| !run_at_tier.contains(c))
                .chain(self.tier2_required.iter().filter(|c| !validated_at_tier.contains(c)))
                .copied()
                .collect(),
            Tier::Three => {
                let mut pending: Vec<TrialClass> = self
                    .tier3_antithesis
                    .iter()
                    .filter(|c| !run_at_tier.contains(c))
                    .copied()
                    .collect();
                if !validated_at_tier.contains(&TrialClass::PromotionReview) {
                    pending.push(TrialClass::PromotionReview);
                }
                pending
            }
        }
    }
}

/// Tier placement after a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierAdvance {
    pub tier: Tier,
    pub eligible_for_paper: bool,
}

// =============================================================================
// TRIAL EVALUATION
// =============================================================================

/// Criteria and verdict of one evaluated trial, before it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub criteria: Vec<CriterionResult>,
    pub advisory_score: f64,
    pub verdict: Verdict,
}

impl TrialOutcome {
    fn binary(criteria: Vec<CriterionResult>) -> Self {
        let verdict = if all_passed(&criteria) {
            Verdict::Validated
        } else {
            Verdict::Falsified
        };
        Self {
            advisory_score: advisory_score(&criteria),
            criteria,
            verdict,
        }
    }

    fn graded(criteria: Vec<CriterionResult>, verdict: Verdict) -> Self {
        Self {
            advisory_score: advisory_score(&criteria),
            criteria,
            verdict,
        }
    }
}

/// Request to run one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRequest {
    pub code: HypothesisCode,
    pub tier: Tier,
    pub trial_class: TrialClass,
    pub evidence: TrialEvidence,
}

/// Evaluates trials and records them through the registry.
#[derive(Debug, Clone, Default)]
pub struct ExperimentationEngine {
    config: TierConfig,
}

impl ExperimentationEngine {
    pub fn new(config: TierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Pure evaluation of one trial. Fails if the class is not permitted
    /// at `tier`.
    pub fn evaluate(
        &self,
        hypothesis: &Hypothesis,
        tier: Tier,
        trial_class: TrialClass,
        evidence: &TrialEvidence,
    ) -> EngineResult<TrialOutcome> {
        if !trial_class.permitted_at(tier) {
            return Err(EngineError::TrialNotPermitted { tier, trial_class });
        }

        let mut windows = evidence.windows.clone();
        windows.sort_by_key(|w| w.window_start);

        let outcome = match trial_class {
            TrialClass::FalsificationSweep => {
                let (_, criteria) = criteria::sweep_criteria(hypothesis, &windows, &self.config.tier1);
                TrialOutcome::binary(criteria)
            }
            TrialClass::WalkForward => self.walk_forward(hypothesis, &windows),
            TrialClass::Sensitivity => self.sensitivity(hypothesis, evidence, &windows),
            TrialClass::MechanismInversion => self.mechanism_inversion(hypothesis, &windows),
            TrialClass::RegimeBoundaryStress => self.regime_boundary(hypothesis, &windows),
            TrialClass::TailConditionStress => self.tail_condition(hypothesis, &windows),
            TrialClass::PromotionReview => self.promotion_review(hypothesis, &windows),
        };

        debug!(
            code = %hypothesis.code,
            tier = %tier,
            trial_class = %trial_class,
            verdict = %outcome.verdict,
            advisory_score = outcome.advisory_score,
            "Trial evaluated"
        );
        Ok(outcome)
    }

    /// Evaluates and records a trial, then applies its verdict, all in one
    /// registry transaction.
    pub fn run_trial(
        &self,
        registry: &HypothesisRegistry,
        provenance: &dyn ProvenanceSource,
        request: TrialRequest,
    ) -> EngineResult<AppliedVerdict> {
        let applied = registry.commit_experiment(provenance, &request, |h| {
            self.evaluate(h, request.tier, request.trial_class, &request.evidence)
        })?;
        info!(
            code = %applied.code,
            experiment_id = %applied.experiment_id,
            trial_class = %request.trial_class,
            verdict = %applied.verdict,
            state = %applied.state_after,
            confidence = applied.confidence_after,
            "Trial recorded"
        );
        Ok(applied)
    }

    // ===== TIER 2 =====

    fn fold_criteria(
        &self,
        hypothesis: &Hypothesis,
        fold: usize,
        windows: &[WindowObservation],
        thresholds: &CriteriaThresholds,
    ) -> Vec<CriterionResult> {
        let direction = hypothesis.claim.direction;
        let m = TrialMetrics::compute(
            direction,
            &hypothesis.regime_scope,
            windows,
            thresholds.min_magnitude_pct,
        );
        let mut magnitude = m.magnitude_criterion(direction, thresholds.min_magnitude_pct);
        magnitude.name = format!("fold_{}_{}", fold, magnitude.name);
        vec![
            CriterionResult::at_least(
                format!("fold_{}_{}", fold, criteria::SIGN_STABILITY),
                m.sign_stability,
                thresholds.sign_stability,
            ),
            CriterionResult::at_least(
                format!("fold_{}_{}", fold, criteria::DIRECTIONAL_ACCURACY),
                m.directional_accuracy,
                thresholds.directional_accuracy,
            ),
            magnitude,
        ]
    }

    /// Per-fold criteria over consecutive out-of-sample folds, plus the
    /// number of folds that passed.
    fn folds(
        &self,
        hypothesis: &Hypothesis,
        windows: &[WindowObservation],
        thresholds: &CriteriaThresholds,
    ) -> (Vec<CriterionResult>, usize) {
        let folds = self.config.walk_forward_folds;
        let mut criteria = Vec::new();
        let mut passed = 0;
        for (i, chunk) in split_folds(windows, folds).iter().enumerate() {
            let fold = self.fold_criteria(hypothesis, i + 1, chunk, thresholds);
            if all_passed(&fold) {
                passed += 1;
            }
            criteria.extend(fold);
        }
        (criteria, passed)
    }

    fn walk_forward(&self, hypothesis: &Hypothesis, windows: &[WindowObservation]) -> TrialOutcome {
        let folds = self.config.walk_forward_folds;
        let (mut criteria, passed) = self.folds(hypothesis, windows, &self.config.tier2);
        criteria.push(CriterionResult::at_least(
            "walk_forward_folds_passed",
            passed as f64,
            folds as f64,
        ));
        let verdict = if windows.len() < folds {
            Verdict::Falsified
        } else if passed == folds {
            Verdict::Validated
        } else if passed * 2 > folds {
            Verdict::Weakened
        } else {
            Verdict::Falsified
        };
        TrialOutcome::graded(criteria, verdict)
    }

    fn sensitivity(
        &self,
        hypothesis: &Hypothesis,
        evidence: &TrialEvidence,
        windows: &[WindowObservation],
    ) -> TrialOutcome {
        let t = &self.config.tier2;
        let direction = hypothesis.claim.direction;
        let mut rng = ChaCha8Rng::seed_from_u64(resample_seed(
            self.config.sensitivity_seed,
            hypothesis.code.as_str(),
            &evidence.dataset_signature,
        ));

        let mut criteria = Vec::new();
        let mut total_passed = 0usize;
        let mut total_runs = 0usize;

        for &multiplier in &self.config.sensitivity_cost_multipliers {
            let floor = t.min_magnitude_pct * multiplier;
            let mut passed = 0usize;
            for _ in 0..self.config.sensitivity_resamples {
                if windows.is_empty() {
                    break;
                }
                let sample: Vec<WindowObservation> = (0..windows.len())
                    .map(|_| windows[rng.gen_range(0..windows.len())].clone())
                    .collect();
                let m = TrialMetrics::compute(direction, &hypothesis.regime_scope, &sample, floor);
                if m.sign_stability >= t.sign_stability
                    && m.directional_accuracy >= t.directional_accuracy
                    && m.magnitude_criterion(direction, floor).passed
                {
                    passed += 1;
                }
            }
            let runs = self.config.sensitivity_resamples;
            total_passed += passed;
            total_runs += runs;
            criteria.push(CriterionResult::at_least(
                format!("cost_x{:.2}_pass_share", multiplier),
                share(passed, runs),
                self.config.sensitivity_validate_share,
            ));
        }

        let overall = share(total_passed, total_runs);
        criteria.push(CriterionResult::at_least(
            "sensitivity_pass_share",
            overall,
            self.config.sensitivity_validate_share,
        ));
        let verdict = if overall >= self.config.sensitivity_validate_share {
            Verdict::Validated
        } else if overall >= self.config.sensitivity_weaken_share {
            Verdict::Weakened
        } else {
            Verdict::Falsified
        };
        TrialOutcome::graded(criteria, verdict)
    }

    // ===== ANTITHESIS =====

    fn mechanism_inversion(&self, hypothesis: &Hypothesis, windows: &[WindowObservation]) -> TrialOutcome {
        let scope = &hypothesis.regime_scope;
        let floor = self.config.tier2.min_magnitude_pct;

        if windows.is_empty() {
            return TrialOutcome::graded(
                vec![CriterionResult::at_least("windows", 0.0, 1.0)],
                Verdict::Falsified,
            );
        }

        match hypothesis.claim.direction {
            Direction::Neutral => {
                // A neutral claim is broken when either directional bet pays.
                let bull = TrialMetrics::compute(Direction::Bullish, scope, windows, floor);
                let bear = TrialMetrics::compute(Direction::Bearish, scope, windows, floor);
                let criteria = vec![
                    CriterionResult::at_most("bullish_alternative_return_pct", bull.aligned_return_pct, floor),
                    CriterionResult::at_most("bearish_alternative_return_pct", bear.aligned_return_pct, floor),
                ];
                let verdict = if all_passed(&criteria) {
                    Verdict::Validated
                } else {
                    Verdict::Falsified
                };
                TrialOutcome::graded(criteria, verdict)
            }
            direction => {
                let inverted = direction.inverted();
                let mut m = TrialMetrics::compute(inverted, scope, windows, floor);
                if m.pooled_trials > 0 {
                    m.directional_accuracy = 1.0 - m.directional_accuracy;
                }
                let accuracy =
                    CriterionResult::at_most("inverted_directional_accuracy", m.directional_accuracy, 0.5);
                let edge =
                    CriterionResult::at_most("inverted_aligned_return_pct", m.aligned_return_pct, 0.0);
                let verdict = match (accuracy.passed, edge.passed) {
                    (false, _) => Verdict::Falsified,
                    (true, false) => Verdict::Weakened,
                    (true, true) => Verdict::Validated,
                };
                TrialOutcome::graded(vec![accuracy, edge], verdict)
            }
        }
    }

    fn regime_boundary(&self, hypothesis: &Hypothesis, windows: &[WindowObservation]) -> TrialOutcome {
        let floor = self.config.tier2.min_magnitude_pct;
        let transitions: Vec<WindowObservation> =
            windows.iter().filter(|w| w.regime_transition).cloned().collect();

        let coverage = CriterionResult::at_least("transition_windows", transitions.len() as f64, 1.0);
        if transitions.is_empty() {
            let verdict = if windows.is_empty() {
                Verdict::Falsified
            } else {
                Verdict::Weakened
            };
            return TrialOutcome::graded(vec![coverage], verdict);
        }

        let direction = hypothesis.claim.direction;
        let m = TrialMetrics::compute(direction, &hypothesis.regime_scope, &transitions, floor);
        let accuracy = CriterionResult::at_least(
            "transition_directional_accuracy",
            m.directional_accuracy,
            self.config.boundary_min_accuracy,
        );
        let reversal_floor = match direction {
            Direction::Neutral => -f64::INFINITY,
            _ => -floor,
        };
        let reversal =
            CriterionResult::at_least("transition_aligned_return_pct", m.aligned_return_pct, reversal_floor);

        let verdict = if !reversal.passed {
            Verdict::Falsified
        } else if !accuracy.passed {
            Verdict::Weakened
        } else {
            Verdict::Validated
        };
        TrialOutcome::graded(vec![coverage, accuracy, reversal], verdict)
    }

    fn tail_condition(&self, hypothesis: &Hypothesis, windows: &[WindowObservation]) -> TrialOutcome {
        if windows.is_empty() {
            return TrialOutcome::graded(
                vec![CriterionResult::at_least("windows", 0.0, 1.0)],
                Verdict::Falsified,
            );
        }
        let direction = hypothesis.claim.direction;
        let mut aligned: Vec<f64> = windows
            .iter()
            .map(|w| match direction {
                Direction::Neutral => -w.mean_return_pct.abs(),
                d => d.sign() * w.mean_return_pct,
            })
            .collect();
        aligned.sort_by(|a, b| a.total_cmp(b));

        let tail_len = ((aligned.len() as f64 * self.config.tail_quantile).ceil() as usize).max(1);
        let tail_mean = aligned.iter().take(tail_len).sum::<f64>() / tail_len as f64;

        let criterion =
            CriterionResult::at_least("tail_aligned_return_pct", tail_mean, self.config.tail_weaken_pct);
        let verdict = if tail_mean >= self.config.tail_weaken_pct {
            Verdict::Validated
        } else if tail_mean >= self.config.tail_falsify_pct {
            Verdict::Weakened
        } else {
            Verdict::Falsified
        };
        TrialOutcome::graded(vec![criterion], verdict)
    }

    // ===== TIER 3 =====

    fn promotion_review(&self, hypothesis: &Hypothesis, windows: &[WindowObservation]) -> TrialOutcome {
        let t = &self.config.tier3;
        let (metrics, mut criteria) = criteria::sweep_criteria(hypothesis, windows, t);
        criteria.push(CriterionResult::at_least(
            "pooled_trials",
            metrics.pooled_trials as f64,
            self.config.promotion_min_trials as f64,
        ));
        let folds = self.config.walk_forward_folds;
        let (_, passed) = self.folds(hypothesis, windows, t);
        criteria.push(CriterionResult::at_least(
            "walk_forward_folds_passed",
            passed as f64,
            folds as f64,
        ));
        TrialOutcome::binary(criteria)
    }
}

/// Splits time-ordered windows into `folds` consecutive chunks of near-equal
/// size. Returns fewer chunks when there are fewer windows than folds.
fn split_folds(windows: &[WindowObservation], folds: usize) -> Vec<&[WindowObservation]> {
    if folds == 0 || windows.is_empty() {
        return Vec::new();
    }
    let n = windows.len();
    let folds = folds.min(n);
    (0..folds)
        .map(|i| {
            let start = i * n / folds;
            let end = (i + 1) * n / folds;
            &windows[start..end]
        })
        .collect()
}

fn share(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64
    }
}

/// Resampling seed for one hypothesis and dataset. SHA-256 keeps recorded
/// sensitivity runs reproducible across toolchain upgrades.
fn resample_seed(base: u64, code: &str, dataset_signature: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(base.to_le_bytes());
    hasher.update(code.as_bytes());
    hasher.update([0u8]);
    hasher.update(dataset_signature.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

// =============================================================================
// EXPERIMENT LOG
// =============================================================================

pub(crate) const EXPERIMENT_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS experiments (
        id TEXT PRIMARY KEY,
        hypothesis_code TEXT NOT NULL,
        tier INTEGER NOT NULL,
        trial_class TEXT NOT NULL,
        dataset_signature TEXT NOT NULL,
        verdict TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        experiment_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_experiments_hypothesis
        ON experiments(hypothesis_code, tier);

    CREATE TRIGGER IF NOT EXISTS experiments_append_only_update
        BEFORE UPDATE ON experiments
        BEGIN SELECT RAISE(ABORT, 'experiments are append-only'); END;

    CREATE TRIGGER IF NOT EXISTS experiments_append_only_delete
        BEFORE DELETE ON experiments
        BEGIN SELECT RAISE(ABORT, 'experiments are append-only'); END;
"#;

pub(crate) fn append_experiment(conn: &Connection, experiment: &Experiment) -> EngineResult<()> {
    let json = serde_json::to_string(experiment)?;
    conn.execute(
        r#"INSERT INTO experiments (
            id, hypothesis_code, tier, trial_class, dataset_signature, verdict, created_at, experiment_json
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        params![
            experiment.id,
            experiment.hypothesis_code.as_str(),
            experiment.tier.number(),
            experiment.trial_class.as_str(),
            experiment.dataset_signature,
            experiment.verdict.as_str(),
            experiment.created_at.timestamp_millis(),
            json,
        ],
    )?;
    Ok(())
}

pub(crate) fn load_experiment(conn: &Connection, id: &str) -> EngineResult<Option<Experiment>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT experiment_json FROM experiments WHERE id = ?",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Experiments of one hypothesis in insertion order.
pub(crate) fn load_experiments(conn: &Connection, code: &HypothesisCode) -> EngineResult<Vec<Experiment>> {
    let mut stmt = conn.prepare(
        "SELECT experiment_json FROM experiments WHERE hypothesis_code = ? ORDER BY rowid",
    )?;
    let rows = stmt.query_map([code.as_str()], |row| row.get::<_, String>(0))?;
    let mut experiments = Vec::new();
    for json in rows {
        experiments.push(serde_json::from_str(&json?)?);
    }
    Ok(experiments)
}

/// Classes run, and classes validated, at `tier`.
pub(crate) fn classes_at_tier(
    conn: &Connection,
    code: &HypothesisCode,
    tier: Tier,
) -> EngineResult<(HashSet<TrialClass>, HashSet<TrialClass>)> {
    let mut stmt = conn.prepare(
        "SELECT trial_class, verdict FROM experiments WHERE hypothesis_code = ? AND tier = ?",
    )?;
    let rows = stmt.query_map(params![code.as_str(), tier.number()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut run = HashSet::new();
    let mut validated = HashSet::new();
    for row in rows {
        let (class, verdict) = row?;
        let Some(class) = TrialClass::parse(&class) else {
            continue;
        };
        run.insert(class);
        if Verdict::parse(&verdict) == Some(Verdict::Validated) {
            validated.insert(class);
        }
    }
    Ok((run, validated))
}
