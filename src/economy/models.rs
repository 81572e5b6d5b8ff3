//! Hypothesis Economy Data Model
//!
//! Records shared by every component of the engine. The registry owns
//! mutation of [`Hypothesis`] rows, the experimentation engine owns creation
//! of [`Experiment`] rows, and the guardrail owns its ledger counters.
//!
//! Loosely-shaped payloads (falsification criteria, regime confidence maps)
//! are explicit tagged structures with validated shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Default number of WEAKENED verdicts a hypothesis may absorb.
pub const DEFAULT_MAX_FALSIFICATIONS: u32 = 3;

/// Upper bound on the per-verdict confidence decay rate.
pub const MAX_DECAY_RATE: f64 = 0.5;

// =============================================================================
// IDENTITY
// =============================================================================

/// Stable unique hypothesis code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HypothesisCode(pub String);

impl HypothesisCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HypothesisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// ENUMERATIONS
// =============================================================================

/// Claimed direction of the predicted move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Bullish,
    Bearish,
    Neutral,
}

impl Direction {
    /// The opposite claim. Neutral has no opposite and maps to itself.
    pub fn inverted(self) -> Self {
        match self {
            Direction::Bullish => Direction::Bearish,
            Direction::Bearish => Direction::Bullish,
            Direction::Neutral => Direction::Neutral,
        }
    }

    /// Sign multiplier used to align realized returns with the claim.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Bearish => -1.0,
            Direction::Neutral => 0.0,
        }
    }
}

/// Expected magnitude bucket of the move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MagnitudeClass {
    Small,
    Medium,
    Large,
}

/// Lifecycle state of a hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HypothesisState {
    Draft,
    PreValidated,
    Active,
    Weakened,
    Falsified,
    Retired,
}

impl HypothesisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HypothesisState::Draft => "DRAFT",
            HypothesisState::PreValidated => "PRE_VALIDATED",
            HypothesisState::Active => "ACTIVE",
            HypothesisState::Weakened => "WEAKENED",
            HypothesisState::Falsified => "FALSIFIED",
            HypothesisState::Retired => "RETIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(HypothesisState::Draft),
            "PRE_VALIDATED" => Some(HypothesisState::PreValidated),
            "ACTIVE" => Some(HypothesisState::Active),
            "WEAKENED" => Some(HypothesisState::Weakened),
            "FALSIFIED" => Some(HypothesisState::Falsified),
            "RETIRED" => Some(HypothesisState::Retired),
            _ => None,
        }
    }

    /// FALSIFIED and RETIRED accept no further verdicts.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HypothesisState::Falsified | HypothesisState::Retired)
    }

    /// States in which experiments may be created.
    pub fn is_testable(&self) -> bool {
        matches!(self, HypothesisState::Active | HypothesisState::Weakened)
    }
}

impl fmt::Display for HypothesisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a hypothesis came into being.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OriginType {
    ErrorDriven,
    EconomicTheory,
    RegimeChange,
}

/// Experiment verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Validated,
    Weakened,
    Falsified,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Validated => "VALIDATED",
            Verdict::Weakened => "WEAKENED",
            Verdict::Falsified => "FALSIFIED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VALIDATED" => Some(Verdict::Validated),
            "WEAKENED" => Some(Verdict::Weakened),
            "FALSIFIED" => Some(Verdict::Falsified),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Experimentation tier, in increasing rigor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    /// Falsification sweep (cheap filter).
    One,
    /// Robustness validation.
    Two,
    /// Promotion candidate.
    Three,
}

impl Tier {
    pub fn number(&self) -> u8 {
        match self {
            Tier::One => 1,
            Tier::Two => 2,
            Tier::Three => 3,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Tier::One),
            2 => Some(Tier::Two),
            3 => Some(Tier::Three),
            _ => None,
        }
    }

    /// Calibration target for the share of hypotheses this tier should kill.
    /// Tier 1 is specified at 80-90%; the later tiers run on survivors and
    /// carry looser targets.
    pub fn target_death_rate(&self) -> (f64, f64) {
        match self {
            Tier::One => (0.80, 0.90),
            Tier::Two => (0.40, 0.60),
            Tier::Three => (0.20, 0.40),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.number())
    }
}

/// Class of trial run inside a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialClass {
    FalsificationSweep,
    WalkForward,
    Sensitivity,
    MechanismInversion,
    RegimeBoundaryStress,
    TailConditionStress,
    PromotionReview,
}

impl TrialClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialClass::FalsificationSweep => "falsification_sweep",
            TrialClass::WalkForward => "walk_forward",
            TrialClass::Sensitivity => "sensitivity",
            TrialClass::MechanismInversion => "mechanism_inversion",
            TrialClass::RegimeBoundaryStress => "regime_boundary_stress",
            TrialClass::TailConditionStress => "tail_condition_stress",
            TrialClass::PromotionReview => "promotion_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "falsification_sweep" => Some(TrialClass::FalsificationSweep),
            "walk_forward" => Some(TrialClass::WalkForward),
            "sensitivity" => Some(TrialClass::Sensitivity),
            "mechanism_inversion" => Some(TrialClass::MechanismInversion),
            "regime_boundary_stress" => Some(TrialClass::RegimeBoundaryStress),
            "tail_condition_stress" => Some(TrialClass::TailConditionStress),
            "promotion_review" => Some(TrialClass::PromotionReview),
            _ => None,
        }
    }

    /// Adversarial trial classes. Never permitted at Tier 1.
    pub fn is_antithesis(&self) -> bool {
        matches!(
            self,
            TrialClass::MechanismInversion
                | TrialClass::RegimeBoundaryStress
                | TrialClass::TailConditionStress
        )
    }

    /// Whether this class may run at `tier`.
    pub fn permitted_at(&self, tier: Tier) -> bool {
        match (self, tier) {
            (TrialClass::FalsificationSweep, Tier::One) => true,
            (TrialClass::WalkForward | TrialClass::Sensitivity, Tier::Two) => true,
            (c, Tier::Two | Tier::Three) if c.is_antithesis() => true,
            (TrialClass::PromotionReview, Tier::Three) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TrialClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// STRUCTURED CONTENT
// =============================================================================

/// The economic story behind a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicContent {
    pub rationale: String,
    pub causal_mechanism: String,
    #[serde(default)]
    pub behavioral_basis: Option<String>,
    /// What observation would disprove the hypothesis.
    pub counterfactual_scenario: String,
}

/// The directional prediction itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionalClaim {
    pub direction: Direction,
    pub magnitude_class: MagnitudeClass,
    /// Expected time horizon in hours (> 0).
    pub horizon_hours: f64,
}

/// Regimes in which the hypothesis claims validity, with per-regime
/// conditional confidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeScope {
    pub valid_regimes: BTreeSet<String>,
    #[serde(default)]
    pub conditional_confidence: BTreeMap<String, f64>,
}

impl RegimeScope {
    pub fn new<I, S>(regimes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            valid_regimes: regimes.into_iter().map(Into::into).collect(),
            conditional_confidence: BTreeMap::new(),
        }
    }

    pub fn with_confidence(mut self, regime: impl Into<String>, confidence: f64) -> Self {
        self.conditional_confidence.insert(regime.into(), confidence);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.valid_regimes.is_empty()
    }

    pub fn contains(&self, regime: &str) -> bool {
        self.valid_regimes.contains(regime)
    }

    /// Shape check: map keys must be declared regimes, values in [0,1].
    pub fn shape_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (regime, confidence) in &self.conditional_confidence {
            if !self.valid_regimes.contains(regime) {
                errors.push(format!("conditional confidence for undeclared regime '{}'", regime));
            }
            if !(0.0..=1.0).contains(confidence) {
                errors.push(format!(
                    "conditional confidence {} for regime '{}' outside [0,1]",
                    confidence, regime
                ));
            }
        }
        errors
    }
}

/// Trial metric a falsification criterion is stated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FalsificationMetric {
    DirectionalAccuracy,
    SignStability,
    RegimeConsistency,
    TemporalStability,
    /// Mean direction-aligned return, in percent.
    AlignedReturnPct,
}

impl FalsificationMetric {
    /// Ratio metrics live in [0,1]; the return metric is unbounded.
    pub fn is_ratio(&self) -> bool {
        !matches!(self, FalsificationMetric::AlignedReturnPct)
    }
}

/// Which side of the threshold falsifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Falsified when the metric drops below the threshold.
    Below,
    /// Falsified when the metric rises above the threshold.
    Above,
}

/// Longest trailing window a falsification rule may be stated over (ten years).
pub const MAX_EVALUATION_WINDOW_HOURS: f64 = 87_600.0;

/// Structured, pre-registered falsification rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FalsificationCriteria {
    pub metric: FalsificationMetric,
    pub falsify_when: Comparison,
    pub threshold: f64,
    /// Trailing window (hours) of evidence the rule is evaluated over.
    pub evaluation_window_hours: f64,
}

impl FalsificationCriteria {
    /// Structural problems with the rule, empty when well-formed.
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.threshold.is_finite() {
            errors.push("threshold is not finite".to_string());
        } else if self.metric.is_ratio() && !(0.0..=1.0).contains(&self.threshold) {
            errors.push(format!(
                "ratio metric {:?} threshold {} outside [0,1]",
                self.metric, self.threshold
            ));
        }
        if !(self.evaluation_window_hours.is_finite() && self.evaluation_window_hours > 0.0) {
            errors.push(format!(
                "evaluation window {}h must be positive",
                self.evaluation_window_hours
            ));
        } else if self.evaluation_window_hours > MAX_EVALUATION_WINDOW_HOURS {
            errors.push(format!(
                "evaluation window {}h exceeds {}h",
                self.evaluation_window_hours, MAX_EVALUATION_WINDOW_HOURS
            ));
        }
        errors
    }

    pub fn is_well_formed(&self) -> bool {
        self.structural_errors().is_empty()
    }

    /// True when `value` crosses the falsifying side of the threshold.
    pub fn is_triggered(&self, value: f64) -> bool {
        match self.falsify_when {
            Comparison::Below => value < self.threshold,
            Comparison::Above => value > self.threshold,
        }
    }
}

/// Inputs the pre-validation gate judges statistical plausibility on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreValidationInputs {
    pub sample_size_historical: u32,
    /// Hypotheses already considered in the current testing period.
    pub prior_hypotheses_count: u32,
    pub deflated_sharpe_estimate: f64,
}

/// Origin of a hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    pub origin_type: OriginType,
    /// Originating error record; required for ERROR_DRIVEN.
    #[serde(default)]
    pub error_ref: Option<String>,
}

impl Origin {
    pub fn error_driven(error_ref: impl Into<String>) -> Self {
        Self {
            origin_type: OriginType::ErrorDriven,
            error_ref: Some(error_ref.into()),
        }
    }

    pub fn theory() -> Self {
        Self {
            origin_type: OriginType::EconomicTheory,
            error_ref: None,
        }
    }

    pub fn regime_change() -> Self {
        Self {
            origin_type: OriginType::RegimeChange,
            error_ref: None,
        }
    }

    pub fn is_error_driven(&self) -> bool {
        self.origin_type == OriginType::ErrorDriven
    }
}

// =============================================================================
// HYPOTHESIS
// =============================================================================

/// Input to `HypothesisRegistry::create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisDraft {
    pub code: HypothesisCode,
    pub content: EconomicContent,
    pub claim: DirectionalClaim,
    pub regime_scope: RegimeScope,
    pub falsification_criteria: FalsificationCriteria,
    pub confidence_decay_rate: f64,
    #[serde(default = "default_max_falsifications")]
    pub max_falsifications: u32,
    pub pre_validation: PreValidationInputs,
    pub initial_confidence: f64,
    pub origin: Origin,
}

fn default_max_falsifications() -> u32 {
    DEFAULT_MAX_FALSIFICATIONS
}

impl HypothesisDraft {
    /// Shape problems that make the draft unstorable. Content quality is
    /// judged later by the pre-validation gate.
    pub fn shape_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.code.as_str().trim().is_empty() {
            errors.push("code is empty".to_string());
        }
        if !(self.confidence_decay_rate > 0.0 && self.confidence_decay_rate <= MAX_DECAY_RATE) {
            errors.push(format!(
                "confidence_decay_rate {} outside (0, {}]",
                self.confidence_decay_rate, MAX_DECAY_RATE
            ));
        }
        if self.max_falsifications == 0 {
            errors.push("max_falsifications must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.initial_confidence) {
            errors.push(format!(
                "initial_confidence {} outside [0,1]",
                self.initial_confidence
            ));
        }
        if !(self.claim.horizon_hours.is_finite() && self.claim.horizon_hours > 0.0) {
            errors.push(format!("horizon_hours {} must be positive", self.claim.horizon_hours));
        }
        if !self.pre_validation.deflated_sharpe_estimate.is_finite() {
            errors.push("deflated_sharpe_estimate is not finite".to_string());
        }
        errors.extend(self.regime_scope.shape_errors());
        match (self.origin.is_error_driven(), &self.origin.error_ref) {
            (true, None) => errors.push("ERROR_DRIVEN origin requires error_ref".to_string()),
            (true, Some(r)) if r.trim().is_empty() => {
                errors.push("ERROR_DRIVEN origin requires error_ref".to_string())
            }
            (false, Some(_)) => {
                errors.push("error_ref is only valid for ERROR_DRIVEN origin".to_string())
            }
            _ => {}
        }
        errors
    }
}

/// Canonical hypothesis record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub code: HypothesisCode,
    pub content: EconomicContent,
    pub claim: DirectionalClaim,
    pub regime_scope: RegimeScope,
    pub falsification_criteria: FalsificationCriteria,
    pub falsification_count: u32,
    pub confidence_decay_rate: f64,
    pub max_falsifications: u32,
    pub pre_validation: PreValidationInputs,
    pub pre_validation_passed: bool,
    /// Set once by `lock`; never changes afterward.
    pub pre_registration_timestamp: Option<DateTime<Utc>>,
    pub initial_confidence: f64,
    /// Unset until the hypothesis is locked.
    pub current_confidence: Option<f64>,
    pub state: HypothesisState,
    pub origin: Origin,
    /// Tier the hypothesis is currently being tested at, once active.
    pub current_tier: Option<Tier>,
    /// Set when a Tier-3 promotion review validates.
    pub eligible_for_paper: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hypothesis {
    pub fn from_draft(draft: HypothesisDraft, now: DateTime<Utc>) -> Self {
        Self {
            code: draft.code,
            content: draft.content,
            claim: draft.claim,
            regime_scope: draft.regime_scope,
            falsification_criteria: draft.falsification_criteria,
            falsification_count: 0,
            confidence_decay_rate: draft.confidence_decay_rate,
            max_falsifications: draft.max_falsifications,
            pre_validation: draft.pre_validation,
            pre_validation_passed: false,
            pre_registration_timestamp: None,
            initial_confidence: draft.initial_confidence,
            current_confidence: None,
            state: HypothesisState::Draft,
            origin: draft.origin,
            current_tier: None,
            eligible_for_paper: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.pre_registration_timestamp.is_some()
    }

    /// Current confidence, treating unset as zero.
    pub fn confidence(&self) -> f64 {
        self.current_confidence.unwrap_or(0.0)
    }
}

/// Edit to a DRAFT hypothesis. Every field here is frozen once the
/// hypothesis is pre-registered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypothesisAmendment {
    pub rationale: Option<String>,
    pub causal_mechanism: Option<String>,
    pub behavioral_basis: Option<String>,
    pub counterfactual_scenario: Option<String>,
    pub claim: Option<DirectionalClaim>,
    pub regime_scope: Option<RegimeScope>,
    pub falsification_criteria: Option<FalsificationCriteria>,
    pub confidence_decay_rate: Option<f64>,
    pub max_falsifications: Option<u32>,
    pub pre_validation: Option<PreValidationInputs>,
}

impl HypothesisAmendment {
    /// Names of the locked fields this amendment touches, in field order.
    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.rationale.is_some() {
            fields.push("rationale");
        }
        if self.causal_mechanism.is_some() {
            fields.push("causal_mechanism");
        }
        if self.behavioral_basis.is_some() {
            fields.push("behavioral_basis");
        }
        if self.counterfactual_scenario.is_some() {
            fields.push("counterfactual_scenario");
        }
        if self.claim.is_some() {
            fields.push("claim");
        }
        if self.regime_scope.is_some() {
            fields.push("regime_scope");
        }
        if self.falsification_criteria.is_some() {
            fields.push("falsification_criteria");
        }
        if self.confidence_decay_rate.is_some() {
            fields.push("confidence_decay_rate");
        }
        if self.max_falsifications.is_some() {
            fields.push("max_falsifications");
        }
        if self.pre_validation.is_some() {
            fields.push("pre_validation");
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.touched_fields().is_empty()
    }

    /// Applies the amendment to a draft-shaped copy of `hypothesis`.
    pub fn apply_to(&self, hypothesis: &mut Hypothesis) {
        if let Some(v) = &self.rationale {
            hypothesis.content.rationale = v.clone();
        }
        if let Some(v) = &self.causal_mechanism {
            hypothesis.content.causal_mechanism = v.clone();
        }
        if let Some(v) = &self.behavioral_basis {
            hypothesis.content.behavioral_basis = Some(v.clone());
        }
        if let Some(v) = &self.counterfactual_scenario {
            hypothesis.content.counterfactual_scenario = v.clone();
        }
        if let Some(v) = &self.claim {
            hypothesis.claim = v.clone();
        }
        if let Some(v) = &self.regime_scope {
            hypothesis.regime_scope = v.clone();
        }
        if let Some(v) = &self.falsification_criteria {
            hypothesis.falsification_criteria = v.clone();
        }
        if let Some(v) = self.confidence_decay_rate {
            hypothesis.confidence_decay_rate = v;
        }
        if let Some(v) = self.max_falsifications {
            hypothesis.max_falsifications = v;
        }
        if let Some(v) = &self.pre_validation {
            hypothesis.pre_validation = v.clone();
        }
    }
}

// =============================================================================
// EXTERNAL COLLABORATOR RECORDS
// =============================================================================

/// Priority class assigned by the external error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorPriority {
    Critical,
    High,
    Medium,
    Low,
}

/// Classified mismatch between a prior prediction and the observed outcome.
/// Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub predicted_direction: Direction,
    pub actual_direction: Direction,
    pub magnitude_pct: f64,
    pub regime_at_prediction: String,
    pub regime_at_outcome: String,
    pub priority: ErrorPriority,
}

impl ErrorRecord {
    /// The regime moved between prediction and outcome.
    pub fn is_regime_shift(&self) -> bool {
        self.regime_at_prediction != self.regime_at_outcome
    }
}

/// Market regime snapshot reference. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub id: String,
    pub regime: String,
    pub captured_at: DateTime<Utc>,
}

// =============================================================================
// EXPERIMENTS
// =============================================================================

/// Result of one evaluated criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub name: String,
    pub observed: f64,
    pub threshold: f64,
    pub passed: bool,
}

impl CriterionResult {
    pub fn at_least(name: impl Into<String>, observed: f64, threshold: f64) -> Self {
        Self {
            name: name.into(),
            observed,
            threshold,
            passed: observed >= threshold,
        }
    }

    pub fn at_most(name: impl Into<String>, observed: f64, threshold: f64) -> Self {
        Self {
            name: name.into(),
            observed,
            threshold,
            passed: observed <= threshold,
        }
    }
}

/// One terminal trial against one hypothesis at one tier. Never mutated
/// after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub hypothesis_code: HypothesisCode,
    pub tier: Tier,
    pub trial_class: TrialClass,
    pub dataset_signature: String,
    pub regime_snapshot_ref: String,
    pub error_ref: Option<String>,
    pub reuse_authorized: bool,
    pub criteria: Vec<CriterionResult>,
    /// Weighted diagnostic score. Never consulted for the verdict.
    pub advisory_score: f64,
    pub verdict: Verdict,
    pub created_at: DateTime<Utc>,
}

/// Aggregate experiment history of one hypothesis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub total: u32,
    pub validated: u32,
    pub weakened: u32,
    pub falsified: u32,
}

impl ExperimentSummary {
    pub fn from_experiments<'a, I>(experiments: I) -> Self
    where
        I: IntoIterator<Item = &'a Experiment>,
    {
        let mut summary = Self::default();
        for e in experiments {
            summary.record(e.verdict);
        }
        summary
    }

    pub fn record(&mut self, verdict: Verdict) {
        self.total += 1;
        match verdict {
            Verdict::Validated => self.validated += 1,
            Verdict::Weakened => self.weakened += 1,
            Verdict::Falsified => self.falsified += 1,
        }
    }

    /// Share of experiments that validated; zero with no history.
    pub fn hit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.validated as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_and_terminality() {
        for state in [
            HypothesisState::Draft,
            HypothesisState::PreValidated,
            HypothesisState::Active,
            HypothesisState::Weakened,
            HypothesisState::Falsified,
            HypothesisState::Retired,
        ] {
            assert_eq!(HypothesisState::parse(state.as_str()), Some(state));
        }
        assert!(HypothesisState::Falsified.is_terminal());
        assert!(HypothesisState::Retired.is_terminal());
        assert!(!HypothesisState::Weakened.is_terminal());
        assert!(HypothesisState::Weakened.is_testable());
        assert!(!HypothesisState::PreValidated.is_testable());
    }

    #[test]
    fn test_antithesis_never_permitted_at_tier_one() {
        for class in [
            TrialClass::MechanismInversion,
            TrialClass::RegimeBoundaryStress,
            TrialClass::TailConditionStress,
        ] {
            assert!(class.is_antithesis());
            assert!(!class.permitted_at(Tier::One));
            assert!(class.permitted_at(Tier::Two));
            assert!(class.permitted_at(Tier::Three));
        }
        assert!(TrialClass::FalsificationSweep.permitted_at(Tier::One));
        assert!(!TrialClass::FalsificationSweep.permitted_at(Tier::Two));
        assert!(!TrialClass::PromotionReview.permitted_at(Tier::Two));
    }

    #[test]
    fn test_falsification_criteria_structure() {
        let good = FalsificationCriteria {
            metric: FalsificationMetric::DirectionalAccuracy,
            falsify_when: Comparison::Below,
            threshold: 0.52,
            evaluation_window_hours: 720.0,
        };
        assert!(good.is_well_formed());
        assert!(good.is_triggered(0.50));
        assert!(!good.is_triggered(0.60));

        let bad = FalsificationCriteria {
            threshold: 1.4,
            evaluation_window_hours: 0.0,
            ..good.clone()
        };
        assert_eq!(bad.structural_errors().len(), 2);

        let unbounded = FalsificationCriteria {
            metric: FalsificationMetric::AlignedReturnPct,
            threshold: -3.0,
            ..good
        };
        assert!(unbounded.is_well_formed());
    }

    #[test]
    fn test_regime_scope_shape() {
        let scope = RegimeScope::new(["trending", "ranging"])
            .with_confidence("trending", 0.7)
            .with_confidence("crisis", 0.2)
            .with_confidence("ranging", 1.3);
        let errors = scope.shape_errors();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_amendment_touched_fields() {
        let amendment = HypothesisAmendment {
            rationale: Some("new".into()),
            falsification_criteria: None,
            confidence_decay_rate: Some(0.2),
            ..Default::default()
        };
        assert_eq!(amendment.touched_fields(), vec!["rationale", "confidence_decay_rate"]);
        assert!(HypothesisAmendment::default().is_empty());
    }

    #[test]
    fn test_summary_hit_rate() {
        let mut summary = ExperimentSummary::default();
        assert_eq!(summary.hit_rate(), 0.0);
        summary.record(Verdict::Validated);
        summary.record(Verdict::Validated);
        summary.record(Verdict::Weakened);
        summary.record(Verdict::Falsified);
        assert_eq!(summary.total, 4);
        assert!((summary.hit_rate() - 0.5).abs() < 1e-12);
    }
}
