//! Pre-Validation Gate
//!
//! Stateless completeness and plausibility check run before a hypothesis may
//! be locked. Every check is independent and the gate reports every failing
//! check, so one corrective pass can fix several problems at once.
//!
//! The gate has no side effects. Passing it is necessary but not sufficient
//! for `HypothesisRegistry::lock`, which re-runs it inside its transaction.
//!
//! # Checks
//!
//! | Check | Rule |
//! |---|---|
//! | rationale / causal mechanism | trimmed length > `min_text_len` |
//! | counterfactual scenario | present (non-blank) |
//! | falsification criteria | structurally well-formed |
//! | regime scope | non-empty, confidence map well-shaped |
//! | sample size | ≥ 30 historical observations |
//! | deflated Sharpe | ≤ 1.5 (realism ceiling) |
//! | prior hypotheses | ≤ 30 (multiple-testing ceiling) |

use crate::economy::models::Hypothesis;
use serde::{Deserialize, Serialize};

/// Thresholds applied by the gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Trimmed length rationale and causal-mechanism text must exceed.
    pub min_text_len: usize,
    /// Statistical-significance floor on historical sample size.
    pub min_sample_size: u32,
    /// Realism ceiling on the deflated Sharpe estimate.
    pub max_deflated_sharpe: f64,
    /// Multiple-testing ceiling on prior hypotheses considered.
    pub max_prior_hypotheses: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_text_len: 40,
            min_sample_size: 30,
            max_deflated_sharpe: 1.5,
            max_prior_hypotheses: 30,
        }
    }
}

/// One failed gate check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GateFailure {
    RationaleTooShort { length: usize, minimum: usize },
    CausalMechanismTooShort { length: usize, minimum: usize },
    CounterfactualMissing,
    FalsificationCriteriaMalformed { problems: Vec<String> },
    RegimeScopeEmpty,
    RegimeConfidenceMalformed { problems: Vec<String> },
    SampleSizeInsufficient { observed: u32, minimum: u32 },
    DeflatedSharpeUnrealistic { observed: f64, maximum: f64 },
    MultipleTestingExposure { observed: u32, maximum: u32 },
}

impl GateFailure {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RationaleTooShort { .. } => "rationale_too_short",
            Self::CausalMechanismTooShort { .. } => "causal_mechanism_too_short",
            Self::CounterfactualMissing => "counterfactual_missing",
            Self::FalsificationCriteriaMalformed { .. } => "falsification_criteria_malformed",
            Self::RegimeScopeEmpty => "regime_scope_empty",
            Self::RegimeConfidenceMalformed { .. } => "regime_confidence_malformed",
            Self::SampleSizeInsufficient { .. } => "sample_size_insufficient",
            Self::DeflatedSharpeUnrealistic { .. } => "deflated_sharpe_unrealistic",
            Self::MultipleTestingExposure { .. } => "multiple_testing_exposure",
        }
    }
}

impl std::fmt::Display for GateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RationaleTooShort { length, minimum } => {
                write!(f, "rationale has {} chars, need more than {}", length, minimum)
            }
            Self::CausalMechanismTooShort { length, minimum } => {
                write!(f, "causal mechanism has {} chars, need more than {}", length, minimum)
            }
            Self::CounterfactualMissing => write!(f, "counterfactual scenario is missing"),
            Self::FalsificationCriteriaMalformed { problems } => {
                write!(f, "falsification criteria malformed: {}", problems.join("; "))
            }
            Self::RegimeScopeEmpty => write!(f, "no valid regimes declared"),
            Self::RegimeConfidenceMalformed { problems } => {
                write!(f, "regime confidence map malformed: {}", problems.join("; "))
            }
            Self::SampleSizeInsufficient { observed, minimum } => {
                write!(f, "historical sample size {} below floor {}", observed, minimum)
            }
            Self::DeflatedSharpeUnrealistic { observed, maximum } => write!(
                f,
                "deflated Sharpe {:.2} above realism ceiling {:.2}",
                observed, maximum
            ),
            Self::MultipleTestingExposure { observed, maximum } => write!(
                f,
                "{} prior hypotheses considered, ceiling is {}",
                observed, maximum
            ),
        }
    }
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub passed: bool,
    pub failures: Vec<GateFailure>,
}

impl GateReport {
    pub fn has_failure(&self, code: &str) -> bool {
        self.failures.iter().any(|f| f.code() == code)
    }

    pub fn failure_codes(&self) -> Vec<&'static str> {
        self.failures.iter().map(GateFailure::code).collect()
    }
}

/// The pre-validation gate.
#[derive(Debug, Clone, Default)]
pub struct PreValidationGate {
    config: GateConfig,
}

impl PreValidationGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Runs every check and collects all failures.
    pub fn evaluate(&self, hypothesis: &Hypothesis) -> GateReport {
        let mut failures = Vec::new();

        self.check_text(hypothesis, &mut failures);
        self.check_falsifiability(hypothesis, &mut failures);
        self.check_regime_scope(hypothesis, &mut failures);
        self.check_statistics(hypothesis, &mut failures);

        GateReport {
            passed: failures.is_empty(),
            failures,
        }
    }

    fn check_text(&self, hypothesis: &Hypothesis, failures: &mut Vec<GateFailure>) {
        let minimum = self.config.min_text_len;

        let length = hypothesis.content.rationale.trim().chars().count();
        if length <= minimum {
            failures.push(GateFailure::RationaleTooShort { length, minimum });
        }

        let length = hypothesis.content.causal_mechanism.trim().chars().count();
        if length <= minimum {
            failures.push(GateFailure::CausalMechanismTooShort { length, minimum });
        }

        if hypothesis.content.counterfactual_scenario.trim().is_empty() {
            failures.push(GateFailure::CounterfactualMissing);
        }
    }

    fn check_falsifiability(&self, hypothesis: &Hypothesis, failures: &mut Vec<GateFailure>) {
        let problems = hypothesis.falsification_criteria.structural_errors();
        if !problems.is_empty() {
            failures.push(GateFailure::FalsificationCriteriaMalformed { problems });
        }
    }

    fn check_regime_scope(&self, hypothesis: &Hypothesis, failures: &mut Vec<GateFailure>) {
        if hypothesis.regime_scope.is_empty() {
            failures.push(GateFailure::RegimeScopeEmpty);
        }
        let problems = hypothesis.regime_scope.shape_errors();
        if !problems.is_empty() {
            failures.push(GateFailure::RegimeConfidenceMalformed { problems });
        }
    }

    fn check_statistics(&self, hypothesis: &Hypothesis, failures: &mut Vec<GateFailure>) {
        let inputs = &hypothesis.pre_validation;

        if inputs.sample_size_historical < self.config.min_sample_size {
            failures.push(GateFailure::SampleSizeInsufficient {
                observed: inputs.sample_size_historical,
                minimum: self.config.min_sample_size,
            });
        }

        let sharpe = inputs.deflated_sharpe_estimate;
        if sharpe.is_nan() || sharpe > self.config.max_deflated_sharpe {
            failures.push(GateFailure::DeflatedSharpeUnrealistic {
                observed: sharpe,
                maximum: self.config.max_deflated_sharpe,
            });
        }

        if inputs.prior_hypotheses_count > self.config.max_prior_hypotheses {
            failures.push(GateFailure::MultipleTestingExposure {
                observed: inputs.prior_hypotheses_count,
                maximum: self.config.max_prior_hypotheses,
            });
        }
    }
}
