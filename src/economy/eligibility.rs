//! Paper-Trading Eligibility
//!
//! Single decision point for whether a hypothesis may be handed to paper
//! trading. A hypothesis is eligible if and only if ALL of the following hold:
//!
//! 1. state is ACTIVE
//! 2. at least `min_experiments` experiments recorded
//! 3. hit rate (validated / total) ≥ `min_hit_rate`
//! 4. current confidence ≥ `min_confidence`
//! 5. falsification margin remains: `falsification_count < max_falsifications - 1`
//! 6. pre-validation passed
//! 7. a Tier-3 promotion review validated
//!
//! Every failing condition is reported as a blocker.

use crate::economy::models::{ExperimentSummary, Hypothesis, HypothesisCode, HypothesisState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    pub min_experiments: u32,
    pub min_hit_rate: f64,
    pub min_confidence: f64,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            min_experiments: 10,
            min_hit_rate: 0.6,
            min_confidence: 0.5,
        }
    }
}

impl EligibilityConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_hit_rate) {
            return Err(format!("min_hit_rate {} outside [0,1]", self.min_hit_rate));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!("min_confidence {} outside [0,1]", self.min_confidence));
        }
        Ok(())
    }
}

/// Closed set of reasons a hypothesis is not eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EligibilityBlocker {
    NotActive { state: HypothesisState },
    InsufficientExperiments { observed: u32, minimum: u32 },
    HitRateBelowFloor { observed: f64, minimum: f64 },
    ConfidenceBelowFloor { observed: f64, minimum: f64 },
    FalsificationMarginExhausted { count: u32, max: u32 },
    PreValidationNotPassed,
    PromotionNotValidated,
}

impl EligibilityBlocker {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotActive { .. } => "not_active",
            Self::InsufficientExperiments { .. } => "insufficient_experiments",
            Self::HitRateBelowFloor { .. } => "hit_rate_below_floor",
            Self::ConfidenceBelowFloor { .. } => "confidence_below_floor",
            Self::FalsificationMarginExhausted { .. } => "falsification_margin_exhausted",
            Self::PreValidationNotPassed => "pre_validation_not_passed",
            Self::PromotionNotValidated => "promotion_not_validated",
        }
    }
}

impl std::fmt::Display for EligibilityBlocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotActive { state } => write!(f, "state is {}, must be ACTIVE", state),
            Self::InsufficientExperiments { observed, minimum } => {
                write!(f, "{} experiments recorded, need {}", observed, minimum)
            }
            Self::HitRateBelowFloor { observed, minimum } => {
                write!(f, "hit rate {:.1}% below {:.1}%", observed * 100.0, minimum * 100.0)
            }
            Self::ConfidenceBelowFloor { observed, minimum } => {
                write!(f, "confidence {:.3} below {:.3}", observed, minimum)
            }
            Self::FalsificationMarginExhausted { count, max } => {
                write!(f, "{} of {} falsifications used, no margin left", count, max)
            }
            Self::PreValidationNotPassed => write!(f, "pre-validation not passed"),
            Self::PromotionNotValidated => write!(f, "no validated Tier-3 promotion review"),
        }
    }
}

/// Eligibility decision with its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityReport {
    pub code: HypothesisCode,
    pub eligible: bool,
    pub blockers: Vec<EligibilityBlocker>,
    pub summary: ExperimentSummary,
    pub hit_rate: f64,
    pub confidence: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl EligibilityReport {
    pub fn blocker_codes(&self) -> Vec<&'static str> {
        self.blockers.iter().map(EligibilityBlocker::code).collect()
    }

    pub fn is_blocked_by(&self, code: &str) -> bool {
        self.blockers.iter().any(|b| b.code() == code)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EligibilityChecker {
    config: EligibilityConfig,
}

impl EligibilityChecker {
    pub fn new(config: EligibilityConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(
        &self,
        hypothesis: &Hypothesis,
        summary: &ExperimentSummary,
        now: DateTime<Utc>,
    ) -> EligibilityReport {
        let c = &self.config;
        let mut blockers = Vec::new();

        if hypothesis.state != HypothesisState::Active {
            blockers.push(EligibilityBlocker::NotActive {
                state: hypothesis.state,
            });
        }
        if summary.total < c.min_experiments {
            blockers.push(EligibilityBlocker::InsufficientExperiments {
                observed: summary.total,
                minimum: c.min_experiments,
            });
        }
        let hit_rate = summary.hit_rate();
        if hit_rate < c.min_hit_rate {
            blockers.push(EligibilityBlocker::HitRateBelowFloor {
                observed: hit_rate,
                minimum: c.min_hit_rate,
            });
        }
        let confidence = hypothesis.confidence();
        if confidence < c.min_confidence {
            blockers.push(EligibilityBlocker::ConfidenceBelowFloor {
                observed: confidence,
                minimum: c.min_confidence,
            });
        }
        if hypothesis.falsification_count + 1 >= hypothesis.max_falsifications {
            blockers.push(EligibilityBlocker::FalsificationMarginExhausted {
                count: hypothesis.falsification_count,
                max: hypothesis.max_falsifications,
            });
        }
        if !hypothesis.pre_validation_passed {
            blockers.push(EligibilityBlocker::PreValidationNotPassed);
        }
        if !hypothesis.eligible_for_paper {
            blockers.push(EligibilityBlocker::PromotionNotValidated);
        }

        EligibilityReport {
            code: hypothesis.code.clone(),
            eligible: blockers.is_empty(),
            blockers,
            summary: *summary,
            hit_rate,
            confidence,
            evaluated_at: now,
        }
    }
}
