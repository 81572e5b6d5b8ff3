//! Confidence Updates
//!
//! Pure state transition applied for every recorded verdict:
//!
//! - VALIDATED: confidence grows by `validation_growth`, state returns to ACTIVE
//! - WEAKENED: confidence decays by the hypothesis's own rate and the
//!   falsification counter advances; reaching `max_falsifications` falsifies
//! - FALSIFIED: confidence drops to zero, terminal
//!
//! The result is capped by the guardrail ceiling and clamped to [0,1].

use crate::economy::error::{EngineError, EngineResult};
use crate::economy::models::{Hypothesis, HypothesisState, Verdict};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub validation_growth: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            validation_growth: 1.05,
        }
    }
}

impl ConfidenceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.validation_growth >= 1.0 && self.validation_growth.is_finite()) {
            return Err(format!("validation_growth {} must be >= 1", self.validation_growth));
        }
        Ok(())
    }
}

/// New confidence, state and counter after a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceUpdate {
    pub confidence: f64,
    pub state: HypothesisState,
    pub falsification_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceEngine {
    config: ConfidenceConfig,
}

impl ConfidenceEngine {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn apply(&self, hypothesis: &Hypothesis, verdict: Verdict, ceiling: f64) -> EngineResult<ConfidenceUpdate> {
        if !hypothesis.state.is_testable() {
            return Err(EngineError::InvalidStateTransition {
                code: hypothesis.code.clone(),
                from: hypothesis.state,
                attempted: "apply verdict",
            });
        }

        let current = hypothesis.confidence();
        let count = hypothesis.falsification_count;

        let update = match verdict {
            Verdict::Validated => ConfidenceUpdate {
                confidence: (current * self.config.validation_growth).min(1.0),
                state: HypothesisState::Active,
                falsification_count: count,
            },
            Verdict::Weakened => {
                let count = count + 1;
                if count >= hypothesis.max_falsifications {
                    ConfidenceUpdate {
                        confidence: 0.0,
                        state: HypothesisState::Falsified,
                        falsification_count: count,
                    }
                } else {
                    ConfidenceUpdate {
                        confidence: current * (1.0 - hypothesis.confidence_decay_rate),
                        state: HypothesisState::Weakened,
                        falsification_count: count,
                    }
                }
            }
            Verdict::Falsified => ConfidenceUpdate {
                confidence: 0.0,
                state: HypothesisState::Falsified,
                falsification_count: count,
            },
        };

        Ok(ConfidenceUpdate {
            confidence: update.confidence.min(ceiling).clamp(0.0, 1.0),
            ..update
        })
    }
}
