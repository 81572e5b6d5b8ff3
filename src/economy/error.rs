//! Engine Error Taxonomy
//!
//! Every rejection is local to the operation that raised it and never rolls
//! back another hypothesis's progress. Recoverable errors carry enough detail
//! for the caller to correct and resubmit; the rest indicate a caller defect.

use crate::economy::models::{HypothesisCode, HypothesisState, Tier, TrialClass};
use crate::economy::pre_validation::GateFailure;

/// Errors raised by the hypothesis economy engine.
#[derive(Debug)]
pub enum EngineError {
    /// The pre-validation gate rejected the hypothesis.
    ValidationFailure {
        code: HypothesisCode,
        failures: Vec<GateFailure>,
    },
    /// Attempted mutation of a field frozen by pre-registration.
    ImmutabilityViolation {
        code: HypothesisCode,
        field: &'static str,
    },
    /// Dataset already consumed by this hypothesis, reuse not authorized.
    DatasetReuseViolation {
        code: HypothesisCode,
        dataset_signature: String,
    },
    /// Regime snapshot or originating error reference absent or unresolvable.
    ProvenanceMissing {
        code: HypothesisCode,
        missing: String,
    },
    /// Operation not allowed from the hypothesis's current state.
    InvalidStateTransition {
        code: HypothesisCode,
        from: HypothesisState,
        attempted: &'static str,
    },
    /// Trial class not permitted at the requested tier.
    TrialNotPermitted { tier: Tier, trial_class: TrialClass },
    /// Experiment targets a tier other than the hypothesis's current tier.
    TierMismatch {
        code: HypothesisCode,
        current: Option<Tier>,
        requested: Tier,
    },
    /// Draft failed shape validation and cannot be stored.
    InvalidDraft(String),
    NotFound { kind: &'static str, id: String },
    AlreadyExists(String),
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
}

impl EngineError {
    /// Whether the caller can correct the input and resubmit.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailure { .. }
                | Self::DatasetReuseViolation { .. }
                | Self::ProvenanceMissing { .. }
                | Self::InvalidDraft(_)
        )
    }

    /// Stable snake_case reason for logs and worker reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ValidationFailure { .. } => "validation_failure",
            Self::ImmutabilityViolation { .. } => "immutability_violation",
            Self::DatasetReuseViolation { .. } => "dataset_reuse_violation",
            Self::ProvenanceMissing { .. } => "provenance_missing",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::TrialNotPermitted { .. } => "trial_not_permitted",
            Self::TierMismatch { .. } => "tier_mismatch",
            Self::InvalidDraft(_) => "invalid_draft",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::Sqlite(_) => "sqlite",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidationFailure { code, failures } => {
                write!(f, "Pre-validation failed for {} with {} reason(s):", code, failures.len())?;
                for failure in failures {
                    write!(f, " [{}: {}]", failure.code(), failure)?;
                }
                Ok(())
            }
            Self::ImmutabilityViolation { code, field } => write!(
                f,
                "Immutability violation: {} is locked, field '{}' cannot change",
                code, field
            ),
            Self::DatasetReuseViolation {
                code,
                dataset_signature,
            } => write!(
                f,
                "Dataset reuse violation: {} already consumed dataset '{}' without authorization",
                code, dataset_signature
            ),
            Self::ProvenanceMissing { code, missing } => {
                write!(f, "Provenance missing for {}: {}", code, missing)
            }
            Self::InvalidStateTransition {
                code,
                from,
                attempted,
            } => write!(
                f,
                "Invalid state transition for {}: cannot {} from {}",
                code, attempted, from
            ),
            Self::TrialNotPermitted { tier, trial_class } => {
                write!(f, "Trial class {} is not permitted at {}", trial_class, tier)
            }
            Self::TierMismatch {
                code,
                current,
                requested,
            } => match current {
                Some(current) => write!(
                    f,
                    "Tier mismatch for {}: currently at {}, requested {}",
                    code, current, requested
                ),
                None => write!(
                    f,
                    "Tier mismatch for {}: not yet tiered, requested {}",
                    code, requested
                ),
            },
            Self::InvalidDraft(reason) => write!(f, "Invalid draft: {}", reason),
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists(code) => write!(f, "Hypothesis already exists: {}", code),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability_classification() {
        let code = HypothesisCode::new("H-1");
        assert!(EngineError::DatasetReuseViolation {
            code: code.clone(),
            dataset_signature: "ds".into()
        }
        .is_recoverable());
        assert!(EngineError::ProvenanceMissing {
            code: code.clone(),
            missing: "regime snapshot".into()
        }
        .is_recoverable());
        assert!(!EngineError::ImmutabilityViolation {
            code: code.clone(),
            field: "rationale"
        }
        .is_recoverable());
        assert!(!EngineError::InvalidStateTransition {
            code,
            from: HypothesisState::Falsified,
            attempted: "apply verdict",
        }
        .is_recoverable());
    }

    #[test]
    fn test_validation_failure_lists_every_reason() {
        let err = EngineError::ValidationFailure {
            code: HypothesisCode::new("H-2"),
            failures: vec![
                GateFailure::SampleSizeInsufficient {
                    observed: 25,
                    minimum: 30,
                },
                GateFailure::RegimeScopeEmpty,
            ],
        };
        let message = err.to_string();
        assert!(message.contains("sample_size_insufficient"));
        assert!(message.contains("regime_scope_empty"));
        assert_eq!(err.reason_code(), "validation_failure");
    }

    #[test]
    fn test_not_found_names_the_entity() {
        let err = EngineError::NotFound {
            kind: "Experiment",
            id: "exp-9".into(),
        };
        assert_eq!(err.to_string(), "Experiment not found: exp-9");
        assert_eq!(err.reason_code(), "not_found");
    }
}
