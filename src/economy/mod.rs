//! Hypothesis Economy Engine
//!
//! Lifecycle manager for falsifiable predictive hypotheses: origination,
//! mandatory pre-validation, tiered experimentation under anti-overfitting
//! guardrails, confidence decay, and terminal falsification or graduation
//! toward paper-trading eligibility.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   drafts   ┌──────────────────────────────────────────┐
//! │ OriginFeed   │───────────▶│            HypothesisRegistry            │
//! └──────────────┘            │  (SQLite, single source of truth)        │
//!                             └──────────────────────────────────────────┘
//!                                 │ lock          │ commit_experiment
//!                                 ▼               ▼
//!                     ┌──────────────────┐  ┌──────────────────────────┐
//!                     │ PreValidationGate│  │ Guardrail (provenance,   │
//!                     │ (pure)           │  │ reuse, DoF ceiling)      │
//!                     └──────────────────┘  └────────────┬─────────────┘
//!                                                        ▼
//!                                        ┌──────────────────────────────┐
//!                                        │ ExperimentationEngine (T1-3) │
//!                                        └──────────────┬───────────────┘
//!                                                       ▼
//!                                        ┌──────────────────────────────┐
//!                                        │ ConfidenceEngine (pure)      │
//!                                        └──────────────┬───────────────┘
//!                                                       ▼
//!                                        ┌──────────────────────────────┐
//!                                        │ EligibilityChecker (pure)    │
//!                                        └──────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! DRAFT ──lock──▶ PRE_VALIDATED ──activate──▶ ACTIVE ◀──VALIDATED── WEAKENED
//!                                               │  ──WEAKENED──▶      │
//!                                               ▼                     ▼
//!                                           FALSIFIED             FALSIFIED
//! (any non-terminal) ──retire──▶ RETIRED
//! ```
//!
//! Once a hypothesis is locked its content, claim, regime scope and
//! falsifiability fields are frozen; only confidence, the falsification
//! counter, the tier and the state change afterward.

pub mod confidence;
pub mod criteria;
pub mod eligibility;
pub mod error;
pub mod experimentation;
pub mod guardrail;
pub mod models;
pub mod pre_validation;
pub mod registry;
pub mod sources;
pub mod stats;
pub mod workers;

#[cfg(test)]
pub(crate) mod test_support;
#[cfg(test)]
mod registry_tests;

// Re-exports for convenience
pub use confidence::{ConfidenceConfig, ConfidenceEngine, ConfidenceUpdate};
pub use criteria::{CriteriaThresholds, TrialEvidence, TrialMetrics, WindowObservation};
pub use eligibility::{EligibilityBlocker, EligibilityChecker, EligibilityConfig, EligibilityReport};
pub use error::{EngineError, EngineResult};
pub use experimentation::{ExperimentationEngine, TierConfig, TrialOutcome, TrialRequest};
pub use guardrail::{Guardrail, GuardrailConfig, GuardrailEntry};
pub use models::{
    Direction, Experiment, ExperimentSummary, Hypothesis, HypothesisAmendment, HypothesisCode,
    HypothesisDraft, HypothesisState, OriginType, Tier, TrialClass, Verdict,
};
pub use pre_validation::{GateConfig, GateFailure, GateReport, PreValidationGate};
pub use registry::{AppliedVerdict, HypothesisRegistry, LockOutcome, ReconcileReport};
pub use sources::{EvidenceSource, InMemorySources, JsonDirectorySource, OriginFeed, ProvenanceSource};
pub use workers::{
    EligibilityWorker, ExperimentationWorker, GateLockWorker, OriginationWorker, Worker,
    WorkerConfig, WorkerKind, WorkerRunReport,
};
