//! Registry Lifecycle Tests
//!
//! These tests verify that:
//! 1. DRAFT → PRE_VALIDATED → ACTIVE stamps the pre-registration once
//! 2. Locked fields reject every amendment
//! 3. Experiments commit atomically with their verdict application
//! 4. Dataset reuse and missing provenance record nothing
//! 5. Interrupted applications are repaired by reconciliation
//! 6. Worker claims never overlap

use crate::config::EngineConfig;
use crate::economy::eligibility::EligibilityChecker;
use crate::economy::error::{EngineError, EngineResult};
use crate::economy::experimentation::{ExperimentationEngine, TrialRequest};
use crate::economy::models::{
    CriterionResult, Experiment, HypothesisAmendment, HypothesisCode, HypothesisState, Tier,
    TrialClass, Verdict,
};
use crate::economy::pre_validation::GateFailure;
use crate::economy::registry::{
    test_hooks, AppliedVerdict, ApplicationOutcome, HypothesisRegistry,
};
use crate::economy::test_support::{
    error_driven_draft, evidence, losing_windows, provenance, sample_draft, winning_windows,
    ERROR_REF, SNAPSHOT_REF,
};
use chrono::{Duration, Utc};

fn registry() -> HypothesisRegistry {
    HypothesisRegistry::in_memory(&EngineConfig::default()).unwrap()
}

/// Drafts, locks and activates `code`.
fn active(registry: &HypothesisRegistry, code: &str) -> HypothesisCode {
    let h = registry.create(sample_draft(code)).unwrap();
    registry.lock(&h.code).unwrap();
    registry.activate(&h.code).unwrap();
    h.code
}

fn run(
    registry: &HypothesisRegistry,
    code: &HypothesisCode,
    tier: Tier,
    trial_class: TrialClass,
    dataset: &str,
    windows: Vec<crate::economy::criteria::WindowObservation>,
) -> EngineResult<AppliedVerdict> {
    let engine = ExperimentationEngine::new(registry.tiers().clone());
    engine.run_trial(
        registry,
        &provenance(),
        TrialRequest {
            code: code.clone(),
            tier,
            trial_class,
            evidence: evidence(dataset, windows),
        },
    )
}

fn sweep(registry: &HypothesisRegistry, code: &HypothesisCode, dataset: &str) -> AppliedVerdict {
    run(registry, code, Tier::One, TrialClass::FalsificationSweep, dataset, winning_windows(20)).unwrap()
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[test]
fn test_create_lock_activate() {
    let registry = registry();
    let draft = registry.create(sample_draft("H-LIFE")).unwrap();
    assert_eq!(draft.state, HypothesisState::Draft);
    assert_eq!(draft.current_confidence, None);
    assert_eq!(draft.current_tier, None);
    assert!(draft.pre_registration_timestamp.is_none());

    let locked = registry.lock(&draft.code).unwrap();
    assert!(locked.newly_locked);
    assert_eq!(locked.state, HypothesisState::PreValidated);
    assert!((locked.current_confidence - 0.7).abs() < 1e-12);

    let stored = registry.require(&draft.code).unwrap();
    assert!(stored.pre_validation_passed);
    assert_eq!(stored.pre_registration_timestamp, Some(locked.pre_registration_timestamp));

    let activated = registry.activate(&draft.code).unwrap();
    assert_eq!(activated.state, HypothesisState::Active);
    assert_eq!(activated.current_tier, Some(Tier::One));

    // Activation is a no-op once ACTIVE.
    let again = registry.activate(&draft.code).unwrap();
    assert_eq!(again.updated_at, activated.updated_at);
}

#[test]
fn test_create_rejects_duplicates_and_malformed_drafts() {
    let registry = registry();
    registry.create(sample_draft("H-DUP")).unwrap();
    let err = registry.create(sample_draft("H-DUP")).unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    let mut bad = sample_draft("H-BAD");
    bad.confidence_decay_rate = 0.9;
    let err = registry.create(bad).unwrap_err();
    assert!(matches!(err, EngineError::InvalidDraft(_)));
    assert!(registry.get(&HypothesisCode::new("H-BAD")).unwrap().is_none());
}

#[test]
fn test_lock_is_idempotent() {
    let registry = registry();
    let h = registry.create(sample_draft("H-IDEM")).unwrap();
    let first = registry.lock(&h.code).unwrap();
    let second = registry.lock(&h.code).unwrap();
    assert!(!second.newly_locked);
    assert_eq!(second.pre_registration_timestamp, first.pre_registration_timestamp);
    assert_eq!(second.state, HypothesisState::PreValidated);
}

#[test]
fn test_lock_rejects_failing_draft() {
    let registry = registry();
    let mut draft = sample_draft("H-THIN");
    draft.pre_validation.sample_size_historical = 10;
    let h = registry.create(draft).unwrap();

    let err = registry.lock(&h.code).unwrap_err();
    assert!(err.is_recoverable());
    match err {
        EngineError::ValidationFailure { failures, .. } => {
            assert_eq!(
                failures,
                vec![GateFailure::SampleSizeInsufficient {
                    observed: 10,
                    minimum: 30
                }]
            );
        }
        other => panic!("expected validation failure, got {:?}", other),
    }

    let stored = registry.require(&h.code).unwrap();
    assert_eq!(stored.state, HypothesisState::Draft);
    assert!(stored.pre_registration_timestamp.is_none());
}

#[test]
fn test_amend_draft_then_locked_fields_are_frozen() {
    let registry = registry();
    let h = registry.create(sample_draft("H-AMEND")).unwrap();

    let amended = registry
        .amend(
            &h.code,
            &HypothesisAmendment {
                confidence_decay_rate: Some(0.2),
                ..Default::default()
            },
        )
        .unwrap();
    assert!((amended.confidence_decay_rate - 0.2).abs() < 1e-12);

    registry.lock(&h.code).unwrap();
    let err = registry
        .amend(
            &h.code,
            &HypothesisAmendment {
                rationale: Some("A completely different story about the basis".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::ImmutabilityViolation { field: "rationale", .. }
    ));

    let stored = registry.require(&h.code).unwrap();
    assert_eq!(stored.content.rationale, h.content.rationale);
    assert!((stored.confidence_decay_rate - 0.2).abs() < 1e-12);

    // An empty amendment touches nothing.
    assert!(registry.amend(&h.code, &HypothesisAmendment::default()).is_ok());
}

#[test]
fn test_activate_and_retire_transitions() {
    let registry = registry();
    let h = registry.create(sample_draft("H-RET")).unwrap();
    let err = registry.activate(&h.code).unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidStateTransition {
            from: HypothesisState::Draft,
            ..
        }
    ));

    let retired = registry.retire(&h.code).unwrap();
    assert_eq!(retired.state, HypothesisState::Retired);
    assert_eq!(registry.retire(&h.code).unwrap().state, HypothesisState::Retired);
    assert!(registry.activate(&h.code).is_err());
}

#[test]
fn test_list_filters_by_state() {
    let registry = registry();
    active(&registry, "H-L1");
    registry.create(sample_draft("H-L2")).unwrap();
    registry.create(sample_draft("H-L3")).unwrap();

    assert_eq!(registry.list(None).unwrap().len(), 3);
    let drafts = registry.list(Some(HypothesisState::Draft)).unwrap();
    let codes: Vec<_> = drafts.iter().map(|h| h.code.as_str()).collect();
    assert_eq!(codes, vec!["H-L2", "H-L3"]);
}

// =============================================================================
// EXPERIMENTS
// =============================================================================

#[test]
fn test_validated_sweep_advances_to_tier_two() {
    let registry = registry();
    let code = active(&registry, "H-T1");

    let applied = sweep(&registry, &code, "ds-1");
    assert_eq!(applied.verdict, Verdict::Validated);
    assert_eq!(applied.outcome, ApplicationOutcome::Applied);
    assert_eq!(applied.tier_after, Some(Tier::Two));
    assert!((applied.confidence_before - 0.7).abs() < 1e-12);
    assert!((applied.confidence_after - 0.735).abs() < 1e-9);

    let h = registry.require(&code).unwrap();
    assert_eq!(h.state, HypothesisState::Active);
    assert_eq!(h.current_tier, Some(Tier::Two));

    let experiments = registry.experiments(&code).unwrap();
    assert_eq!(experiments.len(), 1);
    assert_eq!(experiments[0].criteria.len(), 6);
    assert_eq!(experiments[0].regime_snapshot_ref, SNAPSHOT_REF);
    assert!(registry.application(&applied.experiment_id).unwrap().is_some());
}

#[test]
fn test_failed_sweep_falsifies_and_closes_the_hypothesis() {
    let registry = registry();
    let code = active(&registry, "H-DEAD");

    let applied = run(
        &registry,
        &code,
        Tier::One,
        TrialClass::FalsificationSweep,
        "ds-1",
        losing_windows(20),
    )
    .unwrap();
    assert_eq!(applied.verdict, Verdict::Falsified);
    assert_eq!(applied.state_after, HypothesisState::Falsified);
    assert_eq!(applied.confidence_after, 0.0);

    let err = sweep_err(&registry, &code, "ds-2");
    assert!(matches!(
        err,
        EngineError::InvalidStateTransition {
            from: HypothesisState::Falsified,
            ..
        }
    ));
    assert!(registry.retire(&code).is_err());
}

fn sweep_err(registry: &HypothesisRegistry, code: &HypothesisCode, dataset: &str) -> EngineError {
    run(registry, code, Tier::One, TrialClass::FalsificationSweep, dataset, winning_windows(20)).unwrap_err()
}

#[test]
fn test_retired_hypothesis_accepts_no_experiments() {
    let registry = registry();
    let code = active(&registry, "H-OLD");
    registry.retire(&code).unwrap();
    let err = sweep_err(&registry, &code, "ds-1");
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    assert!(registry.experiments(&code).unwrap().is_empty());
}

#[test]
fn test_dataset_reuse_is_rejected_without_authorization() {
    let registry = registry();
    let code = active(&registry, "H-REUSE");
    sweep(&registry, &code, "ds-0");

    run(&registry, &code, Tier::Two, TrialClass::TailConditionStress, "ds-1", winning_windows(20)).unwrap();
    let err = run(
        &registry,
        &code,
        Tier::Two,
        TrialClass::TailConditionStress,
        "ds-1",
        winning_windows(20),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::DatasetReuseViolation { .. }));
    assert!(err.is_recoverable());

    // The rejected attempt left no trace.
    assert_eq!(registry.experiments(&code).unwrap().len(), 2);
    let entry = registry.guardrail_entry(&code).unwrap();
    assert_eq!(entry.degrees_of_freedom, 2);
    assert!((entry.confidence_ceiling - 0.98).abs() < 1e-12);

    // An authorized reuse goes through and is counted.
    let mut authorized = evidence("ds-1", winning_windows(20));
    authorized.reuse_authorized = true;
    ExperimentationEngine::new(registry.tiers().clone())
        .run_trial(
            &registry,
            &provenance(),
            TrialRequest {
                code: code.clone(),
                tier: Tier::Two,
                trial_class: TrialClass::TailConditionStress,
                evidence: authorized,
            },
        )
        .unwrap();
    let entry = registry.guardrail_entry(&code).unwrap();
    let usage = entry
        .datasets
        .iter()
        .find(|d| d.dataset_signature == "ds-1")
        .unwrap();
    assert_eq!(usage.uses, 2);
    assert_eq!(entry.degrees_of_freedom, 3);
}

#[test]
fn test_missing_provenance_records_nothing() {
    let registry = registry();
    let code = active(&registry, "H-PROV");

    let mut orphan = evidence("ds-1", winning_windows(20));
    orphan.regime_snapshot_ref = "snap-unknown".into();
    let err = ExperimentationEngine::new(registry.tiers().clone())
        .run_trial(
            &registry,
            &provenance(),
            TrialRequest {
                code: code.clone(),
                tier: Tier::One,
                trial_class: TrialClass::FalsificationSweep,
                evidence: orphan,
            },
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::ProvenanceMissing { .. }));
    assert!(registry.experiments(&code).unwrap().is_empty());
    assert!(!registry.dataset_used(&code, "ds-1").unwrap());
}

#[test]
fn test_error_driven_hypothesis_must_cite_its_error() {
    let registry = registry();
    let h = registry.create(error_driven_draft("H-ERR")).unwrap();
    registry.lock(&h.code).unwrap();
    registry.activate(&h.code).unwrap();

    let err = sweep_err(&registry, &h.code, "ds-1");
    assert!(matches!(err, EngineError::ProvenanceMissing { .. }));

    let mut cited = evidence("ds-1", winning_windows(20));
    cited.error_ref = Some(ERROR_REF.into());
    let applied = ExperimentationEngine::new(registry.tiers().clone())
        .run_trial(
            &registry,
            &provenance(),
            TrialRequest {
                code: h.code.clone(),
                tier: Tier::One,
                trial_class: TrialClass::FalsificationSweep,
                evidence: cited,
            },
        )
        .unwrap();
    let experiment = registry.experiment(&applied.experiment_id).unwrap().unwrap();
    assert_eq!(experiment.error_ref.as_deref(), Some(ERROR_REF));
}

#[test]
fn test_trial_must_match_tier() {
    let registry = registry();
    let code = active(&registry, "H-TIER");

    let err = run(&registry, &code, Tier::One, TrialClass::WalkForward, "ds-1", winning_windows(20))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::TrialNotPermitted {
            tier: Tier::One,
            trial_class: TrialClass::WalkForward
        }
    ));

    let err = run(&registry, &code, Tier::Two, TrialClass::WalkForward, "ds-1", winning_windows(20))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::TierMismatch {
            current: Some(Tier::One),
            requested: Tier::Two,
            ..
        }
    ));

    let err = run(
        &registry,
        &code,
        Tier::One,
        TrialClass::MechanismInversion,
        "ds-1",
        winning_windows(20),
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::TrialNotPermitted { .. }));
    assert!(registry.experiments(&code).unwrap().is_empty());
}

#[test]
fn test_apply_verdict_is_idempotent() {
    let registry = registry();
    let code = active(&registry, "H-APPLY");
    let applied = sweep(&registry, &code, "ds-1");
    let before = registry.require(&code).unwrap();

    let again = registry.apply_verdict(&applied.experiment_id).unwrap();
    assert_eq!(again.experiment_id, applied.experiment_id);
    assert_eq!(again.state_after, applied.state_after);
    assert!((again.confidence_after - applied.confidence_after).abs() < 1e-12);

    let after = registry.require(&code).unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.current_confidence, before.current_confidence);

    let err = registry.apply_verdict("no-such-experiment").unwrap_err();
    assert!(matches!(err, EngineError::NotFound { kind: "Experiment", .. }));
    assert_eq!(err.to_string(), "Experiment not found: no-such-experiment");
}

fn interrupted_sweep(code: &HypothesisCode, id: &str) -> Experiment {
    Experiment {
        id: id.to_string(),
        hypothesis_code: code.clone(),
        tier: Tier::One,
        trial_class: TrialClass::FalsificationSweep,
        dataset_signature: "ds-crash".to_string(),
        regime_snapshot_ref: SNAPSHOT_REF.to_string(),
        error_ref: None,
        reuse_authorized: false,
        criteria: vec![CriterionResult::at_least("sign_stability", 1.0, 0.8)],
        advisory_score: 1.0,
        verdict: Verdict::Validated,
        created_at: Utc::now(),
    }
}

#[test]
fn test_reconcile_applies_interrupted_experiments() {
    let registry = registry();
    let code = active(&registry, "H-CRASH");
    test_hooks::append_unapplied(&registry, &interrupted_sweep(&code, "exp-crash")).unwrap();

    // Recorded but not yet applied.
    assert!(registry.application("exp-crash").unwrap().is_none());
    assert_eq!(registry.require(&code).unwrap().current_tier, Some(Tier::One));

    let report = registry.reconcile().unwrap();
    assert_eq!(report.applied, vec!["exp-crash".to_string()]);
    assert!(report.failed.is_empty());

    let h = registry.require(&code).unwrap();
    assert_eq!(h.current_tier, Some(Tier::Two));
    assert!((h.confidence() - 0.735).abs() < 1e-9);

    assert!(registry.reconcile().unwrap().is_empty());
}

#[test]
fn test_reconcile_skips_terminal_hypotheses() {
    let registry = registry();
    let code = active(&registry, "H-GONE");
    registry.retire(&code).unwrap();
    test_hooks::append_unapplied(&registry, &interrupted_sweep(&code, "exp-late")).unwrap();

    let report = registry.reconcile().unwrap();
    assert_eq!(report.skipped, vec!["exp-late".to_string()]);
    let application = registry.application("exp-late").unwrap().unwrap();
    assert_eq!(application.outcome, ApplicationOutcome::SkippedTerminal);
    assert_eq!(registry.require(&code).unwrap().state, HypothesisState::Retired);
}

#[test]
fn test_death_rates_per_tier() {
    let registry = registry();
    let a = active(&registry, "H-DR-A");
    let b = active(&registry, "H-DR-B");
    sweep(&registry, &a, "ds-1");
    run(&registry, &b, Tier::One, TrialClass::FalsificationSweep, "ds-1", losing_windows(20)).unwrap();

    let rates = registry.death_rates().unwrap();
    assert_eq!(rates.len(), 1);
    assert_eq!(rates[0].tier, Tier::One);
    assert_eq!(rates[0].experiments, 2);
    assert_eq!(rates[0].falsified, 1);
    assert!((rates[0].observed - 0.5).abs() < 1e-12);
    assert!(!rates[0].within_target());
}

// =============================================================================
// CLAIMS & PROJECTIONS
// =============================================================================

#[test]
fn test_claims_are_disjoint_until_released() {
    let registry = registry();
    for i in 0..5 {
        registry.create(sample_draft(&format!("H-C{}", i))).unwrap();
    }
    let states = [HypothesisState::Draft];
    let lease = Duration::seconds(60);

    let first = registry.claim(&states, 3, lease).unwrap();
    let second = registry.claim(&states, 3, lease).unwrap();
    let third = registry.claim(&states, 3, lease).unwrap();
    assert_eq!(first.hypotheses.len(), 3);
    assert_eq!(second.hypotheses.len(), 2);
    assert!(third.is_empty());

    let overlap = first
        .hypotheses
        .iter()
        .filter(|h| second.hypotheses.iter().any(|o| o.code == h.code))
        .count();
    assert_eq!(overlap, 0);

    assert_eq!(registry.release(&first).unwrap(), 3);
    assert_eq!(registry.claim(&states, 10, lease).unwrap().hypotheses.len(), 3);
}

#[test]
fn test_expired_claims_are_reclaimable() {
    let registry = registry();
    registry.create(sample_draft("H-LEASE")).unwrap();
    let states = [HypothesisState::Draft];

    let stale = registry.claim(&states, 10, Duration::seconds(-1)).unwrap();
    assert_eq!(stale.hypotheses.len(), 1);
    let fresh = registry.claim(&states, 10, Duration::seconds(60)).unwrap();
    assert_eq!(fresh.hypotheses.len(), 1);

    // Releasing the stale claim must not free the fresh one.
    assert_eq!(registry.release(&stale).unwrap(), 0);
    assert!(registry.claim(&states, 10, Duration::seconds(60)).unwrap().is_empty());
}

#[test]
fn test_eligibility_projection_is_latest_only() {
    let registry = registry();
    let code = active(&registry, "H-PROJ");
    let checker = EligibilityChecker::default();

    assert!(registry.latest_eligibility(&code).unwrap().is_none());
    let h = registry.require(&code).unwrap();
    let summary = registry.experiment_summary(&code).unwrap();
    let report = checker.evaluate(&h, &summary, Utc::now());
    registry.record_eligibility(&report).unwrap();

    sweep(&registry, &code, "ds-1");
    let h = registry.require(&code).unwrap();
    let summary = registry.experiment_summary(&code).unwrap();
    assert_eq!(summary.total, 1);
    let newer = checker.evaluate(&h, &summary, Utc::now());
    registry.record_eligibility(&newer).unwrap();

    let stored = registry.latest_eligibility(&code).unwrap().unwrap();
    assert!(!stored.eligible);
    assert_eq!(stored.summary.total, 1);
    assert_eq!(stored.blocker_codes(), newer.blocker_codes());
    assert!(stored.is_blocked_by("insufficient_experiments"));
}

/// Records an eligible projection for `code` as the worker would.
fn record_eligible(registry: &HypothesisRegistry, code: &HypothesisCode) {
    let mut h = registry.require(code).unwrap();
    h.eligible_for_paper = true;
    let summary = crate::economy::models::ExperimentSummary {
        total: 10,
        validated: 10,
        weakened: 0,
        falsified: 0,
    };
    let report = EligibilityChecker::default().evaluate(&h, &summary, Utc::now());
    assert!(report.eligible, "{:?}", report.blockers);
    registry.record_eligibility(&report).unwrap();
}

#[test]
fn test_retire_withdraws_eligibility() {
    let registry = registry();
    let code = active(&registry, "H-RET-ELIG");
    record_eligible(&registry, &code);

    registry.retire(&code).unwrap();
    let projection = registry.latest_eligibility(&code).unwrap().unwrap();
    assert!(!projection.eligible);
    assert!(projection.is_blocked_by("not_active"));
}

#[test]
fn test_falsification_withdraws_eligibility() {
    let registry = registry();
    let code = active(&registry, "H-FALL");
    record_eligible(&registry, &code);

    run(&registry, &code, Tier::One, TrialClass::FalsificationSweep, "ds-1", losing_windows(20)).unwrap();
    let projection = registry.latest_eligibility(&code).unwrap().unwrap();
    assert!(!projection.eligible);
    assert!(projection.is_blocked_by("not_active"));
    assert_eq!(projection.summary.total, 1);
}
