//! Shared fixtures for unit tests.

use crate::economy::criteria::{TrialEvidence, WindowObservation};
use crate::economy::models::{
    Comparison, Direction, DirectionalClaim, EconomicContent, ErrorPriority, ErrorRecord,
    FalsificationCriteria, FalsificationMetric, Hypothesis, HypothesisCode, HypothesisDraft,
    HypothesisState, MagnitudeClass, Origin, PreValidationInputs, RegimeScope, RegimeSnapshot,
    Tier,
};
use crate::economy::sources::InMemorySources;
use chrono::{DateTime, Duration, TimeZone, Utc};

pub const SNAPSHOT_REF: &str = "snap-2024-01";
pub const ERROR_REF: &str = "err-0001";

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now)
}

/// Draft that passes every gate check.
pub fn sample_draft(code: &str) -> HypothesisDraft {
    HypothesisDraft {
        code: HypothesisCode::new(code),
        content: EconomicContent {
            rationale: "Funding rate extremes precede mean reversion in perpetual futures basis".into(),
            causal_mechanism: "Crowded leveraged longs pay funding until liquidations force the basis back"
                .into(),
            behavioral_basis: Some("herding".into()),
            counterfactual_scenario: "Basis keeps widening for a full horizon after the extreme".into(),
        },
        claim: DirectionalClaim {
            direction: Direction::Bullish,
            magnitude_class: MagnitudeClass::Medium,
            horizon_hours: 24.0,
        },
        regime_scope: RegimeScope::new(["trending", "ranging"]).with_confidence("trending", 0.7),
        falsification_criteria: FalsificationCriteria {
            metric: FalsificationMetric::DirectionalAccuracy,
            falsify_when: Comparison::Below,
            threshold: 0.52,
            evaluation_window_hours: 720.0,
        },
        confidence_decay_rate: 0.1,
        max_falsifications: 3,
        pre_validation: PreValidationInputs {
            sample_size_historical: 120,
            prior_hypotheses_count: 4,
            deflated_sharpe_estimate: 0.9,
        },
        initial_confidence: 0.7,
        origin: Origin::theory(),
    }
}

pub fn error_driven_draft(code: &str) -> HypothesisDraft {
    HypothesisDraft {
        origin: Origin::error_driven(ERROR_REF),
        ..sample_draft(code)
    }
}

/// Locked, ACTIVE hypothesis at Tier 1.
pub fn sample_hypothesis(code: &str) -> Hypothesis {
    let now = base_time();
    let mut h = Hypothesis::from_draft(sample_draft(code), now);
    h.pre_validation_passed = true;
    h.pre_registration_timestamp = Some(now);
    h.current_confidence = Some(h.initial_confidence);
    h.state = HypothesisState::Active;
    h.current_tier = Some(Tier::One);
    h
}

/// One daily window starting `day` days after the base time.
pub fn window(
    day: i64,
    regime: &str,
    hits: u32,
    trials: u32,
    mean_return_pct: f64,
    direction_flipped: bool,
) -> WindowObservation {
    WindowObservation {
        window_start: base_time() + Duration::days(day),
        regime: regime.to_string(),
        hits,
        trials,
        mean_return_pct,
        direction_flipped,
        regime_transition: false,
    }
}

/// Daily windows that clear every Tier-1 and Tier-3 threshold for a
/// bullish claim over trending/ranging.
pub fn winning_windows(n: i64) -> Vec<WindowObservation> {
    (0..n)
        .map(|day| {
            let regime = if day % 2 == 0 { "trending" } else { "ranging" };
            window(day, regime, 7, 10, 3.0, false)
        })
        .collect()
}

/// Daily windows where the bullish claim goes the wrong way.
pub fn losing_windows(n: i64) -> Vec<WindowObservation> {
    (0..n)
        .map(|day| {
            let regime = if day % 2 == 0 { "trending" } else { "ranging" };
            window(day, regime, 3, 10, -2.5, day % 3 == 0)
        })
        .collect()
}

pub fn evidence(dataset_signature: &str, windows: Vec<WindowObservation>) -> TrialEvidence {
    TrialEvidence {
        dataset_signature: dataset_signature.to_string(),
        regime_snapshot_ref: SNAPSHOT_REF.to_string(),
        error_ref: None,
        reuse_authorized: false,
        windows,
    }
}

/// Provenance store that resolves [`SNAPSHOT_REF`] and [`ERROR_REF`].
pub fn provenance() -> InMemorySources {
    let sources = InMemorySources::default();
    sources.add_snapshot(RegimeSnapshot {
        id: SNAPSHOT_REF.to_string(),
        regime: "trending".to_string(),
        captured_at: base_time(),
    });
    sources.add_error(ErrorRecord {
        id: ERROR_REF.to_string(),
        predicted_direction: Direction::Bearish,
        actual_direction: Direction::Bullish,
        magnitude_pct: 4.2,
        regime_at_prediction: "ranging".to_string(),
        regime_at_outcome: "trending".to_string(),
        priority: ErrorPriority::High,
    });
    sources
}
