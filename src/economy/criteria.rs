//! Trial Criteria
//!
//! Turns historical window evidence into the metrics every tier judges a
//! hypothesis on, and evaluates the Tier-1 falsification sweep.
//!
//! # Metrics
//!
//! - **Sign stability**: share of windows whose mean return sign matches the claim
//! - **Regime consistency**: share of observed valid regimes whose pooled return matches
//! - **Temporal stability**: share of windows without a direction flip
//! - **Directional accuracy**: pooled hits / trials
//! - **Aligned return**: mean return in the claimed direction (%)
//!
//! NEUTRAL claims "match" a window when its absolute return stays inside the
//! magnitude floor, and their aligned return is the mean absolute return,
//! which must stay *below* the floor.
//!
//! The sweep is a binary AND. The weight table below feeds a diagnostic
//! score only; it never grants partial credit.

use crate::economy::models::{
    CriterionResult, Direction, FalsificationMetric, Hypothesis, RegimeScope,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SIGN_STABILITY: &str = "sign_stability";
pub const REGIME_CONSISTENCY: &str = "regime_consistency";
pub const TEMPORAL_STABILITY: &str = "temporal_stability";
pub const DIRECTIONAL_ACCURACY: &str = "directional_accuracy";
pub const MAGNITUDE_FLOOR: &str = "magnitude_floor";
pub const OWN_FALSIFICATION_RULE: &str = "own_falsification_rule";

/// Diagnostic weights of the six sweep criteria.
pub const ADVISORY_WEIGHTS: [(&str, f64); 6] = [
    (SIGN_STABILITY, 0.20),
    (REGIME_CONSISTENCY, 0.15),
    (TEMPORAL_STABILITY, 0.15),
    (DIRECTIONAL_ACCURACY, 0.20),
    (MAGNITUDE_FLOOR, 0.15),
    (OWN_FALSIFICATION_RULE, 0.15),
];

// =============================================================================
// EVIDENCE
// =============================================================================

/// One historical window the hypothesis is tested against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowObservation {
    pub window_start: DateTime<Utc>,
    pub regime: String,
    /// Predictions in this window that went the claimed way.
    pub hits: u32,
    pub trials: u32,
    pub mean_return_pct: f64,
    /// The realized direction reversed inside the evaluation window.
    #[serde(default)]
    pub direction_flipped: bool,
    /// Window straddles a regime change.
    #[serde(default)]
    pub regime_transition: bool,
}

/// Evidence bundle for one trial, with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialEvidence {
    /// Identifies the historical slice used.
    pub dataset_signature: String,
    pub regime_snapshot_ref: String,
    #[serde(default)]
    pub error_ref: Option<String>,
    #[serde(default)]
    pub reuse_authorized: bool,
    pub windows: Vec<WindowObservation>,
}

// =============================================================================
// THRESHOLDS
// =============================================================================

/// Pass thresholds for the core criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriteriaThresholds {
    pub sign_stability: f64,
    pub regime_consistency: f64,
    pub temporal_stability: f64,
    pub directional_accuracy: f64,
    /// Transaction-cost-plus-noise floor, in percent.
    pub min_magnitude_pct: f64,
}

impl Default for CriteriaThresholds {
    fn default() -> Self {
        Self::falsification_sweep()
    }
}

impl CriteriaThresholds {
    /// Tier-1 thresholds.
    pub fn falsification_sweep() -> Self {
        Self {
            sign_stability: 0.80,
            regime_consistency: 0.75,
            temporal_stability: 0.85,
            directional_accuracy: 0.55,
            min_magnitude_pct: 2.0,
        }
    }

    /// Tier-3 full-discipline thresholds.
    pub fn promotion_review() -> Self {
        Self {
            sign_stability: 0.85,
            regime_consistency: 0.80,
            temporal_stability: 0.90,
            directional_accuracy: 0.58,
            min_magnitude_pct: 2.5,
        }
    }

    /// Rates that fall outside [0,1] or a non-positive floor.
    pub fn shape_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, value) in [
            (SIGN_STABILITY, self.sign_stability),
            (REGIME_CONSISTENCY, self.regime_consistency),
            (TEMPORAL_STABILITY, self.temporal_stability),
            (DIRECTIONAL_ACCURACY, self.directional_accuracy),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{} threshold {} outside [0,1]", name, value));
            }
        }
        if !(self.min_magnitude_pct > 0.0) {
            errors.push(format!("min_magnitude_pct {} must be positive", self.min_magnitude_pct));
        }
        errors
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Metrics computed from a set of windows for one directional claim.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialMetrics {
    pub sign_stability: f64,
    pub regime_consistency: f64,
    pub temporal_stability: f64,
    pub directional_accuracy: f64,
    pub aligned_return_pct: f64,
    pub windows: usize,
    pub pooled_trials: u64,
}

impl TrialMetrics {
    /// Computes metrics for `direction` over `windows`. An empty window set
    /// yields all-zero metrics, which fail every ratio threshold.
    pub fn compute(
        direction: Direction,
        scope: &RegimeScope,
        windows: &[WindowObservation],
        neutral_band_pct: f64,
    ) -> Self {
        if windows.is_empty() {
            return Self {
                sign_stability: 0.0,
                regime_consistency: 0.0,
                temporal_stability: 0.0,
                directional_accuracy: 0.0,
                aligned_return_pct: 0.0,
                windows: 0,
                pooled_trials: 0,
            };
        }

        let n = windows.len() as f64;
        let matches = |r: f64| match direction {
            Direction::Neutral => r.abs() < neutral_band_pct,
            d => d.sign() * r > 0.0,
        };

        let sign_matches = windows.iter().filter(|w| matches(w.mean_return_pct)).count();
        let stable = windows.iter().filter(|w| !w.direction_flipped).count();

        let mut by_regime: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for w in windows.iter().filter(|w| scope.contains(&w.regime)) {
            let entry = by_regime.entry(w.regime.as_str()).or_insert((0.0, 0));
            entry.0 += w.mean_return_pct;
            entry.1 += 1;
        }
        let regime_consistency = if by_regime.is_empty() {
            0.0
        } else {
            let consistent = by_regime
                .values()
                .filter(|(sum, count)| matches(sum / *count as f64))
                .count();
            consistent as f64 / by_regime.len() as f64
        };

        let hits: u64 = windows.iter().map(|w| u64::from(w.hits.min(w.trials))).sum();
        let trials: u64 = windows.iter().map(|w| u64::from(w.trials)).sum();
        let directional_accuracy = if trials > 0 {
            hits as f64 / trials as f64
        } else {
            0.0
        };

        let aligned_return_pct = match direction {
            Direction::Neutral => windows.iter().map(|w| w.mean_return_pct.abs()).sum::<f64>() / n,
            d => windows.iter().map(|w| d.sign() * w.mean_return_pct).sum::<f64>() / n,
        };

        Self {
            sign_stability: sign_matches as f64 / n,
            regime_consistency,
            temporal_stability: stable as f64 / n,
            directional_accuracy,
            aligned_return_pct,
            windows: windows.len(),
            pooled_trials: trials,
        }
    }

    /// Value of the metric a falsification rule is stated against.
    pub fn value(&self, metric: FalsificationMetric) -> f64 {
        match metric {
            FalsificationMetric::DirectionalAccuracy => self.directional_accuracy,
            FalsificationMetric::SignStability => self.sign_stability,
            FalsificationMetric::RegimeConsistency => self.regime_consistency,
            FalsificationMetric::TemporalStability => self.temporal_stability,
            FalsificationMetric::AlignedReturnPct => self.aligned_return_pct,
        }
    }

    /// Magnitude check, inverted for NEUTRAL claims.
    pub fn magnitude_criterion(&self, direction: Direction, floor_pct: f64) -> CriterionResult {
        match direction {
            Direction::Neutral => {
                CriterionResult::at_most(MAGNITUDE_FLOOR, self.aligned_return_pct, floor_pct)
            }
            _ => CriterionResult::at_least(MAGNITUDE_FLOOR, self.aligned_return_pct, floor_pct),
        }
    }

    /// The five threshold criteria, in canonical order.
    pub fn threshold_criteria(
        &self,
        direction: Direction,
        thresholds: &CriteriaThresholds,
    ) -> Vec<CriterionResult> {
        vec![
            CriterionResult::at_least(SIGN_STABILITY, self.sign_stability, thresholds.sign_stability),
            CriterionResult::at_least(
                REGIME_CONSISTENCY,
                self.regime_consistency,
                thresholds.regime_consistency,
            ),
            CriterionResult::at_least(
                TEMPORAL_STABILITY,
                self.temporal_stability,
                thresholds.temporal_stability,
            ),
            CriterionResult::at_least(
                DIRECTIONAL_ACCURACY,
                self.directional_accuracy,
                thresholds.directional_accuracy,
            ),
            self.magnitude_criterion(direction, thresholds.min_magnitude_pct),
        ]
    }
}

/// Windows inside the trailing `hours` ending at the latest window start.
pub fn trailing_windows(windows: &[WindowObservation], hours: f64) -> Vec<WindowObservation> {
    let Some(latest) = windows.iter().map(|w| w.window_start).max() else {
        return Vec::new();
    };
    // A span past the representable range covers every window.
    let Some(cutoff) = Duration::try_milliseconds((hours * 3_600_000.0) as i64)
        .and_then(|span| latest.checked_sub_signed(span))
    else {
        return windows.to_vec();
    };
    windows
        .iter()
        .filter(|w| w.window_start >= cutoff)
        .cloned()
        .collect()
}

/// Evaluates the hypothesis's own pre-registered falsification rule over
/// its trailing evaluation window. Passes when the rule is not triggered.
pub fn own_rule_criterion(
    hypothesis: &Hypothesis,
    windows: &[WindowObservation],
    neutral_band_pct: f64,
) -> CriterionResult {
    let rule = &hypothesis.falsification_criteria;
    let recent = trailing_windows(windows, rule.evaluation_window_hours);
    let metrics = TrialMetrics::compute(
        hypothesis.claim.direction,
        &hypothesis.regime_scope,
        &recent,
        neutral_band_pct,
    );
    let observed = metrics.value(rule.metric);
    CriterionResult {
        name: OWN_FALSIFICATION_RULE.to_string(),
        observed,
        threshold: rule.threshold,
        // No trailing evidence means the rule cannot be shown untriggered.
        passed: !recent.is_empty() && !rule.is_triggered(observed),
    }
}

/// All six sweep criteria at `thresholds`.
pub fn sweep_criteria(
    hypothesis: &Hypothesis,
    windows: &[WindowObservation],
    thresholds: &CriteriaThresholds,
) -> (TrialMetrics, Vec<CriterionResult>) {
    let metrics = TrialMetrics::compute(
        hypothesis.claim.direction,
        &hypothesis.regime_scope,
        windows,
        thresholds.min_magnitude_pct,
    );
    let mut criteria = metrics.threshold_criteria(hypothesis.claim.direction, thresholds);
    criteria.push(own_rule_criterion(hypothesis, windows, thresholds.min_magnitude_pct));
    (metrics, criteria)
}

/// Weighted share of passed criteria. Diagnostic only.
pub fn advisory_score(criteria: &[CriterionResult]) -> f64 {
    let total: f64 = ADVISORY_WEIGHTS.iter().map(|(_, w)| w).sum();
    let earned: f64 = ADVISORY_WEIGHTS
        .iter()
        .filter(|(name, _)| criteria.iter().any(|c| c.name == *name && c.passed))
        .map(|(_, w)| w)
        .sum();
    if total > 0.0 {
        earned / total
    } else {
        0.0
    }
}

pub fn all_passed(criteria: &[CriterionResult]) -> bool {
    !criteria.is_empty() && criteria.iter().all(|c| c.passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::economy::test_support::{sample_hypothesis, window, winning_windows};

    #[test]
    fn test_empty_windows_fail_closed() {
        let scope = RegimeScope::new(["trending"]);
        let m = TrialMetrics::compute(Direction::Bullish, &scope, &[], 2.0);
        assert_eq!(m.windows, 0);
        assert_eq!(m.directional_accuracy, 0.0);
        let criteria = m.threshold_criteria(Direction::Bullish, &CriteriaThresholds::default());
        assert!(criteria.iter().all(|c| !c.passed));
    }

    #[test]
    fn test_metrics_for_bullish_claim() {
        let scope = RegimeScope::new(["trending", "ranging"]);
        let windows = vec![
            window(0, "trending", 6, 10, 3.0, false),
            window(1, "trending", 7, 10, 2.0, false),
            window(2, "ranging", 4, 10, -1.0, true),
            window(3, "crisis", 5, 10, 4.0, false),
        ];
        let m = TrialMetrics::compute(Direction::Bullish, &scope, &windows, 2.0);
        assert!((m.sign_stability - 0.75).abs() < 1e-12);
        assert!((m.temporal_stability - 0.75).abs() < 1e-12);
        assert!((m.directional_accuracy - 22.0 / 40.0).abs() < 1e-12);
        // crisis is outside the scope; ranging pooled negative.
        assert!((m.regime_consistency - 0.5).abs() < 1e-12);
        assert!((m.aligned_return_pct - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_bearish_alignment_flips_sign() {
        let scope = RegimeScope::new(["trending"]);
        let windows = vec![
            window(0, "trending", 6, 10, -3.0, false),
            window(1, "trending", 6, 10, -5.0, false),
        ];
        let m = TrialMetrics::compute(Direction::Bearish, &scope, &windows, 2.0);
        assert_eq!(m.sign_stability, 1.0);
        assert!((m.aligned_return_pct - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_neutral_claim_inverts_magnitude() {
        let scope = RegimeScope::new(["ranging"]);
        let windows = vec![
            window(0, "ranging", 6, 10, 0.5, false),
            window(1, "ranging", 6, 10, -0.7, false),
        ];
        let m = TrialMetrics::compute(Direction::Neutral, &scope, &windows, 2.0);
        assert_eq!(m.sign_stability, 1.0);
        assert!(m.magnitude_criterion(Direction::Neutral, 2.0).passed);
        assert!(!m.magnitude_criterion(Direction::Bullish, 2.0).passed);
    }

    #[test]
    fn test_sweep_has_six_criteria_and_passes_on_clean_evidence() {
        let h = sample_hypothesis("H-SWEEP");
        let (_, criteria) = sweep_criteria(&h, &winning_windows(20), &CriteriaThresholds::default());
        assert_eq!(criteria.len(), 6);
        assert!(all_passed(&criteria), "{:?}", criteria);
        assert!((advisory_score(&criteria) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_trailing_window_limits_own_rule() {
        let mut h = sample_hypothesis("H-TRAIL");
        h.falsification_criteria.evaluation_window_hours = 48.0;
        // Old windows are strong, the last two days are weak.
        let mut windows = winning_windows(10);
        for w in windows.iter_mut().rev().take(2) {
            w.hits = 1;
        }
        let recent = trailing_windows(&windows, 48.0);
        assert_eq!(recent.len(), 3);
        let c = own_rule_criterion(&h, &windows, 2.0);
        assert!(!c.passed);
    }

    #[test]
    fn test_pooled_counts_do_not_overflow() {
        let scope = RegimeScope::new(["trending"]);
        let windows = vec![
            window(0, "trending", u32::MAX, u32::MAX, 3.0, false),
            window(1, "trending", u32::MAX, u32::MAX, 3.0, false),
            window(2, "trending", 0, u32::MAX, 3.0, false),
        ];
        let m = TrialMetrics::compute(Direction::Bullish, &scope, &windows, 2.0);
        assert_eq!(m.pooled_trials, 3 * u64::from(u32::MAX));
        assert!((m.directional_accuracy - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_huge_evaluation_window_keeps_every_window() {
        let windows = winning_windows(5);
        assert_eq!(trailing_windows(&windows, 1e12).len(), 5);
        assert_eq!(trailing_windows(&windows, f64::MAX).len(), 5);

        let mut h = sample_hypothesis("H-WIDE");
        h.falsification_criteria.evaluation_window_hours = 1e12;
        assert!(own_rule_criterion(&h, &windows, 2.0).passed);
    }

    #[test]
    fn test_advisory_score_is_partial_but_verdict_is_not() {
        let h = sample_hypothesis("H-ADV");
        let mut windows = winning_windows(20);
        for w in windows.iter_mut() {
            w.mean_return_pct = 1.0;
        }
        let (_, criteria) = sweep_criteria(&h, &windows, &CriteriaThresholds::default());
        let failed: Vec<_> = criteria.iter().filter(|c| !c.passed).map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec![MAGNITUDE_FLOOR]);
        assert!(advisory_score(&criteria) > 0.8);
        assert!(!all_passed(&criteria));
    }
}
