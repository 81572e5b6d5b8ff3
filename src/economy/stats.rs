//! Sharpe Deflation
//!
//! Helpers for populating `deflated_sharpe_estimate` from raw backtest
//! returns. The observed Sharpe is haircut by the maximum Sharpe one would
//! expect from `trials` independent attempts on pure noise (Bailey and
//! López de Prado), which is what the gate's realism ceiling is meant to
//! be applied to.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::Statistics;

/// Euler-Mascheroni constant.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Trading days per year, the default annualization.
pub const TRADING_PERIODS_PER_YEAR: f64 = 252.0;

/// Result of deflating an observed Sharpe ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeflatedSharpe {
    /// Per-period Sharpe of the supplied returns.
    pub observed: f64,
    /// Expected maximum per-period Sharpe across `trials` null strategies.
    pub expected_max_null: f64,
    /// Annualized Sharpe after the haircut.
    pub deflated_annualized: f64,
    /// Probability the true Sharpe exceeds `expected_max_null`.
    pub probability: f64,
    pub observations: usize,
    pub trials: u32,
}

/// Sample skewness and (non-excess) kurtosis.
fn higher_moments(returns: &[f64], mean: f64, std: f64) -> (f64, f64) {
    let n = returns.len() as f64;
    let mut m3 = 0.0;
    let mut m4 = 0.0;
    for r in returns {
        let z = (r - mean) / std;
        m3 += z.powi(3);
        m4 += z.powi(4);
    }
    (m3 / n, m4 / n)
}

/// Expected maximum of `trials` standard-normal Sharpe estimates scaled by
/// `sr_std`. Zero for a single trial.
pub fn expected_max_sharpe(trials: u32, sr_std: f64) -> Option<f64> {
    if trials <= 1 {
        return Some(0.0);
    }
    let n = Normal::new(0.0, 1.0).ok()?;
    let t = trials as f64;
    let a = n.inverse_cdf(1.0 - 1.0 / t);
    let b = n.inverse_cdf(1.0 - 1.0 / (t * std::f64::consts::E));
    Some(sr_std * ((1.0 - EULER_GAMMA) * a + EULER_GAMMA * b))
}

/// Deflates the Sharpe ratio of `returns` for `trials` attempts.
///
/// Returns `None` with fewer than three observations or zero dispersion.
pub fn deflated_sharpe(returns: &[f64], trials: u32, periods_per_year: f64) -> Option<DeflatedSharpe> {
    if returns.len() < 3 {
        return None;
    }
    let mean = returns.iter().mean();
    let std = returns.iter().std_dev();
    if !(std.is_finite() && std > f64::EPSILON) {
        return None;
    }

    let sr = mean / std;
    let (skew, kurt) = higher_moments(returns, mean, std);
    let t = returns.len() as f64;

    // Variance of the Sharpe estimator under non-normal returns.
    let sr_var = ((1.0 - skew * sr + (kurt - 1.0) / 4.0 * sr * sr) / (t - 1.0)).max(f64::EPSILON);
    let sr_std = sr_var.sqrt();

    let sr0 = expected_max_sharpe(trials.max(1), sr_std)?;
    let n = Normal::new(0.0, 1.0).ok()?;
    let probability = n.cdf((sr - sr0) / sr_std);

    Some(DeflatedSharpe {
        observed: sr,
        expected_max_null: sr0,
        deflated_annualized: (sr - sr0) * periods_per_year.max(1.0).sqrt(),
        probability,
        observations: returns.len(),
        trials: trials.max(1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn noisy_returns(seed: u64, n: usize, drift: f64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n).map(|_| drift + rng.gen_range(-0.01..0.01)).collect()
    }

    #[test]
    fn test_single_trial_has_no_haircut() {
        assert_eq!(expected_max_sharpe(1, 0.1), Some(0.0));
        let returns = noisy_returns(7, 250, 0.001);
        let d = deflated_sharpe(&returns, 1, TRADING_PERIODS_PER_YEAR).unwrap();
        assert_eq!(d.expected_max_null, 0.0);
        assert!((d.deflated_annualized - d.observed * 252f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_more_trials_deflate_more() {
        let returns = noisy_returns(11, 500, 0.0015);
        let few = deflated_sharpe(&returns, 2, TRADING_PERIODS_PER_YEAR).unwrap();
        let many = deflated_sharpe(&returns, 30, TRADING_PERIODS_PER_YEAR).unwrap();
        assert!(many.expected_max_null > few.expected_max_null);
        assert!(many.deflated_annualized < few.deflated_annualized);
        assert!(many.probability < few.probability);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(deflated_sharpe(&[0.01, 0.02], 5, 252.0).is_none());
        assert!(deflated_sharpe(&[0.01; 50], 5, 252.0).is_none());
    }
}
