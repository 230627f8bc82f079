// =============================================================================
// Hedge-ratio estimator — weighted blend of four methods (C2)
// =============================================================================
//
// Methods:
//   OLS             — least-squares regression of primary on secondary.
//   Dollar-neutral  — (p * contract_p) / (s * contract_s) at the latest close.
//   Vol-adjusted    — dollar-neutral divided by sqrt(vol_p / vol_s).
//   Kalman          — time-varying [beta, alpha] state tracked over the
//                     window; the latest beta is used.
//
// An estimator that fails (degenerate series, zero volatility) is dropped and
// the remaining weights are renormalised. If every method fails the blend
// returns an error and the caller leaves beta unchanged.
// =============================================================================

use nalgebra::{Matrix2, RowVector2, Vector2};
use tracing::{debug, warn};

use crate::errors::EngineError;

/// Default blend weights, normalised at construction.
const DEFAULT_OLS_WEIGHT: f64 = 0.30;
const DEFAULT_DOLLAR_NEUTRAL_WEIGHT: f64 = 0.30;
const DEFAULT_VOL_ADJUSTED_WEIGHT: f64 = 0.20;
const DEFAULT_KALMAN_WEIGHT: f64 = 0.20;

/// Kalman process noise (state transition covariance).
const KALMAN_DELTA: f64 = 1e-5;
/// Kalman observation noise.
const KALMAN_OBS_NOISE: f64 = 1.0;
/// Initial state covariance — high uncertainty before the first update.
const KALMAN_INITIAL_COVARIANCE: f64 = 100.0;

/// Result of one blend pass.
#[derive(Debug, Clone)]
pub struct HedgeBlend {
    pub ratio: f64,
    /// (method name, component ratio) for the estimators that succeeded.
    pub components: Vec<(&'static str, f64)>,
}

/// Blended hedge-ratio estimator with a time-driven recompute cadence.
pub struct HedgeRatioEstimator {
    ols_weight: f64,
    dollar_neutral_weight: f64,
    vol_adjusted_weight: f64,
    kalman_weight: f64,

    update_interval_ms: u64,
    last_update_ms: Option<u64>,
}

impl HedgeRatioEstimator {
    pub fn new(update_interval_s: u64) -> Self {
        let total = DEFAULT_OLS_WEIGHT
            + DEFAULT_DOLLAR_NEUTRAL_WEIGHT
            + DEFAULT_VOL_ADJUSTED_WEIGHT
            + DEFAULT_KALMAN_WEIGHT;
        Self {
            ols_weight: DEFAULT_OLS_WEIGHT / total,
            dollar_neutral_weight: DEFAULT_DOLLAR_NEUTRAL_WEIGHT / total,
            vol_adjusted_weight: DEFAULT_VOL_ADJUSTED_WEIGHT / total,
            kalman_weight: DEFAULT_KALMAN_WEIGHT / total,
            update_interval_ms: update_interval_s * 1000,
            last_update_ms: None,
        }
    }

    // -------------------------------------------------------------------------
    // Cadence
    // -------------------------------------------------------------------------

    /// True when the recompute interval has elapsed (always true before the
    /// first update).
    pub fn should_update(&self, now_ms: u64) -> bool {
        match self.last_update_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.update_interval_ms,
        }
    }

    pub fn mark_updated(&mut self, now_ms: u64) {
        self.last_update_ms = Some(now_ms);
    }

    // -------------------------------------------------------------------------
    // Blend
    // -------------------------------------------------------------------------

    /// Compute the blended hedge ratio over the window's close series.
    ///
    /// `vols` are the annualised leg volatilities (primary, secondary);
    /// `contracts` the two contract sizes.
    pub fn estimate(
        &self,
        primary: &[f64],
        secondary: &[f64],
        vols: (f64, f64),
        contracts: (f64, f64),
    ) -> Result<HedgeBlend, EngineError> {
        let mut components: Vec<(&'static str, f64)> = Vec::with_capacity(4);
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        let dollar_neutral = estimate_dollar_neutral(primary, secondary, contracts);

        let candidates: [(&'static str, f64, Option<f64>); 4] = [
            ("ols", self.ols_weight, estimate_ols(primary, secondary)),
            ("dollar_neutral", self.dollar_neutral_weight, dollar_neutral),
            (
                "vol_adjusted",
                self.vol_adjusted_weight,
                estimate_vol_adjusted(dollar_neutral, vols),
            ),
            (
                "kalman",
                self.kalman_weight,
                estimate_kalman(primary, secondary),
            ),
        ];

        for (name, weight, ratio) in candidates {
            match ratio {
                Some(r) if r.is_finite() && r > 0.0 => {
                    weighted += r * weight;
                    total_weight += weight;
                    components.push((name, r));
                }
                _ => warn!(method = name, "hedge estimator dropped from blend"),
            }
        }

        if total_weight <= 0.0 {
            return Err(EngineError::SingularEstimator);
        }

        let ratio = weighted / total_weight;
        debug!(ratio, methods = components.len(), "hedge ratio blended");
        Ok(HedgeBlend { ratio, components })
    }
}

// ---------------------------------------------------------------------------
// Individual estimators
// ---------------------------------------------------------------------------

/// Closed-form single-regressor OLS: primary = beta * secondary + alpha.
fn estimate_ols(primary: &[f64], secondary: &[f64]) -> Option<f64> {
    let n = primary.len().min(secondary.len());
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_p = primary[..n].iter().sum::<f64>() / nf;
    let mean_s = secondary[..n].iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_s = 0.0;
    for i in 0..n {
        let ds = secondary[i] - mean_s;
        cov += ds * (primary[i] - mean_p);
        var_s += ds * ds;
    }
    if var_s <= f64::EPSILON {
        return None;
    }
    Some(cov / var_s)
}

/// Latest-close price ratio scaled by contract sizes.
fn estimate_dollar_neutral(
    primary: &[f64],
    secondary: &[f64],
    (contract_p, contract_s): (f64, f64),
) -> Option<f64> {
    let p = *primary.last()?;
    let s = *secondary.last()?;
    let secondary_lot_value = s * contract_s;
    if secondary_lot_value <= 0.0 {
        return None;
    }
    Some(p * contract_p / secondary_lot_value)
}

/// Dollar-neutral divided by sqrt(vol_p / vol_s).
fn estimate_vol_adjusted(dollar_neutral: Option<f64>, (vol_p, vol_s): (f64, f64)) -> Option<f64> {
    let dn = dollar_neutral?;
    if vol_p <= 0.0 || vol_s <= 0.0 {
        return None;
    }
    Some(dn / (vol_p / vol_s).sqrt())
}

/// Kalman filter over state [beta, alpha] with a random-walk transition.
fn estimate_kalman(primary: &[f64], secondary: &[f64]) -> Option<f64> {
    let n = primary.len().min(secondary.len());
    if n < 2 {
        return None;
    }

    let mut x = Vector2::new(0.0, 0.0);
    let mut p = Matrix2::identity() * KALMAN_INITIAL_COVARIANCE;
    let q = Matrix2::identity() * KALMAN_DELTA;
    let r = KALMAN_OBS_NOISE;

    for i in 0..n {
        let h = RowVector2::new(secondary[i], 1.0);

        // Prediction: the state is a random walk, only covariance grows.
        let p_pred = p + q;

        // Update.
        let innovation = primary[i] - (h * x)[(0, 0)];
        let s = (h * p_pred * h.transpose())[(0, 0)] + r;
        if s <= 0.0 || !s.is_finite() {
            return None;
        }
        let k = p_pred * h.transpose() / s;
        x += k * innovation;
        p = (Matrix2::identity() - k * h) * p_pred;
    }

    let beta = x[0];
    beta.is_finite().then_some(beta)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// primary = 30 * secondary + noise-free offset.
    fn linear_pair(n: usize) -> (Vec<f64>, Vec<f64>) {
        let secondary: Vec<f64> = (0..n).map(|i| 30.0 + (i % 11) as f64 * 0.1).collect();
        let primary: Vec<f64> = secondary.iter().map(|s| 30.0 * s + 5.0).collect();
        (primary, secondary)
    }

    #[test]
    fn ols_recovers_linear_beta() {
        let (p, s) = linear_pair(100);
        let beta = estimate_ols(&p, &s).unwrap();
        assert!((beta - 30.0).abs() < 1e-9);
    }

    #[test]
    fn ols_fails_on_constant_regressor() {
        let s = vec![30.0; 50];
        let p: Vec<f64> = (0..50).map(|i| 2600.0 + i as f64).collect();
        assert!(estimate_ols(&p, &s).is_none());
    }

    #[test]
    fn dollar_neutral_is_contract_scaled_price_ratio() {
        let beta = estimate_dollar_neutral(&[2600.0], &[30.0], (100.0, 5000.0)).unwrap();
        // (2600 * 100) / (30 * 5000)
        assert!((beta - 260_000.0 / 150_000.0).abs() < 1e-12);
    }

    #[test]
    fn vol_adjusted_divides_by_vol_ratio_sqrt() {
        let va = estimate_vol_adjusted(Some(2.0), (0.16, 0.04)).unwrap();
        // sqrt(0.16 / 0.04) = 2
        assert!((va - 1.0).abs() < 1e-12);

        assert!(estimate_vol_adjusted(Some(2.0), (0.0, 0.04)).is_none());
        assert!(estimate_vol_adjusted(None, (0.1, 0.1)).is_none());
    }

    #[test]
    fn kalman_converges_near_linear_beta() {
        let (p, s) = linear_pair(300);
        let beta = estimate_kalman(&p, &s).unwrap();
        assert!(
            (beta - 30.0).abs() < 1.0,
            "kalman beta {beta} too far from 30"
        );
    }

    #[test]
    fn blend_renormalises_when_a_method_fails() {
        let est = HedgeRatioEstimator::new(3600);
        let (p, s) = linear_pair(100);
        // Zero volatilities knock out the vol-adjusted method only.
        let blend = est.estimate(&p, &s, (0.0, 0.0), (100.0, 5000.0)).unwrap();
        assert_eq!(blend.components.len(), 3);
        assert!(blend.ratio > 0.0);
        assert!(blend
            .components
            .iter()
            .all(|(name, _)| *name != "vol_adjusted"));
    }

    #[test]
    fn blend_errors_when_all_methods_fail() {
        let est = HedgeRatioEstimator::new(3600);
        let err = est
            .estimate(&[], &[], (0.0, 0.0), (100.0, 5000.0))
            .unwrap_err();
        assert!(matches!(err, EngineError::SingularEstimator));
    }

    #[test]
    fn update_cadence_is_time_driven() {
        let mut est = HedgeRatioEstimator::new(3600);
        assert!(est.should_update(0));
        est.mark_updated(1_000_000);
        assert!(!est.should_update(1_000_000 + 3_599_000));
        assert!(est.should_update(1_000_000 + 3_600_000));
    }
}
