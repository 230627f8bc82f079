// =============================================================================
// Volume rebalancer — single-leg hedge corrections (C4)
// =============================================================================
//
// Invariant defended: |primary_lots| * beta ~= |secondary_lots| for the active
// spread. Lot magnitudes come from the authoritative broker snapshot, never
// from the internal tracker.
//
// Imbalance I = P - S / beta, in primary lots.
//   |I| < min_absolute_drift      -> no action.
//   I > 0 (primary surplus)       -> trim the primary leg by |I|:
//                                    BUY when z > 0, SELL when z < 0.
//   I < 0 (secondary surplus)     -> trim the secondary leg by |S - P*beta|:
//                                    BUY when z < 0, SELL when z > 0.
//
// Quantities round UP to the lot step. There is no cooldown by default; the
// lot floor and the post-trade hedge-quality check are the natural
// protections. An optional interval remains configurable for throttling.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info};

use crate::types::OrderSide;

/// Acceptable relative hedge error after a correction.
const HEDGE_QUALITY_TOLERANCE: f64 = 0.05;

/// A single-leg corrective order proposal. Ephemeral; consumed by the
/// execution loop.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeAdjustment {
    pub spread_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub reason: String,
    pub beta_before: f64,
    pub beta_after: f64,
    /// Signed imbalance in primary lots at decision time.
    pub imbalance: f64,
    /// True when the corrected leg is the primary.
    pub primary_leg: bool,
}

#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    pub enabled: bool,
    pub min_absolute_drift: f64,
    pub lot_step: f64,
    pub min_lot: f64,
    pub min_adjustment_interval_ms: u64,
}

/// Broker-reported lot magnitudes for the active spread.
#[derive(Debug, Clone, Copy)]
pub struct HedgeExposure {
    pub primary_lots: f64,
    pub secondary_lots: f64,
}

pub struct VolumeRebalancer {
    cfg: RebalanceConfig,
    primary_symbol: String,
    secondary_symbol: String,
    last_adjustment_ms: Option<u64>,
}

impl VolumeRebalancer {
    pub fn new(
        cfg: RebalanceConfig,
        primary_symbol: impl Into<String>,
        secondary_symbol: impl Into<String>,
    ) -> Self {
        Self {
            cfg,
            primary_symbol: primary_symbol.into(),
            secondary_symbol: secondary_symbol.into(),
            last_adjustment_ms: None,
        }
    }

    /// Evaluate the hedge for one open spread. Returns a corrective proposal
    /// or `None` when the drift is inside tolerance.
    pub fn check(
        &self,
        spread_id: &str,
        exposure: HedgeExposure,
        beta_before: f64,
        beta_now: f64,
        zscore: f64,
        now_ms: u64,
    ) -> Option<VolumeAdjustment> {
        if !self.cfg.enabled || beta_now <= 0.0 {
            return None;
        }
        if let Some(last) = self.last_adjustment_ms {
            if self.cfg.min_adjustment_interval_ms > 0
                && now_ms.saturating_sub(last) < self.cfg.min_adjustment_interval_ms
            {
                return None;
            }
        }

        let p = exposure.primary_lots.abs();
        let s = exposure.secondary_lots.abs();
        if p <= 0.0 && s <= 0.0 {
            return None;
        }

        let imbalance = p - s / beta_now;
        if imbalance.abs() < self.cfg.min_absolute_drift {
            debug!(
                spread_id,
                imbalance,
                floor = self.cfg.min_absolute_drift,
                "hedge drift below floor"
            );
            return None;
        }

        let (symbol, side, quantity, primary_leg) = if imbalance > 0.0 {
            // Primary carries more than the current beta justifies.
            let side = if zscore > 0.0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            let qty = self.round_up_lots(imbalance.abs());
            (self.primary_symbol.clone(), side, qty, true)
        } else {
            // Secondary carries the surplus; trim it in its own units.
            let side = if zscore < 0.0 {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            let qty = self.round_up_lots((s - p * beta_now).abs());
            (self.secondary_symbol.clone(), side, qty, false)
        };

        let reason = format!(
            "hedge drift {imbalance:+.4} lots (beta {beta_before:.4} -> {beta_now:.4}), z {zscore:+.3}"
        );
        info!(
            spread_id,
            symbol = %symbol,
            side = %side,
            quantity,
            imbalance,
            "volume rebalance proposed"
        );

        Some(VolumeAdjustment {
            spread_id: spread_id.to_string(),
            symbol,
            side,
            quantity,
            reason,
            beta_before,
            beta_after: beta_now,
            imbalance,
            primary_leg,
        })
    }

    /// Record an executed adjustment (drives the optional cooldown).
    pub fn mark_adjusted(&mut self, now_ms: u64) {
        self.last_adjustment_ms = Some(now_ms);
    }

    /// Post-trade check: relative hedge error after the fill.
    pub fn hedge_quality_ok(&self, exposure: HedgeExposure, beta: f64) -> bool {
        let p = exposure.primary_lots.abs();
        let s = exposure.secondary_lots.abs();
        if p <= 0.0 || beta <= 0.0 {
            return false;
        }
        let target_secondary = p * beta;
        let error = (s - target_secondary).abs() / target_secondary;
        if error >= HEDGE_QUALITY_TOLERANCE {
            debug!(error, "hedge quality check failed after adjustment");
            return false;
        }
        true
    }

    fn round_up_lots(&self, qty: f64) -> f64 {
        let step = self.cfg.lot_step;
        let stepped = (qty / step).ceil() * step;
        // Re-round to kill float residue from the division.
        let stepped = (stepped / step).round() * step;
        stepped.max(self.cfg.min_lot)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn rebalancer() -> VolumeRebalancer {
        VolumeRebalancer::new(
            RebalanceConfig {
                enabled: true,
                min_absolute_drift: 0.01,
                lot_step: 0.01,
                min_lot: 0.01,
                min_adjustment_interval_ms: 0,
            },
            "XAUUSD",
            "XAGUSD",
        )
    }

    fn exposure(p: f64, s: f64) -> HedgeExposure {
        HedgeExposure {
            primary_lots: p,
            secondary_lots: s,
        }
    }

    #[test]
    fn small_beta_drift_stays_quiet() {
        // Opened at beta 30 with (0.10, 3.00); beta moves to 33.
        // I = 0.10 - 3.00/33 = 0.0091 < 0.01 -> nothing.
        let rb = rebalancer();
        assert!(rb
            .check("1-2", exposure(0.10, -3.00), 30.0, 33.0, -1.0, 0)
            .is_none());
    }

    #[test]
    fn larger_beta_drift_trims_primary() {
        // beta 30 -> 35: I = 0.10 - 3.00/35 = 0.0143 -> primary corrected,
        // 0.02 lots after ceil rounding.
        let rb = rebalancer();

        let adj = rb
            .check("1-2", exposure(0.10, -3.00), 30.0, 35.0, 1.2, 0)
            .unwrap();
        assert!(adj.primary_leg);
        assert_eq!(adj.symbol, "XAUUSD");
        assert_eq!(adj.side, OrderSide::Buy, "z > 0 buys the primary");
        assert!((adj.quantity - 0.02).abs() < 1e-9);

        let adj = rb
            .check("1-2", exposure(0.10, -3.00), 30.0, 35.0, -1.2, 0)
            .unwrap();
        assert_eq!(adj.side, OrderSide::Sell, "z < 0 sells the primary");
    }

    #[test]
    fn beta_drop_trims_secondary_in_its_own_units() {
        // beta 30 -> 25: I = 0.10 - 3.00/25 = -0.02 -> secondary corrected by
        // |3.00 - 0.10 * 25| = 0.50 lots.
        let rb = rebalancer();

        let adj = rb
            .check("1-2", exposure(0.10, -3.00), 30.0, 25.0, -1.0, 0)
            .unwrap();
        assert!(!adj.primary_leg);
        assert_eq!(adj.symbol, "XAGUSD");
        assert_eq!(adj.side, OrderSide::Buy, "z < 0 buys the secondary");
        assert!((adj.quantity - 0.50).abs() < 1e-9);
        assert!(adj.imbalance < 0.0);

        let adj = rb
            .check("1-2", exposure(0.10, -3.00), 30.0, 25.0, 0.8, 0)
            .unwrap();
        assert_eq!(adj.side, OrderSide::Sell, "z > 0 sells the secondary");
    }

    #[test]
    fn quantities_round_up_to_lot_step() {
        let rb = rebalancer();
        assert!((rb.round_up_lots(0.0143) - 0.02).abs() < 1e-12);
        assert!((rb.round_up_lots(0.02) - 0.02).abs() < 1e-12);
        assert!((rb.round_up_lots(0.001) - 0.01).abs() < 1e-12, "min lot floor");
    }

    #[test]
    fn disabled_rebalancer_never_proposes() {
        let mut rb = rebalancer();
        rb.cfg.enabled = false;
        assert!(rb
            .check("1-2", exposure(0.10, -3.00), 30.0, 40.0, 1.0, 0)
            .is_none());
    }

    #[test]
    fn optional_interval_throttles() {
        let mut rb = rebalancer();
        rb.cfg.min_adjustment_interval_ms = 60_000;
        rb.mark_adjusted(100_000);
        assert!(rb
            .check("1-2", exposure(0.10, -3.00), 30.0, 40.0, 1.0, 120_000)
            .is_none());
        assert!(rb
            .check("1-2", exposure(0.10, -3.00), 30.0, 40.0, 1.0, 161_000)
            .is_some());
    }

    #[test]
    fn flat_exposure_is_ignored() {
        let rb = rebalancer();
        assert!(rb
            .check("1-2", exposure(0.0, 0.0), 30.0, 35.0, 1.0, 0)
            .is_none());
    }

    #[test]
    fn hedge_quality_tolerance() {
        let rb = rebalancer();
        assert!(rb.hedge_quality_ok(exposure(0.10, -3.00), 30.0));
        // 3.3 vs target 3.0 is a 10% error.
        assert!(!rb.hedge_quality_ok(exposure(0.10, -3.30), 30.0));
    }
}
