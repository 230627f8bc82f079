// =============================================================================
// Market model — true rolling-window statistics over the pair (C1)
// =============================================================================
//
// Bootstrap loads historical bars into the window; after that every tick
// updates the live bar in place (or seals it on an hour boundary) and the
// z-score is always computed from the CURRENT window statistics.
//
// The model is the sole owner of the window and the hedge ratio. The data
// pump is the only writer; consumers see immutable `MarketSnapshot` values.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info};

use crate::broker::{HistoryBar, Tick};
use crate::errors::EngineError;
use crate::market::window::{Bar, RollingWindow, WindowStats};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Immutable read-model handed to the signal pipeline on every tick.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MarketSnapshot {
    /// Monotonically increasing snapshot id (stale-decision guard).
    pub seq: u64,
    /// Tick time, epoch milliseconds.
    pub timestamp_ms: i64,

    pub primary_bid: f64,
    pub primary_ask: f64,
    pub secondary_bid: f64,
    pub secondary_ask: f64,

    /// Live spread from the tick bids.
    pub spread: f64,
    /// (spread - mean) / std over the rolling window.
    pub zscore: f64,

    pub spread_mean: f64,
    pub spread_std: f64,
    pub hedge_ratio: f64,
    pub correlation: f64,
    pub window_size: usize,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Rolling-window market model for one instrument pair.
pub struct MarketModel {
    primary_symbol: String,
    secondary_symbol: String,

    window: RollingWindow,
    warmup_bars: usize,

    /// Current hedge ratio; `None` until bootstrap completes.
    hedge_ratio: Option<f64>,

    /// Annualised return volatilities, cached at bootstrap / beta updates
    /// for the volatility-adjusted estimator.
    primary_vol: Option<f64>,
    secondary_vol: Option<f64>,

    seq: u64,
}

impl MarketModel {
    pub fn new(
        primary_symbol: impl Into<String>,
        secondary_symbol: impl Into<String>,
        window_size: usize,
        warmup_bars: usize,
        bar_period_secs: u64,
    ) -> Self {
        Self {
            primary_symbol: primary_symbol.into(),
            secondary_symbol: secondary_symbol.into(),
            window: RollingWindow::new(window_size, (bar_period_secs * 1000) as i64),
            warmup_bars,
            hedge_ratio: None,
            primary_vol: None,
            secondary_vol: None,
            seq: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    /// Fill the window from pre-fetched history (both series aligned by
    /// timestamp intersection) and install the initial hedge ratio.
    pub fn bootstrap(
        &mut self,
        primary: &[HistoryBar],
        secondary: &[HistoryBar],
        initial_beta: f64,
    ) -> Result<(), EngineError> {
        let aligned = align_series(primary, secondary);
        if aligned.len() < self.warmup_bars {
            return Err(EngineError::InsufficientWindow {
                len: aligned.len(),
                warmup: self.warmup_bars,
            });
        }

        self.window.seed(aligned.iter().map(|&(t, p, s)| Bar {
            timestamp: t,
            primary_close: p,
            secondary_close: s,
            spread: p - initial_beta * s,
        }));
        self.hedge_ratio = Some(initial_beta);
        self.refresh_volatilities();

        let stats = self.window.stats();
        info!(
            pair = %format!("{}/{}", self.primary_symbol, self.secondary_symbol),
            bars = self.window.len(),
            beta = initial_beta,
            spread_mean = stats.mean,
            spread_std = stats.std,
            "rolling window bootstrapped"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tick handling
    // -------------------------------------------------------------------------

    /// Fold one tick into the window and build a snapshot.
    ///
    /// Returns `Ok(None)` when the window is statistically degenerate
    /// (sigma = 0); typed errors for stale quotes and a short window. Both
    /// suppress the snapshot with no downstream action.
    pub fn on_tick(&mut self, tick: &Tick) -> Result<Option<MarketSnapshot>, EngineError> {
        if tick.bid_primary <= 0.0 {
            return Err(EngineError::StaleMarket {
                symbol: self.primary_symbol.clone(),
            });
        }
        if tick.bid_secondary <= 0.0 {
            return Err(EngineError::StaleMarket {
                symbol: self.secondary_symbol.clone(),
            });
        }

        let beta = self.hedge_ratio.ok_or(EngineError::InsufficientWindow {
            len: 0,
            warmup: self.warmup_bars,
        })?;

        let sealed = self
            .window
            .apply_tick(tick.t, tick.bid_primary, tick.bid_secondary, beta);
        if sealed {
            debug!(
                bucket = self.window.last().map(|b| b.timestamp).unwrap_or(0),
                bars = self.window.len(),
                "new bar opened"
            );
        }

        if self.window.len() < self.warmup_bars {
            return Err(EngineError::InsufficientWindow {
                len: self.window.len(),
                warmup: self.warmup_bars,
            });
        }

        let stats = self.window.stats();
        if stats.std <= 0.0 {
            return Ok(None);
        }

        Ok(Some(self.build_snapshot(tick, beta, &stats)))
    }

    fn build_snapshot(&mut self, tick: &Tick, beta: f64, stats: &WindowStats) -> MarketSnapshot {
        let spread = tick.bid_primary - beta * tick.bid_secondary;
        let zscore = (spread - stats.mean) / stats.std;
        self.seq += 1;

        MarketSnapshot {
            seq: self.seq,
            timestamp_ms: tick.t,
            primary_bid: tick.bid_primary,
            primary_ask: tick.ask_primary,
            secondary_bid: tick.bid_secondary,
            secondary_ask: tick.ask_secondary,
            spread,
            zscore,
            spread_mean: stats.mean,
            spread_std: stats.std,
            hedge_ratio: beta,
            correlation: stats.correlation,
            window_size: stats.count,
        }
    }

    // -------------------------------------------------------------------------
    // Hedge ratio
    // -------------------------------------------------------------------------

    /// Install a new hedge ratio and rewrite every bar's spread so the next
    /// snapshot's statistics are consistent with it.
    pub fn set_hedge_ratio(&mut self, beta: f64) {
        let old = self.hedge_ratio;
        self.hedge_ratio = Some(beta);
        self.window.recompute_spreads(beta);
        self.refresh_volatilities();
        info!(
            old = old.unwrap_or(f64::NAN),
            new = beta,
            "hedge ratio updated, window spreads recomputed"
        );
    }

    pub fn hedge_ratio(&self) -> Option<f64> {
        self.hedge_ratio
    }

    /// `(primary_lots, primary_lots * beta)` from the current ratio.
    /// Fails when either leg's bid is zero.
    pub fn hedge_quantities(
        &self,
        primary_lots: f64,
        tick: &Tick,
    ) -> Result<(f64, f64), EngineError> {
        if tick.bid_primary <= 0.0 {
            return Err(EngineError::StaleMarket {
                symbol: self.primary_symbol.clone(),
            });
        }
        if tick.bid_secondary <= 0.0 {
            return Err(EngineError::StaleMarket {
                symbol: self.secondary_symbol.clone(),
            });
        }
        let beta = self.hedge_ratio.unwrap_or(0.0);
        Ok((primary_lots, primary_lots * beta))
    }

    // -------------------------------------------------------------------------
    // Estimator inputs
    // -------------------------------------------------------------------------

    pub fn primary_closes(&self) -> Vec<f64> {
        self.window.primary_closes()
    }

    pub fn secondary_closes(&self) -> Vec<f64> {
        self.window.secondary_closes()
    }

    /// `(primary_vol, secondary_vol)` annualised; zeros until bootstrap.
    pub fn volatilities(&self) -> (f64, f64) {
        (
            self.primary_vol.unwrap_or(0.0),
            self.secondary_vol.unwrap_or(0.0),
        )
    }

    /// Annualised close-to-close volatility of both legs over the window.
    /// H1 bars: sqrt(252 * 24) scaling.
    fn refresh_volatilities(&mut self) {
        self.primary_vol = annualised_vol(&self.window.primary_closes());
        self.secondary_vol = annualised_vol(&self.window.secondary_closes());
    }
}

/// Intersection of two history series on timestamp, oldest first.
fn align_series(primary: &[HistoryBar], secondary: &[HistoryBar]) -> Vec<(i64, f64, f64)> {
    let mut out = Vec::with_capacity(primary.len().min(secondary.len()));
    let mut i = 0;
    let mut j = 0;
    while i < primary.len() && j < secondary.len() {
        let (a, b) = (&primary[i], &secondary[j]);
        if a.t == b.t {
            out.push((a.t, a.close, b.close));
            i += 1;
            j += 1;
        } else if a.t < b.t {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

fn annualised_vol(closes: &[f64]) -> Option<f64> {
    if closes.len() < 3 {
        return None;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
    Some(var.sqrt() * (252.0 * 24.0_f64).sqrt())
}
