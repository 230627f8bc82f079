// =============================================================================
// Rolling window — bar storage and spread statistics
// =============================================================================
//
// A FIFO ring of at most `capacity` bars, strictly monotonic in timestamp.
// The last bar is live: its closes are overwritten on every tick until its
// period bucket ends, at which point it is sealed and a fresh bar is
// appended (evicting the oldest once the ring is full).
//
// All statistics are computed over the full current window INCLUDING the
// live bar, so the z-score adapts tick by tick while the series keeps a
// consistent bar timeframe.
// =============================================================================

use std::collections::VecDeque;

use serde::Serialize;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One bar of the pair series.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Bar {
    /// Bucket start, epoch milliseconds.
    pub timestamp: i64,
    pub primary_close: f64,
    pub secondary_close: f64,
    /// primary_close - beta * secondary_close, maintained against the
    /// window's current hedge ratio.
    pub spread: f64,
}

/// Statistics over the current window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WindowStats {
    /// Population mean of the spread series.
    pub mean: f64,
    /// Population standard deviation of the spread series.
    pub std: f64,
    /// Pearson correlation of the two close series.
    pub correlation: f64,
    pub count: usize,
}

/// Map an epoch-ms timestamp to the start of its bar bucket.
pub fn bucket_of(t_ms: i64, period_ms: i64) -> i64 {
    t_ms - t_ms.rem_euclid(period_ms)
}

// ---------------------------------------------------------------------------
// RollingWindow
// ---------------------------------------------------------------------------

/// Ring buffer of bars with O(N) statistics passes.
#[derive(Debug)]
pub struct RollingWindow {
    bars: VecDeque<Bar>,
    capacity: usize,
    period_ms: i64,
}

impl RollingWindow {
    pub fn new(capacity: usize, period_ms: i64) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity + 1),
            capacity,
            period_ms,
        }
    }

    /// Seed the window with bootstrap bars (oldest first). Only the last
    /// `capacity` bars are retained; out-of-order bars are dropped.
    pub fn seed(&mut self, bars: impl IntoIterator<Item = Bar>) {
        for bar in bars {
            if let Some(last) = self.bars.back() {
                if bar.timestamp <= last.timestamp {
                    continue;
                }
            }
            self.bars.push_back(bar);
            while self.bars.len() > self.capacity {
                self.bars.pop_front();
            }
        }
    }

    /// Fold one tick into the window.
    ///
    /// If the tick's bucket is newer than the live bar, the live bar is
    /// sealed and a new bar opens at the tick's prices. Otherwise the live
    /// bar's closes are overwritten. Returns `true` when a new bar was
    /// opened.
    pub fn apply_tick(&mut self, t_ms: i64, primary: f64, secondary: f64, beta: f64) -> bool {
        let bucket = bucket_of(t_ms, self.period_ms);
        let spread = primary - beta * secondary;

        match self.bars.back_mut() {
            Some(last) if bucket <= last.timestamp => {
                last.primary_close = primary;
                last.secondary_close = secondary;
                last.spread = spread;
                false
            }
            _ => {
                self.bars.push_back(Bar {
                    timestamp: bucket,
                    primary_close: primary,
                    secondary_close: secondary,
                    spread,
                });
                while self.bars.len() > self.capacity {
                    self.bars.pop_front();
                }
                true
            }
        }
    }

    /// Rewrite every bar's spread against a new hedge ratio. One O(N) pass,
    /// run before the next snapshot is emitted after a beta update.
    pub fn recompute_spreads(&mut self, beta: f64) {
        for bar in &mut self.bars {
            bar.spread = bar.primary_close - beta * bar.secondary_close;
        }
    }

    /// One O(N) pass over the full window (live bar included).
    pub fn stats(&self) -> WindowStats {
        let n = self.bars.len();
        if n == 0 {
            return WindowStats {
                mean: 0.0,
                std: 0.0,
                correlation: 0.0,
                count: 0,
            };
        }

        let nf = n as f64;
        let mut sum_spread = 0.0;
        let mut sum_p = 0.0;
        let mut sum_s = 0.0;
        for bar in &self.bars {
            sum_spread += bar.spread;
            sum_p += bar.primary_close;
            sum_s += bar.secondary_close;
        }
        let mean = sum_spread / nf;
        let mean_p = sum_p / nf;
        let mean_s = sum_s / nf;

        let mut var_spread = 0.0;
        let mut var_p = 0.0;
        let mut var_s = 0.0;
        let mut cov_ps = 0.0;
        for bar in &self.bars {
            let ds = bar.spread - mean;
            let dp = bar.primary_close - mean_p;
            let dq = bar.secondary_close - mean_s;
            var_spread += ds * ds;
            var_p += dp * dp;
            var_s += dq * dq;
            cov_ps += dp * dq;
        }

        let std = (var_spread / nf).sqrt();
        let correlation = if var_p > 0.0 && var_s > 0.0 {
            cov_ps / (var_p.sqrt() * var_s.sqrt())
        } else {
            0.0
        };

        WindowStats {
            mean,
            std,
            correlation,
            count: n,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.bars.iter()
    }

    pub fn primary_closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.primary_close).collect()
    }

    pub fn secondary_closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.secondary_close).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const H1: i64 = 3_600_000;

    fn seeded(n: usize) -> RollingWindow {
        let mut w = RollingWindow::new(1000, H1);
        w.seed((0..n).map(|i| {
            let p = 2000.0 + i as f64;
            let s = 25.0;
            Bar {
                timestamp: i as i64 * H1,
                primary_close: p,
                secondary_close: s,
                spread: p - 30.0 * s,
            }
        }));
        w
    }

    #[test]
    fn seed_respects_capacity_and_order() {
        let mut w = RollingWindow::new(3, H1);
        w.seed((0..5).map(|i| Bar {
            timestamp: i * H1,
            primary_close: 100.0 + i as f64,
            secondary_close: 1.0,
            spread: 0.0,
        }));
        assert_eq!(w.len(), 3);
        assert_eq!(w.last().unwrap().timestamp, 4 * H1);

        // Out-of-order bar is dropped.
        w.seed([Bar {
            timestamp: 0,
            primary_close: 1.0,
            secondary_close: 1.0,
            spread: 0.0,
        }]);
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn tick_in_same_bucket_overwrites_live_bar() {
        let mut w = seeded(5);
        let live_ts = w.last().unwrap().timestamp;

        let sealed = w.apply_tick(live_ts + 60_000, 2100.0, 26.0, 30.0);
        assert!(!sealed);
        assert_eq!(w.len(), 5);
        let last = w.last().unwrap();
        assert_eq!(last.timestamp, live_ts);
        assert_eq!(last.primary_close, 2100.0);
        assert_eq!(last.spread, 2100.0 - 30.0 * 26.0);

        // A later tick in the same hour overwrites again.
        w.apply_tick(live_ts + 30 * 60_000, 2105.0, 26.1, 30.0);
        assert_eq!(w.len(), 5);
        assert_eq!(w.last().unwrap().primary_close, 2105.0);
    }

    #[test]
    fn tick_in_next_bucket_seals_and_appends() {
        let mut w = seeded(5);
        let live_ts = w.last().unwrap().timestamp;

        let sealed = w.apply_tick(live_ts + H1 + 1_000, 2200.0, 27.0, 30.0);
        assert!(sealed);
        assert_eq!(w.len(), 6);
        let last = w.last().unwrap();
        assert_eq!(last.timestamp, live_ts + H1);
        assert_eq!(last.primary_close, 2200.0);
    }

    #[test]
    fn full_window_evicts_oldest_on_seal() {
        let mut w = RollingWindow::new(3, H1);
        w.seed((0..3).map(|i| Bar {
            timestamp: i * H1,
            primary_close: 100.0,
            secondary_close: 1.0,
            spread: 70.0,
        }));
        w.apply_tick(3 * H1, 101.0, 1.0, 30.0);
        assert_eq!(w.len(), 3);
        assert_eq!(w.iter().next().unwrap().timestamp, H1);
    }

    #[test]
    fn recompute_spreads_holds_exactly_for_every_bar() {
        let mut w = seeded(20);
        w.recompute_spreads(33.0);
        for bar in w.iter() {
            assert_eq!(bar.spread, bar.primary_close - 33.0 * bar.secondary_close);
        }
    }

    #[test]
    fn stats_population_mean_and_std() {
        let mut w = RollingWindow::new(10, H1);
        // Spreads 1, 2, 3, 4 -> mean 2.5, population variance 1.25.
        w.seed([1.0, 2.0, 3.0, 4.0].iter().enumerate().map(|(i, &sp)| Bar {
            timestamp: i as i64 * H1,
            primary_close: sp,
            secondary_close: 0.0,
            spread: sp,
        }));
        let stats = w.stats();
        assert!((stats.mean - 2.5).abs() < 1e-12);
        assert!((stats.std - 1.25_f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.count, 4);
    }

    #[test]
    fn correlation_of_linearly_related_series_is_one() {
        let mut w = RollingWindow::new(100, H1);
        w.seed((0..50).map(|i| {
            let s = 20.0 + i as f64 * 0.1;
            let p = 3.0 * s + 7.0;
            Bar {
                timestamp: i as i64 * H1,
                primary_close: p,
                secondary_close: s,
                spread: p - 30.0 * s,
            }
        }));
        let stats = w.stats();
        assert!((stats.correlation - 1.0).abs() < 1e-9);
    }

    #[test]
    fn flat_series_has_zero_std_and_correlation() {
        let mut w = RollingWindow::new(10, H1);
        w.seed((0..5).map(|i| Bar {
            timestamp: i as i64 * H1,
            primary_close: 100.0,
            secondary_close: 2.0,
            spread: 40.0,
        }));
        let stats = w.stats();
        assert_eq!(stats.std, 0.0);
        assert_eq!(stats.correlation, 0.0);
    }

    #[test]
    fn bucket_alignment() {
        assert_eq!(bucket_of(0, H1), 0);
        assert_eq!(bucket_of(H1 - 1, H1), 0);
        assert_eq!(bucket_of(H1, H1), H1);
        assert_eq!(bucket_of(H1 + 1, H1), H1);
    }
}
