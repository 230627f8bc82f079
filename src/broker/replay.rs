// =============================================================================
// Replay feed — JSON tick file as a MarketFeed
// =============================================================================
//
// Paper sessions replay a recorded tick file instead of a live bridge. The
// file is a JSON array of `Tick` values, oldest first. On load the file's
// timeline is rebased so its live portion starts "now", and the span is
// split: the earlier part answers `history()` (bootstrap), the final stretch
// is replayed through `subscribe()`. Bootstrap and live data therefore come
// from one consistent series without overlapping.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::broker::{HistoryBar, MarketFeed, SymbolInfo, Tick};
use crate::market::window::bucket_of;

/// Fraction of the file's time span kept for live replay (the tail).
const LIVE_TAIL_FRACTION: f64 = 0.25;

pub struct ReplayFeed {
    ticks: Vec<Tick>,
    /// Ticks at or after this instant are replayed live; earlier ticks are
    /// served as history.
    live_from_ms: i64,
    primary_symbol: String,
    secondary_symbol: String,
    infos: HashMap<String, SymbolInfo>,
    /// Pause between replayed ticks.
    playback_interval_ms: u64,
}

impl ReplayFeed {
    /// Load a tick file and rebase its timeline so the live tail begins at
    /// `now_ms`.
    pub fn load(
        path: impl AsRef<Path>,
        primary_symbol: impl Into<String>,
        secondary_symbol: impl Into<String>,
        infos: HashMap<String, SymbolInfo>,
        playback_interval_ms: u64,
        now_ms: i64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tick file {}", path.display()))?;
        let mut ticks: Vec<Tick> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse tick file {}", path.display()))?;
        if ticks.is_empty() {
            bail!("tick file {} is empty", path.display());
        }
        ticks.sort_by_key(|t| t.t);

        let first = ticks.first().map(|t| t.t).unwrap_or(0);
        let last = ticks.last().map(|t| t.t).unwrap_or(0);
        let span = last - first;
        let live_from_original = last - (span as f64 * LIVE_TAIL_FRACTION) as i64;

        // Shift the whole series so the live tail starts now.
        let offset = now_ms - live_from_original;
        for tick in &mut ticks {
            tick.t += offset;
        }
        let live_from_ms = now_ms;

        let history_count = ticks.iter().filter(|t| t.t < live_from_ms).count();
        info!(
            path = %path.display(),
            ticks = ticks.len(),
            history_ticks = history_count,
            live_ticks = ticks.len() - history_count,
            span_ms = span,
            "replay feed loaded"
        );
        Ok(Self {
            ticks,
            live_from_ms,
            primary_symbol: primary_symbol.into(),
            secondary_symbol: secondary_symbol.into(),
            infos,
            playback_interval_ms,
        })
    }

    #[cfg(test)]
    fn from_ticks(
        ticks: Vec<Tick>,
        live_from_ms: i64,
        primary_symbol: &str,
        secondary_symbol: &str,
        infos: HashMap<String, SymbolInfo>,
    ) -> Self {
        Self {
            ticks,
            live_from_ms,
            primary_symbol: primary_symbol.to_string(),
            secondary_symbol: secondary_symbol.to_string(),
            infos,
            playback_interval_ms: 0,
        }
    }

    fn bid_for(&self, tick: &Tick, symbol: &str) -> Option<f64> {
        if symbol == self.primary_symbol {
            Some(tick.bid_primary)
        } else if symbol == self.secondary_symbol {
            Some(tick.bid_secondary)
        } else {
            None
        }
    }
}

#[async_trait]
impl MarketFeed for ReplayFeed {
    async fn subscribe(&self) -> Result<mpsc::Receiver<Tick>> {
        let (tx, rx) = mpsc::channel(64);
        let ticks: Vec<Tick> = self
            .ticks
            .iter()
            .copied()
            .filter(|t| t.t >= self.live_from_ms)
            .collect();
        let interval = self.playback_interval_ms;

        tokio::spawn(async move {
            for tick in ticks {
                if tx.send(tick).await.is_err() {
                    break;
                }
                if interval > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(interval)).await;
                }
            }
            // Dropping tx ends the stream; the data pump observes the close.
        });
        Ok(rx)
    }

    async fn history(
        &self,
        symbol: &str,
        bar_period_secs: u64,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<HistoryBar>> {
        let period_ms = (bar_period_secs * 1000) as i64;
        let to_ms = to_ms.min(self.live_from_ms - 1);
        let mut bars: Vec<HistoryBar> = Vec::new();

        for tick in &self.ticks {
            if tick.t < from_ms || tick.t > to_ms {
                continue;
            }
            let Some(bid) = self.bid_for(tick, symbol) else {
                bail!("unknown symbol {symbol} in history request");
            };
            let bucket = bucket_of(tick.t, period_ms);
            match bars.last_mut() {
                Some(last) if last.t == bucket => last.close = bid,
                _ => bars.push(HistoryBar {
                    t: bucket,
                    close: bid,
                }),
            }
        }
        Ok(bars)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        self.infos
            .get(symbol)
            .copied()
            .with_context(|| format!("no symbol info for {symbol}"))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const H1_MS: i64 = 3_600_000;

    fn infos() -> HashMap<String, SymbolInfo> {
        let mut m = HashMap::new();
        m.insert(
            "XAUUSD".to_string(),
            SymbolInfo {
                contract_size: 100.0,
                min_lot: 0.01,
                lot_step: 0.01,
                tick_size: 0.01,
            },
        );
        m.insert(
            "XAGUSD".to_string(),
            SymbolInfo {
                contract_size: 5000.0,
                min_lot: 0.01,
                lot_step: 0.01,
                tick_size: 0.001,
            },
        );
        m
    }

    fn tick(t: i64, p: f64, s: f64) -> Tick {
        Tick {
            t,
            bid_primary: p,
            ask_primary: p + 0.5,
            bid_secondary: s,
            ask_secondary: s + 0.01,
        }
    }

    fn ticks() -> Vec<Tick> {
        vec![
            tick(0, 2600.0, 30.0),
            tick(30 * 60_000, 2601.0, 30.1),
            tick(H1_MS, 2602.0, 30.2),
            tick(H1_MS + 60_000, 2603.0, 30.3),
            tick(2 * H1_MS, 2604.0, 30.4),
        ]
    }

    #[tokio::test]
    async fn history_buckets_ticks_into_bars() {
        // Everything before the split is history.
        let feed = ReplayFeed::from_ticks(ticks(), i64::MAX, "XAUUSD", "XAGUSD", infos());
        let bars = feed.history("XAUUSD", 3600, 0, i64::MAX - 1).await.unwrap();
        assert_eq!(bars.len(), 3);
        // Closes are the last tick of each hour.
        assert_eq!(bars[0].t, 0);
        assert_eq!(bars[0].close, 2601.0);
        assert_eq!(bars[1].close, 2603.0);
        assert_eq!(bars[2].close, 2604.0);

        let bars = feed.history("XAGUSD", 3600, 0, i64::MAX - 1).await.unwrap();
        assert_eq!(bars[0].close, 30.1);
    }

    #[tokio::test]
    async fn history_rejects_unknown_symbol() {
        let feed = ReplayFeed::from_ticks(ticks(), i64::MAX, "XAUUSD", "XAGUSD", infos());
        assert!(feed.history("EURUSD", 3600, 0, i64::MAX - 1).await.is_err());
    }

    #[tokio::test]
    async fn subscribe_replays_the_live_tail_in_order() {
        let feed = ReplayFeed::from_ticks(ticks(), i64::MIN, "XAUUSD", "XAGUSD", infos());
        let mut rx = feed.subscribe().await.unwrap();
        let mut seen = Vec::new();
        while let Some(tick) = rx.recv().await {
            seen.push(tick.t);
        }
        assert_eq!(seen, vec![0, 30 * 60_000, H1_MS, H1_MS + 60_000, 2 * H1_MS]);
    }

    #[tokio::test]
    async fn split_separates_history_from_live() {
        // Split at the 2-hour mark: 4 history ticks, 1 live tick.
        let feed = ReplayFeed::from_ticks(ticks(), 2 * H1_MS, "XAUUSD", "XAGUSD", infos());

        let bars = feed.history("XAUUSD", 3600, 0, i64::MAX - 1).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 2603.0);

        let mut rx = feed.subscribe().await.unwrap();
        let mut live = Vec::new();
        while let Some(tick) = rx.recv().await {
            live.push(tick.t);
        }
        assert_eq!(live, vec![2 * H1_MS]);
    }

    #[tokio::test]
    async fn symbol_info_lookup() {
        let feed = ReplayFeed::from_ticks(ticks(), i64::MAX, "XAUUSD", "XAGUSD", infos());
        let info = feed.symbol_info("XAGUSD").await.unwrap();
        assert_eq!(info.contract_size, 5000.0);
        assert!(feed.symbol_info("EURUSD").await.is_err());
    }
}
