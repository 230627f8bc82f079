// =============================================================================
// Execution engine — order routing for grid levels, corrections and closes
// =============================================================================
//
// Places the two legs of a grid level, single-leg volume corrections, and
// the fast parallel close path. Broker calls go through `GatewayHandle`
// (serialised, deadline-bounded); `close` is the one call allowed to run
// concurrently, bounded by a semaphore-sized worker pool.
//
// Hedge-incomplete policy: if the first leg fills and the second is
// rejected, the single leg is reported to the caller — no automatic
// unwinding. The tracker records the partial spread and a high-priority
// alert is raised upstream.
// =============================================================================

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::broker::{Clock, GatewayHandle, OrderResult, SymbolInfo};
use crate::errors::EngineError;
use crate::grid::GridLevel;
use crate::market::MarketSnapshot;
use crate::rebalance::VolumeAdjustment;
use crate::types::SpreadSide;

/// Outcome of a two-leg level execution.
#[derive(Debug, Clone)]
pub struct LevelFill {
    pub primary: OrderResult,
    /// `None` marks a hedge-incomplete fill.
    pub secondary: Option<OrderResult>,
    pub primary_lots: f64,
    pub secondary_lots: f64,
}

impl LevelFill {
    pub fn hedge_complete(&self) -> bool {
        self.secondary.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub primary_symbol: String,
    pub secondary_symbol: String,
    pub primary_info: SymbolInfo,
    pub secondary_info: SymbolInfo,
    pub volume_multiplier: f64,
    pub fast_close_workers: usize,
}

pub struct ExecutionEngine {
    gateway: GatewayHandle,
    clock: Arc<dyn Clock>,
    cfg: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(gateway: GatewayHandle, clock: Arc<dyn Clock>, cfg: ExecutionConfig) -> Self {
        Self {
            gateway,
            clock,
            cfg,
        }
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    /// Lots for one level: the level's fraction of balance buys the primary
    /// leg; the secondary leg is primary * beta (the hedge invariant).
    pub fn level_volumes(
        &self,
        level_fraction: f64,
        balance: f64,
        snapshot: &MarketSnapshot,
    ) -> Result<(f64, f64), EngineError> {
        if snapshot.primary_bid <= 0.0 {
            return Err(EngineError::StaleMarket {
                symbol: self.cfg.primary_symbol.clone(),
            });
        }
        let position_value = balance * level_fraction * self.cfg.volume_multiplier;
        let primary_notional = snapshot.primary_bid * self.cfg.primary_info.contract_size;

        let primary_lots = round_to_step(
            position_value / primary_notional,
            self.cfg.primary_info.lot_step,
        )
        .max(self.cfg.primary_info.min_lot);

        let secondary_lots = round_to_step(
            primary_lots * snapshot.hedge_ratio,
            self.cfg.secondary_info.lot_step,
        )
        .max(self.cfg.secondary_info.min_lot);

        Ok((primary_lots, secondary_lots))
    }

    // -------------------------------------------------------------------------
    // Grid level execution
    // -------------------------------------------------------------------------

    /// Place both legs of a grid level.
    ///
    /// First-leg failure aborts the action. Second-leg failure returns a
    /// hedge-incomplete `LevelFill` — the caller records the single leg and
    /// raises the warning; nothing is unwound automatically.
    pub async fn execute_level(
        &self,
        level: &GridLevel,
        side: SpreadSide,
        snapshot: &MarketSnapshot,
        balance: f64,
    ) -> Result<LevelFill, EngineError> {
        let (primary_lots, secondary_lots) =
            self.level_volumes(level.fraction, balance, snapshot)?;
        let comment = self.order_comment();

        info!(
            level = %level.name,
            side = %side,
            target_z = level.target_z,
            z = snapshot.zscore,
            primary_lots,
            secondary_lots,
            "executing grid level"
        );

        let primary = self
            .gateway
            .place_market(
                &self.cfg.primary_symbol,
                side.primary_order_side(),
                primary_lots,
                &comment,
            )
            .await?;

        let secondary = match self
            .gateway
            .place_market(
                &self.cfg.secondary_symbol,
                side.secondary_order_side(),
                secondary_lots,
                &comment,
            )
            .await
        {
            Ok(fill) => Some(fill),
            Err(e) => {
                warn!(
                    error = %e,
                    primary_ticket = primary.ticket,
                    "secondary leg failed after primary filled — HEDGE INCOMPLETE"
                );
                None
            }
        };

        Ok(LevelFill {
            primary,
            secondary,
            primary_lots,
            secondary_lots,
        })
    }

    // -------------------------------------------------------------------------
    // Volume corrections
    // -------------------------------------------------------------------------

    pub async fn execute_adjustment(
        &self,
        adjustment: &VolumeAdjustment,
    ) -> Result<OrderResult, EngineError> {
        let comment = self.order_comment();
        info!(
            spread_id = %adjustment.spread_id,
            symbol = %adjustment.symbol,
            side = %adjustment.side,
            quantity = adjustment.quantity,
            reason = %adjustment.reason,
            "executing volume rebalance"
        );
        self.gateway
            .place_market(
                &adjustment.symbol,
                adjustment.side,
                adjustment.quantity,
                &comment,
            )
            .await
    }

    /// Place one bare leg (hedge-restore path after a manual closure).
    pub async fn place_leg(
        &self,
        symbol: &str,
        side: crate::types::OrderSide,
        lots: f64,
    ) -> Result<OrderResult, EngineError> {
        let comment = self.order_comment();
        info!(symbol, %side, lots, "restoring leg");
        self.gateway
            .place_market(symbol, side, lots, &comment)
            .await
    }

    // -------------------------------------------------------------------------
    // Fast parallel close
    // -------------------------------------------------------------------------

    /// Close a set of tickets concurrently through the bounded worker pool.
    /// Returns the count of confirmed closes; timeouts are left for the
    /// monitor's reconciliation sweep.
    pub async fn close_tickets(&self, tickets: Vec<u64>) -> usize {
        if tickets.is_empty() {
            return 0;
        }
        let permits = Arc::new(Semaphore::new(self.cfg.fast_close_workers.max(1)));
        let mut set: JoinSet<(u64, Result<bool, EngineError>)> = JoinSet::new();

        for ticket in tickets {
            let gateway = self.gateway.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore open");
                let result = gateway.close(ticket).await;
                (ticket, result)
            });
        }

        let mut closed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(true))) => closed += 1,
                Ok((ticket, Ok(false))) => {
                    warn!(ticket, "close reported missing ticket — already flat")
                }
                Ok((ticket, Err(e))) => {
                    error!(ticket, error = %e, "close failed — monitor sweep will resolve")
                }
                Err(e) => error!(error = %e, "close task panicked"),
            }
        }
        closed
    }

    /// Order comment within the broker's 15-character limit; the tickets,
    /// not the comment, are the authoritative spread id.
    fn order_comment(&self) -> String {
        format!("ID:{}", self.clock.local_time().format("%H%M%S"))
    }
}

fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).round() * step
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperGateway;
    use crate::broker::{SystemClock, Tick};
    use crate::grid::LevelStatus;
    use crate::types::OrderSide;
    use parking_lot::RwLock;
    use std::time::Duration;

    fn snapshot(z: f64) -> MarketSnapshot {
        MarketSnapshot {
            seq: 1,
            timestamp_ms: 0,
            primary_bid: 2600.0,
            primary_ask: 2600.5,
            secondary_bid: 30.0,
            secondary_ask: 30.01,
            spread: 1700.0,
            zscore: z,
            spread_mean: 1700.0,
            spread_std: 10.0,
            hedge_ratio: 30.0,
            correlation: 0.9,
            window_size: 1000,
        }
    }

    fn level(fraction: f64) -> GridLevel {
        GridLevel {
            index: 0,
            name: "L0".to_string(),
            target_z: -2.0,
            fraction,
            status: LevelStatus::Waiting,
            executed_z: None,
            primary_lots: 0.0,
            secondary_lots: 0.0,
            tickets: Vec::new(),
        }
    }

    fn engine() -> (ExecutionEngine, Arc<RwLock<Option<Tick>>>) {
        let quotes: Arc<RwLock<Option<Tick>>> = Arc::new(RwLock::new(Some(Tick {
            t: 0,
            bid_primary: 2600.0,
            ask_primary: 2600.5,
            bid_secondary: 30.0,
            ask_secondary: 30.01,
        })));
        let gateway = Arc::new(PaperGateway::new(
            quotes.clone(),
            "XAUUSD",
            "XAGUSD",
            100_000.0,
        ));
        let handle = GatewayHandle::new(gateway, Duration::from_secs(10));
        let info = SymbolInfo {
            contract_size: 100.0,
            min_lot: 0.01,
            lot_step: 0.01,
            tick_size: 0.01,
        };
        let cfg = ExecutionConfig {
            primary_symbol: "XAUUSD".to_string(),
            secondary_symbol: "XAGUSD".to_string(),
            primary_info: info,
            secondary_info: SymbolInfo {
                contract_size: 5000.0,
                ..info
            },
            volume_multiplier: 1.0,
            fast_close_workers: 100,
        };
        (
            ExecutionEngine::new(handle, Arc::new(SystemClock), cfg),
            quotes,
        )
    }

    #[test]
    fn level_volumes_follow_fraction_and_beta() {
        let (engine, _) = engine();
        // 100k * 0.33 / (2600 * 100) = 0.1269... -> 0.13 lots primary,
        // secondary = 0.13 * 30 = 3.9.
        let (p, s) = engine
            .level_volumes(0.33, 100_000.0, &snapshot(-2.1))
            .unwrap();
        assert!((p - 0.13).abs() < 1e-9);
        assert!((s - 3.9).abs() < 1e-9);
    }

    #[test]
    fn tiny_fraction_clamps_to_min_lot() {
        let (engine, _) = engine();
        let (p, s) = engine
            .level_volumes(0.0001, 100_000.0, &snapshot(-2.1))
            .unwrap();
        assert_eq!(p, 0.01);
        assert!((s - 0.30).abs() < 1e-9);
    }

    #[tokio::test]
    async fn execute_level_places_both_legs() {
        let (engine, _) = engine();
        let fill = engine
            .execute_level(&level(0.33), SpreadSide::Long, &snapshot(-2.1), 100_000.0)
            .await
            .unwrap();
        assert!(fill.hedge_complete());
        let secondary = fill.secondary.unwrap();
        assert_ne!(fill.primary.ticket, secondary.ticket);
        // Long spread buys the primary at the ask, sells the secondary at the bid.
        assert_eq!(fill.primary.filled_price, 2600.5);
        assert_eq!(secondary.filled_price, 30.0);
    }

    #[tokio::test]
    async fn fast_close_pool_closes_everything() {
        let (engine, _) = engine();
        let mut tickets = Vec::new();
        for _ in 0..5 {
            let fill = engine
                .execute_level(&level(0.1), SpreadSide::Long, &snapshot(-2.1), 100_000.0)
                .await
                .unwrap();
            tickets.push(fill.primary.ticket);
            tickets.push(fill.secondary.unwrap().ticket);
        }
        let closed = engine.close_tickets(tickets).await;
        assert_eq!(closed, 10);
    }

    #[tokio::test]
    async fn close_tickets_tolerates_missing() {
        let (engine, _) = engine();
        let closed = engine.close_tickets(vec![404, 405]).await;
        assert_eq!(closed, 0);
    }

    #[tokio::test]
    async fn adjustment_routes_to_the_named_leg() {
        let (engine, _) = engine();
        let fill = engine
            .execute_adjustment(&VolumeAdjustment {
                spread_id: "1-2".to_string(),
                symbol: "XAUUSD".to_string(),
                side: OrderSide::Sell,
                quantity: 0.02,
                reason: "test".to_string(),
                beta_before: 30.0,
                beta_after: 35.0,
                imbalance: 0.0143,
                primary_leg: true,
            })
            .await
            .unwrap();
        assert_eq!(fill.filled_lots, 0.02);
        assert_eq!(fill.filled_price, 2600.0);
    }

    #[test]
    fn comment_fits_broker_limit() {
        let (engine, _) = engine();
        let comment = engine.order_comment();
        assert!(comment.starts_with("ID:"));
        assert!(comment.len() <= 15);
    }
}
