// =============================================================================
// Position tracker — authoritative record of spread legs and P&L (C5)
// =============================================================================
//
// Owns two maps: spread_id -> SpreadState and ticket -> Position. Opening a
// spread creates two leg positions linked by the derived spread id
// ("{primary_ticket}-{secondary_ticket}", broker-verifiable). Prices flow in
// from the tick handler; realisation happens on close.
//
// Invariants:
//   - no two open positions share a ticket;
//   - every open position belongs to exactly one open spread;
//   - sign(primary_lots) = -sign(secondary_lots) for a complete hedge.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::OrderResult;
use crate::types::{OrderSide, SpreadSide};

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// One broker leg of a spread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: OrderSide,
    /// Lot magnitude; the side carries the sign.
    pub lots: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub spread_id: String,
    pub opened_at: String,
}

/// Per-open-spread record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadState {
    pub spread_id: String,
    pub side: SpreadSide,
    pub entry_z: f64,
    pub last_z_entry: f64,
    pub next_z_entry: f64,
    /// Rolling spread mean at first entry, kept for the persisted state file.
    pub first_entry_spread_mean: f64,
    pub primary_symbol: String,
    pub secondary_symbol: String,
    /// Signed lots: positive long, negative short.
    pub primary_lots: f64,
    pub secondary_lots: f64,
    pub entry_hedge_ratio: f64,
    pub entry_time: String,
    /// False while only the first leg is filled (hedge-incomplete).
    pub hedge_complete: bool,
}

/// History entry for a realised spread.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedSpread {
    pub spread_id: String,
    pub side: SpreadSide,
    pub realized_pnl: f64,
    pub reason: String,
    pub closed_at: String,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct PositionTracker {
    spreads: RwLock<HashMap<String, SpreadState>>,
    positions: RwLock<HashMap<u64, Position>>,
    closed: RwLock<Vec<ClosedSpread>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            spreads: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    /// Register a freshly opened spread. `secondary` is `None` for a
    /// hedge-incomplete entry (first leg filled, second rejected).
    ///
    /// Returns the derived spread id.
    #[allow(clippy::too_many_arguments)]
    pub fn open_spread(
        &self,
        side: SpreadSide,
        entry_z: f64,
        spread_mean: f64,
        hedge_ratio: f64,
        scale_interval: f64,
        primary_symbol: &str,
        secondary_symbol: &str,
        primary: &OrderResult,
        secondary: Option<&OrderResult>,
    ) -> Result<String> {
        let secondary_ticket = secondary.map(|s| s.ticket).unwrap_or(0);
        let spread_id = format!("{}-{}", primary.ticket, secondary_ticket);
        let now = Utc::now().to_rfc3339();

        {
            let positions = self.positions.read();
            if positions.contains_key(&primary.ticket)
                || secondary.is_some_and(|s| positions.contains_key(&s.ticket))
            {
                bail!("duplicate ticket while opening spread {spread_id}");
            }
        }
        if self.spreads.read().contains_key(&spread_id) {
            bail!("duplicate spread id {spread_id}");
        }

        let dir = side.direction();
        let state = SpreadState {
            spread_id: spread_id.clone(),
            side,
            entry_z,
            last_z_entry: entry_z,
            next_z_entry: entry_z - dir * scale_interval,
            first_entry_spread_mean: spread_mean,
            primary_symbol: primary_symbol.to_string(),
            secondary_symbol: secondary_symbol.to_string(),
            primary_lots: dir * primary.filled_lots,
            secondary_lots: secondary.map(|s| -dir * s.filled_lots).unwrap_or(0.0),
            entry_hedge_ratio: hedge_ratio,
            entry_time: now.clone(),
            hedge_complete: secondary.is_some(),
        };

        let mut positions = self.positions.write();
        positions.insert(
            primary.ticket,
            Self::leg(
                primary,
                primary_symbol,
                side.primary_order_side(),
                &spread_id,
                &now,
            ),
        );
        if let Some(sec) = secondary {
            positions.insert(
                sec.ticket,
                Self::leg(
                    sec,
                    secondary_symbol,
                    side.secondary_order_side(),
                    &spread_id,
                    &now,
                ),
            );
        }
        drop(positions);

        self.spreads.write().insert(spread_id.clone(), state);

        info!(
            spread_id = %spread_id,
            side = %side,
            entry_z,
            hedge_ratio,
            hedge_complete = secondary.is_some(),
            "spread opened"
        );
        Ok(spread_id)
    }

    fn leg(
        fill: &OrderResult,
        symbol: &str,
        order_side: OrderSide,
        spread_id: &str,
        now: &str,
    ) -> Position {
        Position {
            ticket: fill.ticket,
            symbol: symbol.to_string(),
            side: order_side,
            lots: fill.filled_lots,
            entry_price: fill.filled_price,
            current_price: fill.filled_price,
            unrealized_pnl: 0.0,
            spread_id: spread_id.to_string(),
            opened_at: now.to_string(),
        }
    }

    /// Fold a pyramid level's fills into an existing spread.
    #[allow(clippy::too_many_arguments)]
    pub fn add_fill(
        &self,
        spread_id: &str,
        executed_z: f64,
        scale_interval: f64,
        primary_symbol: &str,
        secondary_symbol: &str,
        primary: &OrderResult,
        secondary: Option<&OrderResult>,
    ) -> Result<()> {
        let mut spreads = self.spreads.write();
        let Some(state) = spreads.get_mut(spread_id) else {
            bail!("unknown spread {spread_id}");
        };
        let side = state.side;
        let dir = side.direction();
        let now = Utc::now().to_rfc3339();

        state.primary_lots += dir * primary.filled_lots;
        if let Some(sec) = secondary {
            state.secondary_lots += -dir * sec.filled_lots;
        }
        state.last_z_entry = executed_z;
        state.next_z_entry = executed_z - dir * scale_interval;
        drop(spreads);

        let mut positions = self.positions.write();
        positions.insert(
            primary.ticket,
            Self::leg(
                primary,
                primary_symbol,
                side.primary_order_side(),
                spread_id,
                &now,
            ),
        );
        if let Some(sec) = secondary {
            positions.insert(
                sec.ticket,
                Self::leg(
                    sec,
                    secondary_symbol,
                    side.secondary_order_side(),
                    spread_id,
                    &now,
                ),
            );
        }
        Ok(())
    }

    /// Fold a single-leg volume correction into the spread.
    pub fn apply_adjustment(
        &self,
        spread_id: &str,
        symbol: &str,
        side: OrderSide,
        fill: &OrderResult,
        primary_leg: bool,
        new_hedge_ratio: f64,
    ) -> Result<()> {
        let mut spreads = self.spreads.write();
        let Some(state) = spreads.get_mut(spread_id) else {
            bail!("unknown spread {spread_id}");
        };

        let delta = side.direction() * fill.filled_lots;
        if primary_leg {
            state.primary_lots += delta;
        } else {
            state.secondary_lots += delta;
        }
        state.entry_hedge_ratio = new_hedge_ratio;
        drop(spreads);

        self.positions.write().insert(
            fill.ticket,
            Self::leg(
                fill,
                symbol,
                side,
                spread_id,
                &Utc::now().to_rfc3339(),
            ),
        );

        info!(
            spread_id,
            symbol,
            side = %side,
            lots = fill.filled_lots,
            "volume adjustment applied to spread"
        );
        Ok(())
    }

    /// Attach a replacement leg to an existing spread without touching its
    /// lot totals (hedge-restore after an external closure).
    pub fn attach_leg(
        &self,
        spread_id: &str,
        symbol: &str,
        side: OrderSide,
        fill: &OrderResult,
    ) -> Result<()> {
        if !self.spreads.read().contains_key(spread_id) {
            bail!("unknown spread {spread_id}");
        }
        self.positions.write().insert(
            fill.ticket,
            Self::leg(fill, symbol, side, spread_id, &Utc::now().to_rfc3339()),
        );
        info!(spread_id, symbol, ticket = fill.ticket, "leg restored");
        Ok(())
    }

    /// Re-create a spread from the persisted state file on restart. Leg
    /// positions are rebuilt later from the broker snapshot.
    pub fn restore_spread(&self, state: SpreadState) {
        info!(spread_id = %state.spread_id, side = %state.side, "spread restored from state file");
        self.spreads.write().insert(state.spread_id.clone(), state);
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Refresh one leg's price and unrealised P&L.
    pub fn update_price(&self, ticket: u64, price: f64) {
        if let Some(pos) = self.positions.write().get_mut(&ticket) {
            pos.current_price = price;
            pos.unrealized_pnl = (price - pos.entry_price) * pos.lots * pos.side.direction();
        }
    }

    /// Update every leg of a symbol from the live quote.
    pub fn update_symbol_price(&self, symbol: &str, price: f64) {
        let mut positions = self.positions.write();
        for pos in positions.values_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = price;
            pos.unrealized_pnl = (price - pos.entry_price) * pos.lots * pos.side.direction();
        }
    }

    /// Rebuild a missing leg record from the broker snapshot (manual
    /// position sync after restart).
    pub fn sync_leg_from_broker(&self, broker: &crate::broker::BrokerPosition, spread_id: &str) {
        let mut positions = self.positions.write();
        if positions.contains_key(&broker.ticket) {
            return;
        }
        positions.insert(
            broker.ticket,
            Position {
                ticket: broker.ticket,
                symbol: broker.symbol.clone(),
                side: broker.side,
                lots: broker.lots,
                entry_price: broker.open_price,
                current_price: broker.current_price,
                unrealized_pnl: broker.unrealised,
                spread_id: spread_id.to_string(),
                opened_at: Utc::now().to_rfc3339(),
            },
        );
        info!(ticket = broker.ticket, spread_id, "leg rebuilt from broker snapshot");
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Realise both legs of a spread, move it to history, and return the
    /// total realised P&L. `None` if the spread is unknown.
    pub fn close_spread(
        &self,
        spread_id: &str,
        exit_primary_px: f64,
        exit_secondary_px: f64,
        reason: &str,
    ) -> Option<f64> {
        let state = self.spreads.write().remove(spread_id)?;

        let mut realized = 0.0;
        let mut positions = self.positions.write();
        let tickets: Vec<u64> = positions
            .values()
            .filter(|p| p.spread_id == spread_id)
            .map(|p| p.ticket)
            .collect();
        for ticket in tickets {
            if let Some(pos) = positions.remove(&ticket) {
                // Pyramid and adjustment legs share the entry legs' symbols,
                // so the exit price is chosen per symbol.
                let px = if pos.symbol == state.primary_symbol {
                    exit_primary_px
                } else {
                    exit_secondary_px
                };
                realized += (px - pos.entry_price) * pos.lots * pos.side.direction();
            }
        }
        drop(positions);

        let record = ClosedSpread {
            spread_id: spread_id.to_string(),
            side: state.side,
            realized_pnl: realized,
            reason: reason.to_string(),
            closed_at: Utc::now().to_rfc3339(),
        };
        info!(
            spread_id,
            reason,
            realized_pnl = realized,
            "spread closed"
        );
        self.closed.write().push(record);
        Some(realized)
    }

    /// Drop all open state without realising anything (external closure —
    /// the broker already realised it).
    pub fn clear_all(&self) {
        let spreads = self.spreads.write().drain().count();
        let legs = self.positions.write().drain().count();
        if spreads > 0 || legs > 0 {
            warn!(spreads, legs, "tracker cleared without realisation");
        }
    }

    /// Remove one leg that disappeared at the broker.
    pub fn remove_ticket(&self, ticket: u64) -> Option<Position> {
        self.positions.write().remove(&ticket)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_spread(&self, spread_id: &str) -> Option<SpreadState> {
        self.spreads.read().get(spread_id).cloned()
    }

    pub fn open_spreads(&self) -> Vec<SpreadState> {
        self.spreads.read().values().cloned().collect()
    }

    pub fn open_spread_ids(&self) -> Vec<String> {
        self.spreads.read().keys().cloned().collect()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn tickets(&self) -> Vec<u64> {
        self.positions.read().keys().copied().collect()
    }

    pub fn tickets_for_spread(&self, spread_id: &str) -> Vec<u64> {
        self.positions
            .read()
            .values()
            .filter(|p| p.spread_id == spread_id)
            .map(|p| p.ticket)
            .collect()
    }

    pub fn position(&self, ticket: u64) -> Option<Position> {
        self.positions.read().get(&ticket).cloned()
    }

    /// Sum of leg unrealised P&L for one spread.
    pub fn spread_unrealised(&self, spread_id: &str) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.spread_id == spread_id)
            .map(|p| p.unrealized_pnl)
            .sum()
    }

    pub fn unrealised_total(&self) -> f64 {
        self.positions.read().values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn closed_history(&self, count: usize) -> Vec<ClosedSpread> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    pub fn realised_total(&self) -> f64 {
        self.closed.read().iter().map(|c| c.realized_pnl).sum()
    }
}

/// Parse both tickets back out of a spread id.
pub fn tickets_from_spread_id(spread_id: &str) -> Option<(u64, u64)> {
    let (p, s) = spread_id.split_once('-')?;
    Some((p.parse().ok()?, s.parse().ok()?))
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionTracker")
            .field("open_spreads", &self.spreads.read().len())
            .field("open_positions", &self.positions.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ticket: u64, lots: f64, price: f64) -> OrderResult {
        OrderResult {
            ticket,
            filled_lots: lots,
            filled_price: price,
        }
    }

    fn open_long(tracker: &PositionTracker) -> String {
        tracker
            .open_spread(
                SpreadSide::Long,
                -2.1,
                1700.0,
                30.0,
                0.5,
                "XAUUSD",
                "XAGUSD",
                &fill(101, 0.10, 2600.0),
                Some(&fill(102, 3.00, 30.0)),
            )
            .unwrap()
    }

    #[test]
    fn spread_id_derives_from_tickets() {
        let tracker = PositionTracker::new();
        let id = open_long(&tracker);
        assert_eq!(id, "101-102");
        assert_eq!(tickets_from_spread_id(&id), Some((101, 102)));
    }

    #[test]
    fn leg_signs_follow_spread_side() {
        let tracker = PositionTracker::new();
        let id = open_long(&tracker);
        let state = tracker.get_spread(&id).unwrap();
        assert!(state.primary_lots > 0.0);
        assert!(state.secondary_lots < 0.0);
        assert!(state.hedge_complete);
        assert_eq!(state.next_z_entry, -2.6);

        let short = tracker
            .open_spread(
                SpreadSide::Short,
                2.2,
                1700.0,
                30.0,
                0.5,
                "XAUUSD",
                "XAGUSD",
                &fill(201, 0.10, 2600.0),
                Some(&fill(202, 3.00, 30.0)),
            )
            .unwrap();
        let state = tracker.get_spread(&short).unwrap();
        assert!(state.primary_lots < 0.0);
        assert!(state.secondary_lots > 0.0);
        assert_eq!(state.next_z_entry, 2.7);
    }

    #[test]
    fn duplicate_tickets_rejected() {
        let tracker = PositionTracker::new();
        open_long(&tracker);
        let err = tracker.open_spread(
            SpreadSide::Long,
            -2.0,
            1700.0,
            30.0,
            0.5,
            "XAUUSD",
            "XAGUSD",
            &fill(101, 0.10, 2600.0),
            Some(&fill(300, 3.00, 30.0)),
        );
        assert!(err.is_err());
    }

    #[test]
    fn price_update_recomputes_unrealised() {
        let tracker = PositionTracker::new();
        let id = open_long(&tracker);

        tracker.update_price(101, 2610.0);
        tracker.update_price(102, 29.5);

        // Long primary: (2610 - 2600) * 0.10 = +1.0
        assert!((tracker.position(101).unwrap().unrealized_pnl - 1.0).abs() < 1e-9);
        // Short secondary: (29.5 - 30) * 3.0 * -1 = +1.5
        assert!((tracker.position(102).unwrap().unrealized_pnl - 1.5).abs() < 1e-9);
        assert!((tracker.spread_unrealised(&id) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn round_trip_back_to_entry_realises_zero() {
        let tracker = PositionTracker::new();
        let id = open_long(&tracker);

        tracker.update_price(101, 2650.0);
        tracker.update_price(102, 31.0);

        let pnl = tracker.close_spread(&id, 2600.0, 30.0, "MeanReversion").unwrap();
        assert!(pnl.abs() < 1e-9, "fee-free round trip should realise ~0, got {pnl}");
        assert!(tracker.get_spread(&id).is_none());
        assert!(tracker.open_positions().is_empty());
        assert_eq!(tracker.closed_history(10).len(), 1);
    }

    #[test]
    fn close_realises_both_legs() {
        let tracker = PositionTracker::new();
        let id = open_long(&tracker);

        // Primary +10 on 0.10 lots = +1.0; secondary (short 3 lots) down 0.5 = +1.5.
        let pnl = tracker.close_spread(&id, 2610.0, 29.5, "MeanReversion").unwrap();
        assert!((pnl - 2.5).abs() < 1e-9);
        assert!((tracker.realised_total() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn pyramid_fill_accumulates_lots_and_triggers() {
        let tracker = PositionTracker::new();
        let id = open_long(&tracker);

        tracker
            .add_fill(
                &id,
                -2.6,
                0.5,
                "XAUUSD",
                "XAGUSD",
                &fill(103, 0.10, 2590.0),
                Some(&fill(104, 3.00, 29.8)),
            )
            .unwrap();

        let state = tracker.get_spread(&id).unwrap();
        assert!((state.primary_lots - 0.20).abs() < 1e-9);
        assert!((state.secondary_lots + 6.00).abs() < 1e-9);
        assert_eq!(state.last_z_entry, -2.6);
        assert_eq!(state.next_z_entry, -3.1);
        assert_eq!(tracker.tickets_for_spread(&id).len(), 4);
    }

    #[test]
    fn hedge_incomplete_entry_records_single_leg() {
        let tracker = PositionTracker::new();
        let id = tracker
            .open_spread(
                SpreadSide::Long,
                -2.0,
                1700.0,
                30.0,
                0.5,
                "XAUUSD",
                "XAGUSD",
                &fill(501, 0.10, 2600.0),
                None,
            )
            .unwrap();
        let state = tracker.get_spread(&id).unwrap();
        assert!(!state.hedge_complete);
        assert_eq!(state.secondary_lots, 0.0);
        assert_eq!(tracker.tickets_for_spread(&id).len(), 1);
    }

    #[test]
    fn adjustment_updates_leg_and_hedge_ratio() {
        let tracker = PositionTracker::new();
        let id = open_long(&tracker);

        // SELL 0.02 primary after beta drifted to 35.
        tracker
            .apply_adjustment(&id, "XAUUSD", OrderSide::Sell, &fill(110, 0.02, 2605.0), true, 35.0)
            .unwrap();

        let state = tracker.get_spread(&id).unwrap();
        assert!((state.primary_lots - 0.08).abs() < 1e-9);
        assert_eq!(state.entry_hedge_ratio, 35.0);
        assert!(tracker.position(110).is_some());
    }

    #[test]
    fn clear_all_empties_everything() {
        let tracker = PositionTracker::new();
        open_long(&tracker);
        tracker.clear_all();
        assert!(tracker.open_spreads().is_empty());
        assert!(tracker.tickets().is_empty());
    }
}
