// =============================================================================
// Daily risk gate — loss caps and the trading lock (C6)
// =============================================================================
//
// Three independent caps, evaluated every risk tick:
//   1. Per-setup loss — one spread's unrealised loss exceeds its share of
//      balance: close that spread only.
//   2. Session loss — realised-since-session-start plus total unrealised
//      breaches the session limit: close everything and LOCK trading until
//      the next session start.
//   3. Margin safety — margin level under the floor: close everything.
//
// Sessions are wall-clock intervals anchored at the configured HH:MM.
// Crossing the boundary unlocks trading and resets realised P&L; history is
// retained. The session key is re-checked on every call, so a long-idle
// engine rolls over on its next evaluation.
// =============================================================================

use chrono::{DateTime, Duration, Local, NaiveDateTime};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::Clock;
use crate::types::ExitReason;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RiskConfig {
    /// Max loss for one open spread, percent of balance.
    pub max_loss_per_setup_pct: f64,
    /// Session loss limit, percent of session-start balance.
    pub daily_loss_limit_pct: f64,
    /// Minimum margin level (percent). Ignored while no margin is in use.
    pub margin_level_floor_pct: f64,
    /// Session anchor, local wall clock.
    pub session_start: (u32, u32),
}

/// Serialisable ledger snapshot for the status API and the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLedger {
    pub session_start_balance: f64,
    pub realised_since_start: f64,
    #[serde(default)]
    pub unrealised_total: f64,
    pub trading_locked: bool,
    pub locked_at: Option<String>,
    pub locked_until: Option<String>,
    #[serde(default)]
    pub open_setups: usize,
    /// Date key of the session the ledger belongs to.
    pub session_key: String,
}

/// Commanded state transition. Not an error — the executor carries it out.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskCommand {
    CloseSpread { spread_id: String },
    CloseAll { reason: ExitReason },
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

struct Inner {
    session_start_balance: f64,
    realised: f64,
    unrealised: f64,
    open_setups: usize,
    trading_locked: bool,
    locked_at: Option<NaiveDateTime>,
    locked_until: Option<NaiveDateTime>,
    session_key: String,
}

pub struct RiskGate {
    cfg: RiskConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
}

impl RiskGate {
    /// `persisted_realised` restores a mid-session restart; `None` starts the
    /// ledger at zero (the caller records the discrepancy as a warning).
    pub fn new(
        cfg: RiskConfig,
        clock: Arc<dyn Clock>,
        starting_balance: f64,
        persisted_realised: Option<f64>,
    ) -> Self {
        let key = session_key(clock.local_time(), cfg.session_start);
        info!(
            session_key = %key,
            daily_loss_limit_pct = cfg.daily_loss_limit_pct,
            max_loss_per_setup_pct = cfg.max_loss_per_setup_pct,
            margin_floor = cfg.margin_level_floor_pct,
            "risk gate initialised"
        );
        Self {
            cfg,
            clock,
            inner: RwLock::new(Inner {
                session_start_balance: starting_balance,
                realised: persisted_realised.unwrap_or(0.0),
                unrealised: 0.0,
                open_setups: 0,
                trading_locked: false,
                locked_at: None,
                locked_until: None,
                session_key: key,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Session rollover
    // -------------------------------------------------------------------------

    /// Re-anchor the ledger if the wall clock crossed a session start.
    /// Returns `true` when a rollover happened.
    pub fn maybe_roll_session(&self, current_balance: f64) -> bool {
        let now = self.clock.local_time();
        let key = session_key(now, self.cfg.session_start);
        {
            let inner = self.inner.read();
            if inner.session_key == key {
                return false;
            }
        }
        let mut inner = self.inner.write();
        // Double-check under the write lock.
        if inner.session_key == key {
            return false;
        }
        info!(
            old_session = %inner.session_key,
            new_session = %key,
            "session rolled — unlocking and resetting realised P&L"
        );
        inner.session_key = key;
        inner.realised = 0.0;
        inner.session_start_balance = current_balance;
        inner.trading_locked = false;
        inner.locked_at = None;
        inner.locked_until = None;
        true
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    pub fn record_realised(&self, pnl: f64) {
        let mut inner = self.inner.write();
        inner.realised += pnl;
    }

    // -------------------------------------------------------------------------
    // Cap evaluation
    // -------------------------------------------------------------------------

    /// Evaluate all three caps. `margin_level` is `None` while no margin is
    /// in use. `per_spread` carries (spread_id, unrealised P&L).
    pub fn evaluate(
        &self,
        balance: f64,
        margin_level: Option<f64>,
        unrealised_total: f64,
        per_spread: &[(String, f64)],
    ) -> Vec<RiskCommand> {
        let mut inner = self.inner.write();
        inner.unrealised = unrealised_total;
        inner.open_setups = per_spread.len();

        if inner.trading_locked {
            // Already commanded close-all; nothing further until unlock.
            return Vec::new();
        }

        // 3rd cap first in severity order would also be fine; margin breach
        // is checked before the session cap because a margin call closes
        // positions without locking the session.
        if let Some(level) = margin_level {
            if level > 0.0 && level < self.cfg.margin_level_floor_pct {
                warn!(
                    margin_level = level,
                    floor = self.cfg.margin_level_floor_pct,
                    "margin level under floor — closing all"
                );
                return vec![RiskCommand::CloseAll {
                    reason: ExitReason::MarginFloor,
                }];
            }
        }

        // Session cap: realised + unrealised against the session-start
        // balance. Breach at EXACTLY the limit locks.
        let session_total = inner.realised + unrealised_total;
        let session_limit = inner.session_start_balance * self.cfg.daily_loss_limit_pct / 100.0;
        if session_total <= -session_limit {
            let now = self.clock.local_time().naive_local();
            let until = next_session_start(self.clock.local_time(), self.cfg.session_start);
            inner.trading_locked = true;
            inner.locked_at = Some(now);
            inner.locked_until = Some(until);
            warn!(
                session_total,
                session_limit,
                locked_until = %until,
                "session loss limit breached — trading locked"
            );
            return vec![RiskCommand::CloseAll {
                reason: ExitReason::SessionLossCap,
            }];
        }

        // Per-setup cap.
        let setup_limit = balance * self.cfg.max_loss_per_setup_pct / 100.0;
        let mut commands = Vec::new();
        for (spread_id, unrealised) in per_spread {
            if *unrealised <= -setup_limit {
                warn!(
                    spread_id = %spread_id,
                    unrealised,
                    setup_limit,
                    "per-setup loss cap breached — closing spread"
                );
                commands.push(RiskCommand::CloseSpread {
                    spread_id: spread_id.clone(),
                });
            }
        }
        commands
    }

    // -------------------------------------------------------------------------
    // Lock queries
    // -------------------------------------------------------------------------

    /// A new grid activation must pass this gate.
    pub fn try_activate(&self) -> Result<(), String> {
        let inner = self.inner.read();
        if inner.trading_locked {
            let until = inner
                .locked_until
                .map(|t| t.to_string())
                .unwrap_or_else(|| "next session".to_string());
            return Err(format!("trading locked until {until}"));
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.read().trading_locked
    }

    /// Operator override via the REST surface.
    pub fn unlock_manual(&self) {
        let mut inner = self.inner.write();
        if inner.trading_locked {
            inner.trading_locked = false;
            inner.locked_at = None;
            inner.locked_until = None;
            warn!("trading lock cleared manually");
        }
    }

    pub fn ledger(&self) -> RiskLedger {
        let inner = self.inner.read();
        RiskLedger {
            session_start_balance: inner.session_start_balance,
            realised_since_start: inner.realised,
            unrealised_total: inner.unrealised,
            trading_locked: inner.trading_locked,
            locked_at: inner.locked_at.map(|t| t.to_string()),
            locked_until: inner.locked_until.map(|t| t.to_string()),
            open_setups: inner.open_setups,
            session_key: inner.session_key.clone(),
        }
    }
}

impl std::fmt::Debug for RiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("RiskGate")
            .field("session_key", &inner.session_key)
            .field("trading_locked", &inner.trading_locked)
            .field("realised", &inner.realised)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Session arithmetic
// ---------------------------------------------------------------------------

/// Date key of the session containing `now`: the date of the most recent
/// session start at or before `now`.
pub fn session_key(now: DateTime<Local>, (h, m): (u32, u32)) -> String {
    let today_start = now
        .date_naive()
        .and_hms_opt(h, m, 0)
        .unwrap_or_else(|| now.date_naive().and_hms_opt(0, 0, 0).expect("midnight"));
    let date = if now.naive_local() >= today_start {
        now.date_naive()
    } else {
        now.date_naive() - Duration::days(1)
    };
    date.format("%Y-%m-%d").to_string()
}

/// First session start strictly after `now`.
fn next_session_start(now: DateTime<Local>, (h, m): (u32, u32)) -> NaiveDateTime {
    let today_start = now
        .date_naive()
        .and_hms_opt(h, m, 0)
        .unwrap_or_else(|| now.date_naive().and_hms_opt(0, 0, 0).expect("midnight"));
    if now.naive_local() < today_start {
        today_start
    } else {
        today_start + Duration::days(1)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FakeClock {
        now: RwLock<DateTime<Local>>,
    }

    impl FakeClock {
        fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Arc<Self> {
            Arc::new(Self {
                now: RwLock::new(Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()),
            })
        }

        fn set(&self, y: i32, mo: u32, d: u32, h: u32, mi: u32) {
            *self.now.write() = Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now.read().timestamp_millis().max(0) as u64
        }
        fn local_time(&self) -> DateTime<Local> {
            *self.now.read()
        }
    }

    fn cfg() -> RiskConfig {
        RiskConfig {
            max_loss_per_setup_pct: 2.0,
            daily_loss_limit_pct: 5.0,
            margin_level_floor_pct: 150.0,
            session_start: (0, 0),
        }
    }

    fn gate(clock: Arc<FakeClock>) -> RiskGate {
        RiskGate::new(cfg(), clock, 100_000.0, None)
    }

    #[test]
    fn session_loss_exactly_at_limit_locks() {
        let clock = FakeClock::at(2026, 1, 5, 10, 0);
        let gate = gate(clock);

        // One cent inside the limit: nothing happens.
        let cmds = gate.evaluate(100_000.0, None, -4_999.99, &[]);
        assert!(cmds.is_empty());
        assert!(!gate.is_locked());

        // Exactly -5000: lock and close everything.
        let cmds = gate.evaluate(100_000.0, None, -5_000.0, &[]);
        assert_eq!(
            cmds,
            vec![RiskCommand::CloseAll {
                reason: ExitReason::SessionLossCap
            }]
        );
        assert!(gate.is_locked());

        let ledger = gate.ledger();
        assert!(ledger.trading_locked);
        assert!(ledger.locked_until.is_some());
    }

    #[test]
    fn locked_gate_rejects_activation_and_stays_quiet() {
        let clock = FakeClock::at(2026, 1, 5, 10, 0);
        let gate = gate(clock);
        gate.evaluate(100_000.0, None, -6_000.0, &[]);
        assert!(gate.is_locked());

        assert!(gate.try_activate().is_err());
        // Once locked, no further commands fire.
        assert!(gate.evaluate(100_000.0, None, -9_000.0, &[]).is_empty());
    }

    #[test]
    fn per_setup_cap_closes_only_that_spread() {
        let clock = FakeClock::at(2026, 1, 5, 10, 0);
        let gate = gate(clock);

        let spreads = vec![
            ("101-102".to_string(), -2_000.0),
            ("201-202".to_string(), -500.0),
        ];
        let cmds = gate.evaluate(100_000.0, None, -2_500.0, &spreads);
        assert_eq!(
            cmds,
            vec![RiskCommand::CloseSpread {
                spread_id: "101-102".to_string()
            }]
        );
        assert!(!gate.is_locked());
    }

    #[test]
    fn margin_floor_closes_all_without_locking() {
        let clock = FakeClock::at(2026, 1, 5, 10, 0);
        let gate = gate(clock);
        let cmds = gate.evaluate(100_000.0, Some(120.0), -100.0, &[]);
        assert_eq!(
            cmds,
            vec![RiskCommand::CloseAll {
                reason: ExitReason::MarginFloor
            }]
        );
        assert!(!gate.is_locked());

        // No margin in use: the floor does not apply.
        assert!(gate.evaluate(100_000.0, None, -100.0, &[]).is_empty());
    }

    #[test]
    fn session_rollover_unlocks_and_resets_realised() {
        let clock = FakeClock::at(2026, 1, 5, 10, 0);
        let gate = RiskGate::new(
            RiskConfig {
                session_start: (9, 30),
                ..cfg()
            },
            clock.clone(),
            100_000.0,
            None,
        );
        gate.record_realised(-6_000.0);
        gate.evaluate(100_000.0, None, 0.0, &[]);
        assert!(gate.is_locked());

        // Still the same session late that night.
        clock.set(2026, 1, 5, 23, 0);
        assert!(!gate.maybe_roll_session(94_000.0));
        assert!(gate.is_locked());

        // Crossing the next 09:30 anchor rolls the session.
        clock.set(2026, 1, 6, 9, 31);
        assert!(gate.maybe_roll_session(94_000.0));
        assert!(!gate.is_locked());
        let ledger = gate.ledger();
        assert_eq!(ledger.realised_since_start, 0.0);
        assert_eq!(ledger.session_start_balance, 94_000.0);
        assert!(gate.try_activate().is_ok());
    }

    #[test]
    fn persisted_realised_survives_restart() {
        let clock = FakeClock::at(2026, 1, 5, 10, 0);
        let gate = RiskGate::new(cfg(), clock, 100_000.0, Some(-3_000.0));
        assert_eq!(gate.ledger().realised_since_start, -3_000.0);

        // -3000 realised + -2000 unrealised = limit exactly.
        let cmds = gate.evaluate(100_000.0, None, -2_000.0, &[]);
        assert!(matches!(cmds.first(), Some(RiskCommand::CloseAll { .. })));
    }

    #[test]
    fn session_key_respects_anchor_time() {
        let before = Local.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap();
        let after = Local.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        assert_eq!(session_key(before, (9, 30)), "2026-01-04");
        assert_eq!(session_key(after, (9, 30)), "2026-01-05");

        assert_eq!(
            next_session_start(before, (9, 30)).to_string(),
            "2026-01-05 09:30:00"
        );
        assert_eq!(
            next_session_start(after, (9, 30)).to_string(),
            "2026-01-06 09:30:00"
        );
    }

    #[test]
    fn manual_unlock_clears_the_lock() {
        let clock = FakeClock::at(2026, 1, 5, 10, 0);
        let gate = gate(clock);
        gate.evaluate(100_000.0, None, -6_000.0, &[]);
        assert!(gate.is_locked());
        gate.unlock_manual();
        assert!(!gate.is_locked());
        assert!(gate.try_activate().is_ok());
    }
}
