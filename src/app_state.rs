// =============================================================================
// Central Engine State — Meridian pair engine
// =============================================================================
//
// The single source of truth tying the subsystems together. Each subsystem
// owns its internal state; EngineState holds the handles, the shared caches
// (latest quote, broker snapshot, account metrics), the alert ring, and the
// status snapshot served to the operator API.
//
// Thread safety:
//   - Atomic counters for lock-free version tracking and the
//     pending-decision latch.
//   - parking_lot locks for mutable shared values, held only around the
//     mutation — never across gateway I/O.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::warn;

use crate::broker::{AccountInfo, BrokerPosition, Clock, Tick};
use crate::grid::{GridLevel, GridState, UnifiedGrid};
use crate::hedge::HedgeRatioEstimator;
use crate::market::{MarketModel, MarketSnapshot};
use crate::monitor::PositionMonitor;
use crate::persist::{self, StateFile};
use crate::rebalance::VolumeRebalancer;
use crate::risk::{RiskGate, RiskLedger};
use crate::runtime_config::RuntimeConfig;
use crate::tracker::{ClosedSpread, Position, PositionTracker, SpreadState};

// =============================================================================
// Alerts
// =============================================================================

/// Maximum number of alerts retained for the operator to drain.
const MAX_ALERTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// One entry on the operator alert ring.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub level: AlertLevel,
    pub message: String,
    pub at: String,
}

// =============================================================================
// EngineState
// =============================================================================

pub struct EngineState {
    /// Monotonically increasing version, bumped on every meaningful
    /// mutation; the status API exposes it for cheap change detection.
    pub state_version: AtomicU64,

    pub config: RwLock<RuntimeConfig>,

    // ── Subsystems ──────────────────────────────────────────────────────
    pub model: Mutex<MarketModel>,
    pub grid: Mutex<UnifiedGrid>,
    pub estimator: Mutex<HedgeRatioEstimator>,
    pub rebalancer: Mutex<VolumeRebalancer>,
    pub tracker: Arc<PositionTracker>,
    pub risk: Arc<RiskGate>,
    pub monitor: Arc<PositionMonitor>,
    pub clock: Arc<dyn Clock>,

    // ── Shared caches ───────────────────────────────────────────────────
    /// Latest tick; shared with the paper gateway as its quote board.
    pub quotes: Arc<RwLock<Option<Tick>>>,
    pub last_snapshot: RwLock<Option<MarketSnapshot>>,
    pub broker_positions: RwLock<Vec<BrokerPosition>>,
    pub account: RwLock<Option<AccountInfo>>,

    /// Set while a grid decision is in flight on the execution channel;
    /// the signal loop will not emit another for the same grid.
    pub pending_decision: AtomicBool,

    // ── Operator surface ────────────────────────────────────────────────
    pub alerts: RwLock<Vec<AlertRecord>>,

    pub start_time: std::time::Instant,
}

impl EngineState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        model: MarketModel,
        grid: UnifiedGrid,
        estimator: HedgeRatioEstimator,
        rebalancer: VolumeRebalancer,
        tracker: Arc<PositionTracker>,
        risk: Arc<RiskGate>,
        monitor: Arc<PositionMonitor>,
        clock: Arc<dyn Clock>,
        quotes: Arc<RwLock<Option<Tick>>>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config: RwLock::new(config),
            model: Mutex::new(model),
            grid: Mutex::new(grid),
            estimator: Mutex::new(estimator),
            rebalancer: Mutex::new(rebalancer),
            tracker,
            risk,
            monitor,
            clock,
            quotes,
            last_snapshot: RwLock::new(None),
            broker_positions: RwLock::new(Vec::new()),
            account: RwLock::new(None),
            pending_decision: AtomicBool::new(false),
            alerts: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Alerts ──────────────────────────────────────────────────────────

    /// Append to the bounded alert ring; oldest entries are evicted.
    pub fn push_alert(&self, level: AlertLevel, message: impl Into<String>) {
        let record = AlertRecord {
            level,
            message: message.into(),
            at: Utc::now().to_rfc3339(),
        };
        let mut alerts = self.alerts.write();
        alerts.push(record);
        while alerts.len() > MAX_ALERTS {
            alerts.remove(0);
        }
        drop(alerts);
        self.increment_version();
    }

    /// Hand all pending alerts to the operator and clear the ring.
    pub fn drain_alerts(&self) -> Vec<AlertRecord> {
        std::mem::take(&mut *self.alerts.write())
    }

    // ── Pending-decision latch ──────────────────────────────────────────

    /// True when the latch was free and is now taken.
    pub fn try_claim_decision(&self) -> bool {
        self.pending_decision
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release_decision(&self) {
        self.pending_decision.store(false, Ordering::SeqCst);
    }

    pub fn decision_pending(&self) -> bool {
        self.pending_decision.load(Ordering::SeqCst)
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Snapshot the open spreads and risk ledger to the state file.
    /// Called after every grid mutation.
    pub fn persist_state(&self) {
        let (path, spreads, ledger) = {
            let config = self.config.read();
            (
                config.state_file.clone(),
                self.tracker.open_spreads(),
                self.risk.ledger(),
            )
        };
        let file = StateFile {
            spread_states: spreads.iter().map(Into::into).collect(),
            realised_since_session_start: ledger.realised_since_start,
            session_key: ledger.session_key,
        };
        if let Err(e) = persist::save(&path, &file) {
            warn!(error = %e, "failed to persist spread state");
            self.push_alert(AlertLevel::Warning, format!("state persist failed: {e}"));
        }
        self.increment_version();
    }

    // ── Status snapshot ─────────────────────────────────────────────────

    /// Full serialisable status for `GET /api/v1/status`.
    pub fn build_status(&self) -> StatusSnapshot {
        // Copy config values out before touching the grid mutex; the signal
        // loop acquires these locks in the opposite order.
        let (pair, entry_threshold, exit_threshold, stop_loss_zscore) = {
            let config = self.config.read();
            (
                format!("{}/{}", config.primary_symbol, config.secondary_symbol),
                config.entry_threshold,
                config.exit_threshold,
                config.stop_loss_zscore,
            )
        };
        let grid = self.grid.lock();
        let grid_view = GridView {
            state: match grid.state() {
                GridState::Inactive => "INACTIVE".to_string(),
                GridState::Active(side) => format!("ACTIVE({side})"),
            },
            anchor_z: grid.anchor_z(),
            last_executed_z: grid.last_executed_z(),
            next_trigger_z: grid.next_trigger_z(),
            executed_fraction: grid.executed_fraction(),
            levels: grid.levels().to_vec(),
        };
        drop(grid);

        let closed = self.tracker.closed_history(20);
        let journal_stats = if closed.is_empty() {
            None
        } else {
            let total_trades = closed.len();
            let wins = closed.iter().filter(|c| c.realized_pnl > 0.0).count();
            Some(JournalStats {
                total_trades,
                win_rate: wins as f64 / total_trades as f64,
                total_net_pnl: self.tracker.realised_total(),
            })
        };

        StatusSnapshot {
            state_version: self.current_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_s: self.start_time.elapsed().as_secs(),
            pair,
            entry_threshold,
            exit_threshold,
            stop_loss_zscore,
            market: *self.last_snapshot.read(),
            grid: grid_view,
            spreads: self.tracker.open_spreads(),
            positions: self.tracker.open_positions(),
            closed,
            journal_stats,
            risk: self.risk.ledger(),
            account: *self.account.read(),
            prompt_open: self.monitor.prompt_open(),
            alerts_pending: self.alerts.read().len(),
        }
    }
}

// =============================================================================
// Serialisable status types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct GridView {
    pub state: String,
    pub anchor_z: f64,
    pub last_executed_z: Option<f64>,
    pub next_trigger_z: Option<f64>,
    pub executed_fraction: f64,
    pub levels: Vec<GridLevel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_s: u64,
    pub pair: String,
    pub entry_threshold: f64,
    pub exit_threshold: f64,
    pub stop_loss_zscore: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market: Option<MarketSnapshot>,
    pub grid: GridView,
    pub spreads: Vec<SpreadState>,
    pub positions: Vec<Position>,
    pub closed: Vec<ClosedSpread>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_stats: Option<JournalStats>,
    pub risk: RiskLedger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
    pub prompt_open: bool,
    pub alerts_pending: usize,
}

/// Aggregate statistics over the closed-spread history.
#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_net_pnl: f64,
}
