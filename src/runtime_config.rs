// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian pair engine. Every tunable
// parameter lives here; all keys are optional in the JSON file and fall back
// to the defaults below.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// `validate()` failures are fatal at startup — the engine refuses to run on
// an inconsistent threshold set.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::EngineError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_primary_symbol() -> String {
    "XAUUSD".to_string()
}

fn default_secondary_symbol() -> String {
    "XAGUSD".to_string()
}

fn default_primary_contract_size() -> f64 {
    100.0
}

fn default_secondary_contract_size() -> f64 {
    5000.0
}

fn default_entry_threshold() -> f64 {
    2.0
}

fn default_exit_threshold() -> f64 {
    0.5
}

fn default_stop_loss_zscore() -> f64 {
    3.5
}

fn default_scale_interval() -> f64 {
    0.5
}

fn default_initial_fraction() -> f64 {
    0.33
}

fn default_rolling_window_size() -> usize {
    1000
}

fn default_warmup_bars() -> usize {
    10
}

fn default_bar_period_secs() -> u64 {
    3600
}

fn default_bootstrap_days() -> u32 {
    30
}

fn default_update_interval_s() -> u64 {
    3600
}

fn default_hedge_drift_min_lots() -> f64 {
    0.01
}

fn default_lot_step() -> f64 {
    0.01
}

fn default_min_lot() -> f64 {
    0.01
}

fn default_volume_multiplier() -> f64 {
    1.0
}

fn default_max_loss_per_setup_pct() -> f64 {
    2.0
}

fn default_daily_loss_limit_pct() -> f64 {
    5.0
}

fn default_margin_level_floor_pct() -> f64 {
    150.0
}

fn default_session_start_hhmm() -> String {
    "00:00".to_string()
}

fn default_session_end_hhmm() -> String {
    "23:59".to_string()
}

fn default_magic_number() -> u32 {
    234000
}

fn default_monitor_poll_interval_s() -> u64 {
    5
}

fn default_monitor_confirm_timeout_s() -> u64 {
    60
}

fn default_order_deadline_s() -> u64 {
    10
}

fn default_fast_close_workers() -> usize {
    100
}

fn default_execution_queue_depth() -> usize {
    8
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_state_file() -> String {
    "spread_state.json".to_string()
}

fn default_replay_file() -> String {
    "ticks.json".to_string()
}

fn default_starting_balance() -> f64 {
    100_000.0
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instrument pair -----------------------------------------------------

    #[serde(default = "default_primary_symbol")]
    pub primary_symbol: String,

    #[serde(default = "default_secondary_symbol")]
    pub secondary_symbol: String,

    /// Contract size fallback for the primary leg when the feed cannot supply
    /// symbol info (e.g. replay sessions).
    #[serde(default = "default_primary_contract_size")]
    pub primary_contract_size: f64,

    #[serde(default = "default_secondary_contract_size")]
    pub secondary_contract_size: f64,

    // --- Signal thresholds ---------------------------------------------------

    /// |z| required to arm the entry level.
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: f64,

    /// Mean-reversion exit: a LONG spread closes once z >= -exit_threshold.
    #[serde(default = "default_exit_threshold")]
    pub exit_threshold: f64,

    /// |z| that force-closes the whole spread.
    #[serde(default = "default_stop_loss_zscore")]
    pub stop_loss_zscore: f64,

    /// Z-distance between consecutive grid levels.
    #[serde(default = "default_scale_interval")]
    pub scale_interval: f64,

    /// Fraction of the planned position executed at the entry level.
    #[serde(default = "default_initial_fraction")]
    pub initial_fraction: f64,

    /// Minimum wall-clock gap between two grid executions. 0 relies on the
    /// natural protections (distinct snapshots, lot floors).
    #[serde(default)]
    pub min_inter_execution_ms: u64,

    // --- Rolling model -------------------------------------------------------

    #[serde(default = "default_rolling_window_size")]
    pub rolling_window_size: usize,

    /// Snapshots are suppressed until the window holds this many bars.
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,

    #[serde(default = "default_bar_period_secs")]
    pub bar_period_secs: u64,

    #[serde(default = "default_bootstrap_days")]
    pub bootstrap_days: u32,

    /// Hedge-ratio recomputation cadence in seconds.
    #[serde(default = "default_update_interval_s")]
    pub update_interval_s: u64,

    // --- Volume rebalancing --------------------------------------------------

    /// Minimum absolute hedge drift (in primary lots) before a corrective
    /// order is proposed.
    #[serde(default = "default_hedge_drift_min_lots")]
    pub hedge_drift_min_lots: f64,

    /// Optional cooldown between corrective orders. Kept configurable for
    /// operators that want throttling; defaults to 0 (off).
    #[serde(default)]
    pub min_adjustment_interval_s: u64,

    #[serde(default = "default_lot_step")]
    pub lot_step: f64,

    #[serde(default = "default_min_lot")]
    pub min_lot: f64,

    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,

    // --- Risk ----------------------------------------------------------------

    /// Max loss for a single open spread, percent of balance.
    #[serde(default = "default_max_loss_per_setup_pct")]
    pub max_loss_per_setup_pct: f64,

    /// Session loss limit, percent of balance. Breach locks trading until the
    /// next session start.
    #[serde(default = "default_daily_loss_limit_pct")]
    pub daily_loss_limit_pct: f64,

    /// Margin level (equity / margin, percent) below which everything closes.
    #[serde(default = "default_margin_level_floor_pct")]
    pub margin_level_floor_pct: f64,

    /// Session boundary, local wall-clock "HH:MM".
    #[serde(default = "default_session_start_hhmm")]
    pub session_start_hhmm: String,

    #[serde(default = "default_session_end_hhmm")]
    pub session_end_hhmm: String,

    // --- Feature flags -------------------------------------------------------

    /// Arm pyramid levels beyond the entry level.
    #[serde(default = "default_true")]
    pub enable_pyramiding: bool,

    /// Single-leg corrective orders when the hedge ratio drifts.
    #[serde(default = "default_true")]
    pub enable_volume_rebalancing: bool,

    /// Reconcile tracker legs against the broker snapshot and react to
    /// manual closures.
    #[serde(default = "default_true")]
    pub enable_manual_position_sync: bool,

    // --- Execution / infrastructure -----------------------------------------

    #[serde(default = "default_magic_number")]
    pub magic_number: u32,

    #[serde(default = "default_monitor_poll_interval_s")]
    pub monitor_poll_interval_s: u64,

    /// How long the manual-closure prompt waits for an operator answer
    /// before force-closing everything.
    #[serde(default = "default_monitor_confirm_timeout_s")]
    pub monitor_confirm_timeout_s: u64,

    /// Per-call deadline for gateway operations.
    #[serde(default = "default_order_deadline_s")]
    pub order_deadline_s: u64,

    /// Concurrency bound of the fast parallel close path.
    #[serde(default = "default_fast_close_workers")]
    pub fast_close_workers: usize,

    /// Bounded depth of the execution channel (blocking-send backpressure).
    #[serde(default = "default_execution_queue_depth")]
    pub execution_queue_depth: usize,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Tick source for paper sessions (JSON tick file).
    #[serde(default = "default_replay_file")]
    pub replay_file: String,

    /// Paper-gateway starting balance.
    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // Deserialising the empty object applies every serde default exactly
        // once, so the two default paths cannot drift apart.
        serde_json::from_str("{}").expect("empty config must deserialise")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pair = %format!("{}/{}", config.primary_symbol, config.secondary_symbol),
            entry = config.entry_threshold,
            exit = config.exit_threshold,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runtime config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Check threshold consistency. Any failure here aborts startup.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: &str| Err(EngineError::ConfigInvalid(msg.to_string()));

        if self.primary_symbol.is_empty() || self.secondary_symbol.is_empty() {
            return fail("primary_symbol and secondary_symbol must be set");
        }
        if self.primary_symbol == self.secondary_symbol {
            return fail("primary and secondary symbols must differ");
        }
        if self.entry_threshold <= 0.0 {
            return fail("entry_threshold must be positive");
        }
        if self.exit_threshold < 0.0 || self.exit_threshold >= self.entry_threshold {
            return fail("exit_threshold must be in [0, entry_threshold)");
        }
        if self.stop_loss_zscore <= self.entry_threshold {
            return fail("stop_loss_zscore must exceed entry_threshold");
        }
        if self.scale_interval <= 0.0 {
            return fail("scale_interval must be positive");
        }
        if !(self.initial_fraction > 0.0 && self.initial_fraction <= 1.0) {
            return fail("initial_fraction must be in (0, 1]");
        }
        if self.rolling_window_size < self.warmup_bars {
            return fail("rolling_window_size must be >= warmup_bars");
        }
        if self.warmup_bars < 2 {
            return fail("warmup_bars must be at least 2");
        }
        if self.lot_step <= 0.0 || self.min_lot <= 0.0 {
            return fail("lot_step and min_lot must be positive");
        }
        if self.hedge_drift_min_lots < 0.0 {
            return fail("hedge_drift_min_lots must be non-negative");
        }
        if self.max_loss_per_setup_pct <= 0.0 || self.daily_loss_limit_pct <= 0.0 {
            return fail("loss caps must be positive percentages");
        }
        if self.fast_close_workers == 0 || self.execution_queue_depth == 0 {
            return fail("fast_close_workers and execution_queue_depth must be positive");
        }
        parse_hhmm(&self.session_start_hhmm)
            .ok_or_else(|| EngineError::ConfigInvalid("session_start_hhmm must be HH:MM".into()))?;
        parse_hhmm(&self.session_end_hhmm)
            .ok_or_else(|| EngineError::ConfigInvalid("session_end_hhmm must be HH:MM".into()))?;

        Ok(())
    }

    /// Session start as (hour, minute). Only call after `validate()`.
    pub fn session_start(&self) -> (u32, u32) {
        parse_hhmm(&self.session_start_hhmm).unwrap_or((0, 0))
    }
}

/// Parse a "HH:MM" wall-clock string.
pub fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h < 24 && m < 60 {
        Some((h, m))
    } else {
        None
    }
}
