// =============================================================================
// Meridian Pair Engine — Main Entry Point
// =============================================================================
//
// Startup wiring: config -> collaborators (feed, gateway, clock) -> rolling
// model bootstrap -> persisted-state resume -> worker spawn. The engine runs
// five cooperating workers (data pump, signal loop, execution loop, risk
// loop, monitor loop) plus the operator REST API, and shuts down by closing
// the channels so the executor can drain open positions.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod errors;
mod execution;
mod grid;
mod hedge;
mod market;
mod monitor;
mod persist;
mod pipeline;
mod rebalance;
mod risk;
mod runtime_config;
mod tracker;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AlertLevel, EngineState};
use crate::broker::paper::PaperGateway;
use crate::broker::replay::ReplayFeed;
use crate::broker::{Clock, GatewayHandle, MarketFeed, SymbolInfo, SystemClock, Tick};
use crate::execution::{ExecutionConfig, ExecutionEngine};
use crate::grid::{GridConfig, UnifiedGrid};
use crate::hedge::HedgeRatioEstimator;
use crate::market::MarketModel;
use crate::monitor::PositionMonitor;
use crate::rebalance::{RebalanceConfig, VolumeRebalancer};
use crate::risk::{RiskConfig, RiskGate};
use crate::runtime_config::RuntimeConfig;
use crate::tracker::{tickets_from_spread_id, PositionTracker, SpreadState};

/// Pause between replayed ticks in paper sessions.
const REPLAY_PLAYBACK_INTERVAL_MS: u64 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Pair Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    // Invalid configuration is fatal: refuse to trade on bad thresholds.
    config.validate().context("configuration rejected")?;

    info!(
        pair = %format!("{}/{}", config.primary_symbol, config.secondary_symbol),
        entry = config.entry_threshold,
        exit = config.exit_threshold,
        stop = config.stop_loss_zscore,
        window = config.rolling_window_size,
        "configuration ready"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let quotes: Arc<RwLock<Option<Tick>>> = Arc::new(RwLock::new(None));

    // ── 2. Collaborators: feed + gateway ─────────────────────────────────
    let now_ms = clock.now_ms() as i64;
    let fallback_infos = fallback_symbol_infos(&config);
    let feed: Arc<dyn MarketFeed> = Arc::new(
        ReplayFeed::load(
            &config.replay_file,
            &config.primary_symbol,
            &config.secondary_symbol,
            fallback_infos,
            REPLAY_PLAYBACK_INTERVAL_MS,
            now_ms,
        )
        .context("no market source — supply a tick file or wire a live bridge")?,
    );

    let primary_info = feed.symbol_info(&config.primary_symbol).await?;
    let secondary_info = feed.symbol_info(&config.secondary_symbol).await?;

    let gateway = Arc::new(PaperGateway::new(
        quotes.clone(),
        &config.primary_symbol,
        &config.secondary_symbol,
        config.starting_balance,
    ));
    let gateway_handle = GatewayHandle::new(gateway, Duration::from_secs(config.order_deadline_s));

    // ── 3. Model bootstrap ───────────────────────────────────────────────
    let estimator = HedgeRatioEstimator::new(config.update_interval_s);
    let mut model = MarketModel::new(
        &config.primary_symbol,
        &config.secondary_symbol,
        config.rolling_window_size,
        config.warmup_bars,
        config.bar_period_secs,
    );

    let from_ms = now_ms - (config.bootstrap_days as i64) * 24 * 3_600_000;
    let primary_history = feed
        .history(&config.primary_symbol, config.bar_period_secs, from_ms, now_ms)
        .await
        .unwrap_or_default();
    let secondary_history = feed
        .history(
            &config.secondary_symbol,
            config.bar_period_secs,
            from_ms,
            now_ms,
        )
        .await
        .unwrap_or_default();

    let primary_closes: Vec<f64> = primary_history.iter().map(|b| b.close).collect();
    let secondary_closes: Vec<f64> = secondary_history.iter().map(|b| b.close).collect();
    let initial_beta = estimator
        .estimate(
            &primary_closes,
            &secondary_closes,
            (0.0, 0.0),
            (config.primary_contract_size, config.secondary_contract_size),
        )
        .context("cannot derive an initial hedge ratio from history")?
        .ratio;

    model
        .bootstrap(&primary_history, &secondary_history, initial_beta)
        .context("rolling window bootstrap failed")?;

    // ── 4. Subsystems ────────────────────────────────────────────────────
    let grid = UnifiedGrid::new(GridConfig {
        entry_threshold: config.entry_threshold,
        exit_threshold: config.exit_threshold,
        stop_loss_z: config.stop_loss_zscore,
        scale_interval: config.scale_interval,
        initial_fraction: config.initial_fraction,
        min_inter_execution_ms: config.min_inter_execution_ms,
        enable_pyramiding: config.enable_pyramiding,
    });
    let rebalancer = VolumeRebalancer::new(
        RebalanceConfig {
            enabled: config.enable_volume_rebalancing,
            min_absolute_drift: config.hedge_drift_min_lots,
            lot_step: config.lot_step,
            min_lot: config.min_lot,
            min_adjustment_interval_ms: config.min_adjustment_interval_s * 1000,
        },
        &config.primary_symbol,
        &config.secondary_symbol,
    );
    let tracker = Arc::new(PositionTracker::new());
    let monitor = Arc::new(PositionMonitor::new(config.monitor_confirm_timeout_s));

    // ── 5. Persisted state & risk gate ──────────────────────────────────
    let persisted = persist::load(&config.state_file).unwrap_or_else(|e| {
        warn!(error = %e, "state file unreadable — starting clean");
        None
    });
    let current_session = risk::session_key(clock.local_time(), config.session_start());
    let (persisted_realised, resume_spreads) = match &persisted {
        Some(file) if file.session_key == current_session => (
            Some(file.realised_since_session_start),
            file.spread_states.clone(),
        ),
        Some(file) => {
            info!(
                persisted_session = %file.session_key,
                current_session = %current_session,
                "state file from another session — realised P&L starts at zero"
            );
            (None, file.spread_states.clone())
        }
        None => (None, Vec::new()),
    };

    let risk_gate = Arc::new(RiskGate::new(
        RiskConfig {
            max_loss_per_setup_pct: config.max_loss_per_setup_pct,
            daily_loss_limit_pct: config.daily_loss_limit_pct,
            margin_level_floor_pct: config.margin_level_floor_pct,
            session_start: config.session_start(),
        },
        clock.clone(),
        config.starting_balance,
        persisted_realised,
    ));

    let state = Arc::new(EngineState::new(
        config.clone(),
        model,
        grid,
        estimator,
        rebalancer,
        tracker,
        risk_gate,
        monitor,
        clock.clone(),
        quotes.clone(),
    ));

    if persisted.is_some() && persisted_realised.is_none() {
        state.push_alert(
            AlertLevel::Warning,
            "state file predates this session — realised P&L re-initialised to zero",
        );
    }
    resume_persisted_spreads(&state, resume_spreads, &config);

    // ── 6. Execution engine ──────────────────────────────────────────────
    let exec_engine = Arc::new(ExecutionEngine::new(
        gateway_handle.clone(),
        clock.clone(),
        ExecutionConfig {
            primary_symbol: config.primary_symbol.clone(),
            secondary_symbol: config.secondary_symbol.clone(),
            primary_info,
            secondary_info,
            volume_multiplier: config.volume_multiplier,
            fast_close_workers: config.fast_close_workers,
        },
    ));

    // ── 7. Channels ──────────────────────────────────────────────────────
    // Signal channel: capacity 1 with overwrite — only the newest snapshot
    // matters. Execution channel: bounded, blocking send for backpressure.
    let (snapshot_tx, snapshot_rx) = watch::channel(None);
    let (exec_tx, exec_rx) = mpsc::channel(config.execution_queue_depth);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 8. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    // ── 9. Workers ───────────────────────────────────────────────────────
    tokio::spawn(pipeline::run_data_pump(
        state.clone(),
        feed,
        snapshot_tx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(pipeline::run_signal_loop(
        state.clone(),
        snapshot_rx,
        exec_tx.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(pipeline::run_risk_loop(
        state.clone(),
        gateway_handle.clone(),
        exec_tx.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(pipeline::run_monitor_loop(
        state.clone(),
        gateway_handle,
        exec_tx.clone(),
        shutdown_rx,
    ));
    // The executor is awaited at shutdown so it can drain open positions.
    let execution_task = tokio::spawn(pipeline::run_execution_loop(
        state.clone(),
        exec_rx,
        exec_engine,
    ));
    drop(exec_tx);

    info!("all subsystems running — Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let _ = shutdown_tx.send(true);
    // Producer loops exit, their senders drop, the execution channel closes
    // and the executor drains with close_all.
    if let Err(e) = execution_task.await {
        error!(error = %e, "execution loop join failed");
    }
    state.persist_state();

    info!("Meridian Pair Engine shut down complete.");
    Ok(())
}

/// Static symbol info for replay sessions, from the configured contract
/// sizes and lot granularity.
fn fallback_symbol_infos(config: &RuntimeConfig) -> HashMap<String, SymbolInfo> {
    let mut infos = HashMap::new();
    infos.insert(
        config.primary_symbol.clone(),
        SymbolInfo {
            contract_size: config.primary_contract_size,
            min_lot: config.min_lot,
            lot_step: config.lot_step,
            tick_size: 0.01,
        },
    );
    infos.insert(
        config.secondary_symbol.clone(),
        SymbolInfo {
            contract_size: config.secondary_contract_size,
            min_lot: config.min_lot,
            lot_step: config.lot_step,
            tick_size: 0.001,
        },
    );
    infos
}

/// Resume the persisted spreads: tracker record, grid reactivation for the
/// active spread, monitor registration for its tickets. Leg positions are
/// rebuilt from the broker snapshot by the monitor loop.
fn resume_persisted_spreads(
    state: &EngineState,
    spreads: Vec<persist::PersistedSpread>,
    config: &RuntimeConfig,
) {
    for (index, persisted) in spreads.into_iter().enumerate() {
        if index == 0 {
            let resumed = state.grid.lock().resume(
                persisted.side,
                persisted.spread_id.clone(),
                persisted.entry_z,
                persisted.last_z_entry,
                persisted.next_z_entry,
                persisted.primary_lots,
                persisted.secondary_lots,
            );
            if let Err(e) = resumed {
                warn!(spread_id = %persisted.spread_id, error = e, "grid resume failed");
                continue;
            }
        } else {
            // The engine runs one grid at a time; extra persisted spreads are
            // tracked for closing but not re-armed.
            warn!(spread_id = %persisted.spread_id, "extra persisted spread tracked without a grid");
        }

        if let Some((primary_ticket, secondary_ticket)) =
            tickets_from_spread_id(&persisted.spread_id)
        {
            state
                .monitor
                .register(primary_ticket, &config.primary_symbol);
            if secondary_ticket != 0 {
                state
                    .monitor
                    .register(secondary_ticket, &config.secondary_symbol);
            }
        }

        state.tracker.restore_spread(SpreadState {
            spread_id: persisted.spread_id,
            side: persisted.side,
            entry_z: persisted.entry_z,
            last_z_entry: persisted.last_z_entry,
            next_z_entry: persisted.next_z_entry,
            first_entry_spread_mean: persisted.first_entry_spread_mean,
            primary_symbol: config.primary_symbol.clone(),
            secondary_symbol: config.secondary_symbol.clone(),
            primary_lots: persisted.primary_lots,
            secondary_lots: persisted.secondary_lots,
            entry_hedge_ratio: persisted.entry_hedge_ratio,
            entry_time: persisted.entry_time,
            hedge_complete: persisted.secondary_lots != 0.0,
        });

        state.push_alert(
            AlertLevel::Info,
            "resumed persisted spread from state file",
        );
    }
}
