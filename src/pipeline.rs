// =============================================================================
// Pipeline — worker loop bodies and channel plumbing (C8)
// =============================================================================
//
// Five long-lived workers cooperate over two channels:
//
//   DataPump      feed ticks -> model -> SIGNAL CHANNEL (watch, capacity 1
//                 with overwrite — only the newest snapshot matters).
//   SignalLoop    snapshot -> risk caps -> grid check -> rebalance check ->
//                 EXECUTION CHANNEL (bounded mpsc; send().await blocks, so a
//                 stalled executor throttles the signal side instead of
//                 dropping decisions).
//   ExecutionLoop consumes items in arrival order, rejects stale grid
//                 decisions (generation guard), places orders, updates grid/
//                 tracker/monitor and persists.
//   RiskLoop      1 s cadence: account refresh, session rollover, cap sweep.
//   MonitorLoop   broker polling, tracker reconciliation, manual-closure
//                 protocol.
//
// Ordering within one snapshot is risk-cap -> exit -> level -> rebalance;
// exits discard everything else for that snapshot. While a grid decision is
// in flight the signal loop emits nothing else for the grid (the
// pending-decision latch), preventing double-fires.
//
// Shutdown: the stop signal breaks every producer loop; dropped senders
// close the execution channel and the executor drains with close_all.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::app_state::{AlertLevel, EngineState};
use crate::broker::{GatewayHandle, MarketFeed};
use crate::execution::ExecutionEngine;
use crate::grid::{GridState, LevelStatus};
use crate::market::MarketSnapshot;
use crate::monitor::{Confirmation, MonitorEvent};
use crate::rebalance::{HedgeExposure, VolumeAdjustment};
use crate::risk::RiskCommand;
use crate::types::{ExitReason, OrderSide, SpreadSide};

// ---------------------------------------------------------------------------
// Execution items
// ---------------------------------------------------------------------------

/// One leg to re-open after the operator chose REBALANCE.
#[derive(Debug, Clone)]
pub struct RestoredLeg {
    pub spread_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub lots: f64,
}

#[derive(Debug, Clone)]
pub enum EngineAction {
    /// Close every open spread.
    Exit { reason: ExitReason },
    /// Close a single spread (per-setup cap).
    CloseSpread {
        spread_id: String,
        reason: ExitReason,
    },
    /// Execute one grid level from the snapshot that armed it.
    GridLevel {
        index: usize,
        side: SpreadSide,
        snapshot: MarketSnapshot,
    },
    /// Single-leg hedge correction.
    Rebalance(VolumeAdjustment),
    /// Re-open externally closed legs.
    RestoreLegs { legs: Vec<RestoredLeg> },
}

/// Work unit on the execution channel. `grid_generation` is the grid's
/// mutation counter at decision time; the executor drops grid-level items
/// whose generation no longer matches (stale-decision guard).
#[derive(Debug, Clone)]
pub struct ExecutionItem {
    pub grid_generation: u64,
    pub action: EngineAction,
}

// ---------------------------------------------------------------------------
// Data pump
// ---------------------------------------------------------------------------

/// Pull ticks from the feed, fold them into the model, publish snapshots.
/// Also drives the slow hedge-ratio cadence (the model's only writer).
pub async fn run_data_pump(
    state: Arc<EngineState>,
    feed: Arc<dyn MarketFeed>,
    snapshot_tx: watch::Sender<Option<MarketSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticks = match feed.subscribe().await {
        Ok(rx) => rx,
        Err(e) => {
            error!(error = %e, "market feed subscription failed");
            state.push_alert(AlertLevel::Critical, format!("feed subscribe failed: {e}"));
            return;
        }
    };
    info!("data pump started");

    loop {
        let tick = tokio::select! {
            _ = shutdown.changed() => break,
            tick = ticks.recv() => match tick {
                Some(t) => t,
                None => {
                    info!("market feed stream ended");
                    break;
                }
            },
        };

        *state.quotes.write() = Some(tick);
        maybe_update_hedge(&state);

        let outcome = state.model.lock().on_tick(&tick);
        match outcome {
            Ok(Some(snapshot)) => {
                *state.last_snapshot.write() = Some(snapshot);
                {
                    let config = state.config.read();
                    state
                        .tracker
                        .update_symbol_price(&config.primary_symbol, tick.bid_primary);
                    state
                        .tracker
                        .update_symbol_price(&config.secondary_symbol, tick.bid_secondary);
                }
                let _ = snapshot_tx.send(Some(snapshot));
                state.increment_version();
            }
            Ok(None) => debug!("snapshot suppressed: degenerate window"),
            Err(e) => debug!(error = %e, "snapshot suppressed"),
        }
    }
    info!("data pump stopped");
}

/// Recompute the blended hedge ratio when the cadence elapses. Failures
/// leave beta unchanged (warning); the cadence still advances so a broken
/// series does not spin the estimator every tick.
fn maybe_update_hedge(state: &EngineState) {
    let now = state.clock.now_ms();
    if !state.estimator.lock().should_update(now) {
        return;
    }
    let contracts = {
        let config = state.config.read();
        (config.primary_contract_size, config.secondary_contract_size)
    };

    let mut model = state.model.lock();
    let primary = model.primary_closes();
    let secondary = model.secondary_closes();
    let vols = model.volatilities();

    let result = state
        .estimator
        .lock()
        .estimate(&primary, &secondary, vols, contracts);
    match result {
        Ok(blend) => {
            model.set_hedge_ratio(blend.ratio);
        }
        Err(e) => {
            warn!(error = %e, "hedge ratio left unchanged");
            state.push_alert(AlertLevel::Warning, format!("hedge estimate failed: {e}"));
        }
    }
    state.estimator.lock().mark_updated(now);
}

// ---------------------------------------------------------------------------
// Signal loop
// ---------------------------------------------------------------------------

pub async fn run_signal_loop(
    state: Arc<EngineState>,
    mut snapshot_rx: watch::Receiver<Option<MarketSnapshot>>,
    exec_tx: mpsc::Sender<ExecutionItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("signal loop started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let latest = *snapshot_rx.borrow_and_update();
        let Some(snapshot) = latest else {
            continue;
        };

        for item in decide_on_snapshot(&state, &snapshot) {
            // Blocking send: backpressure throttles this loop rather than
            // dropping decisions.
            if exec_tx.send(item).await.is_err() {
                info!("execution channel closed — signal loop exiting");
                return;
            }
        }
    }
    info!("signal loop stopped");
}

/// Evaluate one snapshot in the mandated order:
/// risk-cap -> exit -> level-trigger -> volume-rebalance.
pub fn decide_on_snapshot(state: &EngineState, snapshot: &MarketSnapshot) -> Vec<ExecutionItem> {
    // 1. Risk caps. Cap commands are not gated by the decision latch — a
    //    commanded close must never wait behind a pyramid order.
    let risk_items = risk_commands_to_items(state);
    if !risk_items.is_empty() {
        return risk_items;
    }

    if state.decision_pending() {
        // A grid decision is in flight; nothing new for this grid.
        return Vec::new();
    }

    // 2./3. Grid: exits win, then at most one level.
    let now = state.clock.now_ms();
    let grid_item = {
        let mut grid = state.grid.lock();
        maybe_activate(state, &mut grid, snapshot);

        let result = grid.check(snapshot, now);
        for level in &result.skipped {
            state.push_alert(
                AlertLevel::Info,
                format!(
                    "level {} skipped (z gapped past {:.2})",
                    level.name, level.target_z
                ),
            );
        }

        if let Some(reason) = result.exit {
            Some(ExecutionItem {
                grid_generation: grid.generation(),
                action: EngineAction::Exit { reason },
            })
        } else {
            result.triggered.map(|level| ExecutionItem {
                grid_generation: grid.generation(),
                action: EngineAction::GridLevel {
                    index: level.index,
                    side: grid.active_side().expect("active grid has a side"),
                    snapshot: *snapshot,
                },
            })
        }
    };

    if let Some(item) = grid_item {
        if state.try_claim_decision() {
            return vec![item];
        }
        return Vec::new();
    }

    // 4. Volume rebalance.
    check_rebalance(state, snapshot).into_iter().collect()
}

/// Map risk-gate commands onto execution items.
fn risk_commands_to_items(state: &EngineState) -> Vec<ExecutionItem> {
    let (balance, margin_level) = account_metrics(state);
    let per_spread: Vec<(String, f64)> = state
        .tracker
        .open_spread_ids()
        .into_iter()
        .map(|id| {
            let unrealised = state.tracker.spread_unrealised(&id);
            (id, unrealised)
        })
        .collect();
    let unrealised_total = state.tracker.unrealised_total();

    let commands = state
        .risk
        .evaluate(balance, margin_level, unrealised_total, &per_spread);
    let generation = state.grid.lock().generation();

    commands
        .into_iter()
        .map(|command| ExecutionItem {
            grid_generation: generation,
            action: match command {
                RiskCommand::CloseAll { reason } => EngineAction::Exit { reason },
                RiskCommand::CloseSpread { spread_id } => EngineAction::CloseSpread {
                    spread_id,
                    reason: ExitReason::SetupLossCap,
                },
            },
        })
        .collect()
}

fn account_metrics(state: &EngineState) -> (f64, Option<f64>) {
    match *state.account.read() {
        Some(account) => (
            account.balance,
            (account.margin > 0.0).then_some(account.margin_level),
        ),
        None => (state.config.read().starting_balance, None),
    }
}

/// Arm a new grid when flat and |z| has reached the entry threshold.
/// Rejected while trading is locked.
fn maybe_activate(state: &EngineState, grid: &mut crate::grid::UnifiedGrid, snap: &MarketSnapshot) {
    if grid.state() != GridState::Inactive {
        return;
    }
    let (entry, stop) = {
        let config = state.config.read();
        (config.entry_threshold, config.stop_loss_zscore)
    };
    // A deviation already past the stop level is not a tradable entry.
    if snap.zscore.abs() < entry || snap.zscore.abs() >= stop {
        return;
    }
    if let Err(reason) = state.risk.try_activate() {
        debug!(z = snap.zscore, reason = %reason, "entry suppressed");
        return;
    }
    let side = if snap.zscore <= -entry {
        SpreadSide::Long
    } else {
        SpreadSide::Short
    };
    let anchor = -side.direction() * entry;
    if grid.activate(side, anchor).is_ok() {
        state.push_alert(
            AlertLevel::Info,
            format!("grid armed {side} at z {:.2}", snap.zscore),
        );
    }
}

/// Propose a hedge correction from the broker snapshot.
fn check_rebalance(state: &EngineState, snapshot: &MarketSnapshot) -> Option<ExecutionItem> {
    let config = state.config.read();
    if !config.enable_volume_rebalancing {
        return None;
    }
    let primary_symbol = config.primary_symbol.clone();
    let secondary_symbol = config.secondary_symbol.clone();
    drop(config);

    let (spread_id, generation) = {
        let grid = state.grid.lock();
        (grid.spread_id()?.to_string(), grid.generation())
    };
    let spread = state.tracker.get_spread(&spread_id)?;

    // Authoritative lots from the broker, not the tracker.
    let exposure = {
        let broker = state.broker_positions.read();
        let net = |symbol: &str| -> f64 {
            broker
                .iter()
                .filter(|p| p.symbol == symbol)
                .map(|p| p.side.direction() * p.lots)
                .sum()
        };
        HedgeExposure {
            primary_lots: net(&primary_symbol),
            secondary_lots: net(&secondary_symbol),
        }
    };
    if exposure.primary_lots == 0.0 && exposure.secondary_lots == 0.0 {
        // No broker snapshot yet.
        return None;
    }

    let adjustment = state.rebalancer.lock().check(
        &spread_id,
        exposure,
        spread.entry_hedge_ratio,
        snapshot.hedge_ratio,
        snapshot.zscore,
        state.clock.now_ms(),
    )?;

    Some(ExecutionItem {
        grid_generation: generation,
        action: EngineAction::Rebalance(adjustment),
    })
}

// ---------------------------------------------------------------------------
// Execution loop
// ---------------------------------------------------------------------------

pub async fn run_execution_loop(
    state: Arc<EngineState>,
    mut exec_rx: mpsc::Receiver<ExecutionItem>,
    engine: Arc<ExecutionEngine>,
) {
    info!("execution loop started");
    while let Some(item) = exec_rx.recv().await {
        handle_item(&state, &engine, item).await;
        state.release_decision();
    }

    // Channel closed: drain open positions before exiting.
    if !state.tracker.tickets().is_empty() {
        warn!("shutdown with open positions — closing all");
        close_all(&state, &engine, ExitReason::Shutdown).await;
    }
    info!("execution loop stopped");
}

pub async fn handle_item(state: &EngineState, engine: &ExecutionEngine, item: ExecutionItem) {
    match item.action {
        EngineAction::Exit { reason } => close_all(state, engine, reason).await,
        EngineAction::CloseSpread { spread_id, reason } => {
            close_spread(state, engine, &spread_id, reason).await
        }
        EngineAction::GridLevel {
            index,
            side,
            snapshot,
        } => execute_grid_level(state, engine, item.grid_generation, index, side, &snapshot).await,
        EngineAction::Rebalance(adjustment) => execute_rebalance(state, engine, &adjustment).await,
        EngineAction::RestoreLegs { legs } => restore_legs(state, engine, legs).await,
    }
}

async fn execute_grid_level(
    state: &EngineState,
    engine: &ExecutionEngine,
    decision_generation: u64,
    index: usize,
    side: SpreadSide,
    snapshot: &MarketSnapshot,
) {
    // Stale-decision guard: the grid moved on since this was decided.
    let level = {
        let grid = state.grid.lock();
        if grid.generation() != decision_generation {
            warn!(
                decision_generation,
                current = grid.generation(),
                "dropping stale grid decision"
            );
            return;
        }
        match grid.levels().get(index) {
            Some(level)
                if matches!(level.status, LevelStatus::Waiting | LevelStatus::Blocked) =>
            {
                level.clone()
            }
            _ => return,
        }
    };
    if state.risk.is_locked() {
        warn!("grid level dropped — trading locked");
        return;
    }

    let (balance, _) = account_metrics(state);
    let fill = match engine.execute_level(&level, side, snapshot, balance).await {
        Ok(fill) => fill,
        Err(e) => {
            // First-leg rejection aborts the action; the level stays WAITING
            // and re-arms on a later snapshot.
            warn!(error = %e, level = %level.name, "level execution aborted");
            state.push_alert(AlertLevel::Warning, format!("level {} aborted: {e}", level.name));
            return;
        }
    };

    let (scale_interval, primary_symbol, secondary_symbol) = {
        let config = state.config.read();
        (
            config.scale_interval,
            config.primary_symbol.clone(),
            config.secondary_symbol.clone(),
        )
    };

    let mut tickets = vec![fill.primary.ticket];
    if let Some(secondary) = &fill.secondary {
        tickets.push(secondary.ticket);
    }

    {
        let mut grid = state.grid.lock();
        let tracker_result = if grid.spread_id().is_none() {
            state
                .tracker
                .open_spread(
                    side,
                    snapshot.zscore,
                    snapshot.spread_mean,
                    snapshot.hedge_ratio,
                    scale_interval,
                    &primary_symbol,
                    &secondary_symbol,
                    &fill.primary,
                    fill.secondary.as_ref(),
                )
                .map(|spread_id| grid.set_spread_id(spread_id))
        } else {
            let spread_id = grid.spread_id().expect("checked above").to_string();
            state.tracker.add_fill(
                &spread_id,
                snapshot.zscore,
                scale_interval,
                &primary_symbol,
                &secondary_symbol,
                &fill.primary,
                fill.secondary.as_ref(),
            )
        };
        if let Err(e) = tracker_result {
            error!(error = %e, "tracker rejected fill");
            state.push_alert(AlertLevel::Critical, format!("tracker rejected fill: {e}"));
        }

        grid.mark_executed(
            index,
            snapshot.zscore,
            snapshot.seq,
            state.clock.now_ms(),
            fill.primary.filled_lots,
            fill.secondary.as_ref().map(|s| s.filled_lots).unwrap_or(0.0),
            tickets.clone(),
        );
    }

    state.monitor.register(fill.primary.ticket, &primary_symbol);
    if let Some(secondary) = &fill.secondary {
        state.monitor.register(secondary.ticket, &secondary_symbol);
    }

    if !fill.hedge_complete() {
        state.push_alert(
            AlertLevel::Critical,
            format!(
                "HEDGE INCOMPLETE: primary #{} filled, secondary leg missing",
                fill.primary.ticket
            ),
        );
    }
    state.persist_state();
}

async fn execute_rebalance(
    state: &EngineState,
    engine: &ExecutionEngine,
    adjustment: &VolumeAdjustment,
) {
    if state.tracker.get_spread(&adjustment.spread_id).is_none() {
        return;
    }
    match engine.execute_adjustment(adjustment).await {
        Ok(fill) => {
            if let Err(e) = state.tracker.apply_adjustment(
                &adjustment.spread_id,
                &adjustment.symbol,
                adjustment.side,
                &fill,
                adjustment.primary_leg,
                adjustment.beta_after,
            ) {
                warn!(error = %e, "adjustment fill not applied");
                return;
            }
            state.monitor.register(fill.ticket, &adjustment.symbol);
            state.rebalancer.lock().mark_adjusted(state.clock.now_ms());

            // Post-trade hedge-quality check (target ratio error < 5%).
            if let Some(spread) = state.tracker.get_spread(&adjustment.spread_id) {
                let exposure = HedgeExposure {
                    primary_lots: spread.primary_lots,
                    secondary_lots: spread.secondary_lots,
                };
                if !state
                    .rebalancer
                    .lock()
                    .hedge_quality_ok(exposure, adjustment.beta_after)
                {
                    state.push_alert(
                        AlertLevel::Warning,
                        format!(
                            "hedge still off target for {} after correction",
                            adjustment.spread_id
                        ),
                    );
                }
            }
            state.persist_state();
        }
        Err(e) => {
            // Logged and retried naturally on the next tick's check.
            warn!(error = %e, spread_id = %adjustment.spread_id, "volume rebalance failed");
            state.push_alert(AlertLevel::Warning, format!("rebalance failed: {e}"));
        }
    }
}

async fn restore_legs(state: &EngineState, engine: &ExecutionEngine, legs: Vec<RestoredLeg>) {
    for leg in legs {
        match engine.place_leg(&leg.symbol, leg.side, leg.lots).await {
            Ok(fill) => {
                if let Err(e) =
                    state
                        .tracker
                        .attach_leg(&leg.spread_id, &leg.symbol, leg.side, &fill)
                {
                    warn!(error = %e, "restored leg not attached");
                    continue;
                }
                state.monitor.register(fill.ticket, &leg.symbol);
                state.push_alert(
                    AlertLevel::Info,
                    format!("hedge restored: {} {} {:.2}", leg.side, leg.symbol, leg.lots),
                );
            }
            Err(e) => {
                state.push_alert(
                    AlertLevel::Critical,
                    format!("hedge restore failed for {}: {e}", leg.symbol),
                );
            }
        }
    }
    state.persist_state();
}

/// Exit prices for tracker realisation, from the freshest quote we hold.
fn exit_prices(state: &EngineState) -> (f64, f64) {
    if let Some(tick) = *state.quotes.read() {
        return (tick.bid_primary, tick.bid_secondary);
    }
    if let Some(snap) = *state.last_snapshot.read() {
        return (snap.primary_bid, snap.secondary_bid);
    }
    (0.0, 0.0)
}

pub async fn close_all(state: &EngineState, engine: &ExecutionEngine, reason: ExitReason) {
    let tickets = state.tracker.tickets();
    let closed = engine.close_tickets(tickets).await;

    let (primary_px, secondary_px) = exit_prices(state);
    let mut total = 0.0;
    for spread_id in state.tracker.open_spread_ids() {
        if let Some(pnl) =
            state
                .tracker
                .close_spread(&spread_id, primary_px, secondary_px, &reason.to_string())
        {
            state.risk.record_realised(pnl);
            total += pnl;
        }
    }

    state.monitor.clear();
    state.grid.lock().deactivate(reason);
    state.persist_state();

    info!(closed, realised = total, reason = %reason, "close-all complete");
    state.push_alert(
        AlertLevel::Warning,
        format!("closed all positions ({reason}), realised {total:.2}"),
    );
}

async fn close_spread(
    state: &EngineState,
    engine: &ExecutionEngine,
    spread_id: &str,
    reason: ExitReason,
) {
    let tickets = state.tracker.tickets_for_spread(spread_id);
    if tickets.is_empty() && state.tracker.get_spread(spread_id).is_none() {
        return;
    }
    engine.close_tickets(tickets.clone()).await;

    let (primary_px, secondary_px) = exit_prices(state);
    if let Some(pnl) = state
        .tracker
        .close_spread(spread_id, primary_px, secondary_px, &reason.to_string())
    {
        state.risk.record_realised(pnl);
        info!(spread_id, realised = pnl, reason = %reason, "spread closed");
    }
    for ticket in tickets {
        state.monitor.unregister(ticket);
    }

    let mut grid = state.grid.lock();
    if grid.spread_id() == Some(spread_id) {
        grid.deactivate(reason);
    }
    drop(grid);
    state.persist_state();
}

// ---------------------------------------------------------------------------
// Risk loop
// ---------------------------------------------------------------------------

pub async fn run_risk_loop(
    state: Arc<EngineState>,
    gateway: GatewayHandle,
    exec_tx: mpsc::Sender<ExecutionItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("risk loop started");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        match gateway.account_info().await {
            Ok(account) => {
                *state.account.write() = Some(account);
            }
            Err(e) => debug!(error = %e, "account refresh failed"),
        }

        let (balance, _) = account_metrics(&state);
        if state.risk.maybe_roll_session(balance) {
            state.push_alert(AlertLevel::Info, "session rolled over — risk ledger reset");
            state.persist_state();
        }

        for item in risk_commands_to_items(&state) {
            if exec_tx.send(item).await.is_err() {
                return;
            }
        }
    }
    info!("risk loop stopped");
}

// ---------------------------------------------------------------------------
// Monitor loop
// ---------------------------------------------------------------------------

pub async fn run_monitor_loop(
    state: Arc<EngineState>,
    gateway: GatewayHandle,
    exec_tx: mpsc::Sender<ExecutionItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (poll_s, sync_enabled) = {
        let config = state.config.read();
        (
            config.monitor_poll_interval_s,
            config.enable_manual_position_sync,
        )
    };
    info!(poll_s, sync_enabled, "monitor loop started");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(poll_s.max(1)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        let positions = match gateway.positions().await {
            Ok(positions) => positions,
            Err(e) => {
                debug!(error = %e, "broker position poll failed");
                continue;
            }
        };

        // Reconcile tracker prices against the broker snapshot.
        for broker_pos in &positions {
            state
                .tracker
                .update_price(broker_pos.ticket, broker_pos.current_price);
        }

        // Rebuild legs for spreads restored from the state file.
        if sync_enabled {
            let registered = state.monitor.monitored_tickets();
            for broker_pos in &positions {
                if registered.contains(&broker_pos.ticket)
                    && state.tracker.position(broker_pos.ticket).is_none()
                {
                    if let Some(spread_id) = spread_for_ticket(&state, broker_pos.ticket) {
                        state.tracker.sync_leg_from_broker(broker_pos, &spread_id);
                    }
                }
            }
        }

        *state.broker_positions.write() = positions.clone();

        if !sync_enabled {
            continue;
        }

        let live: HashSet<u64> = positions.iter().map(|p| p.ticket).collect();
        let Some(event) = state.monitor.check(&live, state.clock.now_ms()) else {
            continue;
        };

        match event {
            MonitorEvent::AllClosed => {
                state.grid.lock().deactivate(ExitReason::ManualClosure);
                state.tracker.clear_all();
                state.persist_state();
                state.push_alert(
                    AlertLevel::Info,
                    "all monitored positions closed externally — system reset",
                );
            }
            MonitorEvent::PromptOpened { missing } => {
                state.push_alert(
                    AlertLevel::Warning,
                    format!(
                        "manual closure detected ({missing:?}) — confirm REBALANCE or CLOSE_ALL"
                    ),
                );
            }
            MonitorEvent::PromptResolved {
                missing,
                confirmation: Confirmation::Rebalance,
                ..
            } => {
                let mut legs = Vec::new();
                for ticket in missing {
                    if let Some(position) = state.tracker.remove_ticket(ticket) {
                        state.monitor.unregister(ticket);
                        legs.push(RestoredLeg {
                            spread_id: position.spread_id,
                            symbol: position.symbol,
                            side: position.side,
                            lots: position.lots,
                        });
                    }
                }
                if !legs.is_empty() {
                    let generation = state.grid.lock().generation();
                    let item = ExecutionItem {
                        grid_generation: generation,
                        action: EngineAction::RestoreLegs { legs },
                    };
                    if exec_tx.send(item).await.is_err() {
                        return;
                    }
                }
            }
            MonitorEvent::PromptResolved { timed_out, .. } => {
                let note = if timed_out {
                    "confirmation timed out"
                } else {
                    "operator chose CLOSE_ALL"
                };
                state.push_alert(AlertLevel::Warning, format!("{note} — closing all"));
                let generation = state.grid.lock().generation();
                let item = ExecutionItem {
                    grid_generation: generation,
                    action: EngineAction::Exit {
                        reason: ExitReason::ManualClosure,
                    },
                };
                if exec_tx.send(item).await.is_err() {
                    return;
                }
            }
        }
    }
    info!("monitor loop stopped");
}

/// Find the open spread a ticket belongs to by its id encoding.
fn spread_for_ticket(state: &EngineState, ticket: u64) -> Option<String> {
    state.tracker.open_spread_ids().into_iter().find(|id| {
        crate::tracker::tickets_from_spread_id(id)
            .map(|(p, s)| p == ticket || s == ticket)
            .unwrap_or(false)
    })
}
