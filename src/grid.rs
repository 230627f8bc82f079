// =============================================================================
// Unified z-score grid — entry, pyramiding and exit state machine (C3)
// =============================================================================
//
// The grid is either Inactive (flat, waiting for an entry) or Active(side)
// with an armed ladder of levels. Level 0 is the entry at the anchor z;
// deeper levels march by `scale_interval` toward the stop-loss and add to the
// spread (pyramiding).
//
// Rules enforced here:
//   - level 0 arms only once |z| >= entry_threshold; deeper levels carry their
//     own targets and never re-check the entry threshold.
//   - at most ONE level executes per snapshot (lowest armed index); deeper
//     crossed levels stay WAITING for the next snapshot.
//   - a pyramid level whose target z has overshot by at least half the level
//     spacing is permanently passed over (SKIPPED) — a gap carried the market
//     into the next level's territory. The entry level is exempt.
//   - a second execution needs a distinct snapshot, plus the optional
//     wall-clock cooldown.
//   - exit checks run first and win over everything else in the snapshot.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info};

use crate::market::MarketSnapshot;
use crate::types::{ExitReason, SpreadSide};

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelStatus {
    Waiting,
    Executed,
    Skipped,
    Blocked,
}

/// One point on the z-score ladder.
#[derive(Debug, Clone, Serialize)]
pub struct GridLevel {
    pub index: usize,
    pub name: String,
    pub target_z: f64,
    pub fraction: f64,
    pub status: LevelStatus,
    /// Z at which the level actually executed.
    pub executed_z: Option<f64>,
    pub primary_lots: f64,
    pub secondary_lots: f64,
    pub tickets: Vec<u64>,
}

/// Outcome of one `check` pass.
#[derive(Debug, Clone, Default)]
pub struct GridCheckResult {
    /// Lowest-index armed level, ready for execution.
    pub triggered: Option<GridLevel>,
    /// Levels passed over by a z gap this snapshot.
    pub skipped: Vec<GridLevel>,
    /// Close-everything signal; wins over both fields above.
    pub exit: Option<ExitReason>,
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct GridConfig {
    pub entry_threshold: f64,
    pub exit_threshold: f64,
    pub stop_loss_z: f64,
    pub scale_interval: f64,
    pub initial_fraction: f64,
    pub min_inter_execution_ms: u64,
    pub enable_pyramiding: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GridState {
    Inactive,
    Active(SpreadSide),
}

pub struct UnifiedGrid {
    cfg: GridConfig,
    state: GridState,
    levels: Vec<GridLevel>,
    anchor_z: f64,

    spread_id: Option<String>,
    last_executed_z: Option<f64>,
    next_trigger_z: Option<f64>,
    last_execution_ms: Option<u64>,
    last_executed_seq: Option<u64>,

    /// Bumped on every structural mutation; stale execution items compare
    /// against this.
    generation: u64,
}

impl UnifiedGrid {
    pub fn new(cfg: GridConfig) -> Self {
        Self {
            cfg,
            state: GridState::Inactive,
            levels: Vec::new(),
            anchor_z: 0.0,
            spread_id: None,
            last_executed_z: None,
            next_trigger_z: None,
            last_execution_ms: None,
            last_executed_seq: None,
            generation: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Activation / deactivation
    // -------------------------------------------------------------------------

    /// Arm the ladder. `anchor_z` is the level-0 target (the signed entry
    /// threshold). Fails while a grid is already active — a reverse entry is
    /// blocked until the current grid deactivates.
    pub fn activate(&mut self, side: SpreadSide, anchor_z: f64) -> Result<(), &'static str> {
        if self.state != GridState::Inactive {
            return Err("grid already active");
        }

        self.levels = self.generate_levels(side, anchor_z);
        self.state = GridState::Active(side);
        self.anchor_z = anchor_z;
        self.spread_id = None;
        self.last_executed_z = None;
        self.next_trigger_z = None;
        self.last_execution_ms = None;
        self.last_executed_seq = None;
        self.generation += 1;

        info!(
            side = %side,
            anchor_z,
            levels = self.levels.len(),
            "grid activated"
        );
        Ok(())
    }

    fn generate_levels(&self, side: SpreadSide, anchor_z: f64) -> Vec<GridLevel> {
        // Ladder direction: LONG marches down (z more negative), SHORT up.
        let step = match side {
            SpreadSide::Long => -self.cfg.scale_interval,
            SpreadSide::Short => self.cfg.scale_interval,
        };

        let mut targets = vec![anchor_z];
        if self.cfg.enable_pyramiding {
            let mut k = 1;
            loop {
                let target = anchor_z + step * k as f64;
                if target.abs() >= self.cfg.stop_loss_z {
                    break;
                }
                targets.push(target);
                k += 1;
            }
        }

        let n = targets.len();
        let pyramid_fraction = if n > 1 {
            (1.0 - self.cfg.initial_fraction) / (n - 1) as f64
        } else {
            0.0
        };

        targets
            .into_iter()
            .enumerate()
            .map(|(index, target_z)| GridLevel {
                index,
                name: format!("L{index}"),
                target_z,
                fraction: if index == 0 {
                    self.cfg.initial_fraction
                } else {
                    pyramid_fraction
                },
                status: LevelStatus::Waiting,
                executed_z: None,
                primary_lots: 0.0,
                secondary_lots: 0.0,
                tickets: Vec::new(),
            })
            .collect()
    }

    /// Return to Inactive and release the spread id.
    pub fn deactivate(&mut self, reason: ExitReason) {
        if self.state == GridState::Inactive {
            return;
        }
        info!(reason = %reason, spread_id = ?self.spread_id, "grid deactivated");
        self.state = GridState::Inactive;
        self.levels.clear();
        self.spread_id = None;
        self.last_executed_z = None;
        self.next_trigger_z = None;
        self.generation += 1;
    }

    /// Rebuild an active grid from a persisted spread on restart: level 0 is
    /// marked executed with the recorded lots and trigger bookkeeping.
    pub fn resume(
        &mut self,
        side: SpreadSide,
        spread_id: String,
        entry_z: f64,
        last_z: f64,
        next_z: f64,
        primary_lots: f64,
        secondary_lots: f64,
    ) -> Result<(), &'static str> {
        let anchor = self.cfg.entry_threshold * -side.direction();
        self.activate(side, anchor)?;
        let level = &mut self.levels[0];
        level.status = LevelStatus::Executed;
        level.executed_z = Some(entry_z);
        level.primary_lots = primary_lots;
        level.secondary_lots = secondary_lots;
        self.spread_id = Some(spread_id);
        self.last_executed_z = Some(last_z);
        self.next_trigger_z = Some(next_z);
        self.generation += 1;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshot check
    // -------------------------------------------------------------------------

    /// Evaluate one snapshot. Mutates skipped levels in place; the triggered
    /// level is only proposed here and finalised by `mark_executed` after the
    /// orders fill.
    pub fn check(&mut self, snapshot: &MarketSnapshot, now_ms: u64) -> GridCheckResult {
        let side = match self.state {
            GridState::Inactive => return GridCheckResult::default(),
            GridState::Active(side) => side,
        };

        let z = snapshot.zscore;

        // --- 1. Exits win over everything -------------------------------
        if z.abs() >= self.cfg.stop_loss_z {
            return GridCheckResult {
                exit: Some(ExitReason::StopLoss),
                ..Default::default()
            };
        }
        let reverted = match side {
            SpreadSide::Long => z >= -self.cfg.exit_threshold,
            SpreadSide::Short => z <= self.cfg.exit_threshold,
        };
        if reverted {
            return GridCheckResult {
                exit: Some(ExitReason::MeanReversion),
                ..Default::default()
            };
        }

        // --- 2. Scan WAITING levels in index order -----------------------
        let half_step = self.cfg.scale_interval / 2.0;
        let mut skipped = Vec::new();
        let mut armed: Option<usize> = None;

        for level in &mut self.levels {
            // Blocked levels were armed under cooldown; they stay eligible.
            if !matches!(level.status, LevelStatus::Waiting | LevelStatus::Blocked) {
                continue;
            }
            // Depth of z past the target, positive once crossed.
            let overshoot = match side {
                SpreadSide::Long => level.target_z - z,
                SpreadSide::Short => z - level.target_z,
            };
            if overshoot < 0.0 {
                // Levels beyond this one are even deeper; nothing left to arm.
                break;
            }

            if level.index == 0 {
                if z.abs() >= self.cfg.entry_threshold && armed.is_none() {
                    armed = Some(level.index);
                }
            } else if overshoot >= half_step {
                level.status = LevelStatus::Skipped;
                skipped.push(level.clone());
                debug!(level = %level.name, target = level.target_z, z, "level skipped by z gap");
            } else if armed.is_none() {
                armed = Some(level.index);
            }
        }

        // --- 3. Cooldown gates on the armed level ------------------------
        let mut triggered = None;
        if let Some(index) = armed {
            let same_snapshot = self.last_executed_seq == Some(snapshot.seq);
            let throttled = self.cfg.min_inter_execution_ms > 0
                && self.last_execution_ms.is_some_and(|last| {
                    now_ms.saturating_sub(last) < self.cfg.min_inter_execution_ms
                });
            if same_snapshot || throttled {
                self.levels[index].status = LevelStatus::Blocked;
            } else {
                triggered = Some(self.levels[index].clone());
            }
        }

        GridCheckResult {
            triggered,
            skipped,
            exit: None,
        }
    }

    // -------------------------------------------------------------------------
    // Execution bookkeeping
    // -------------------------------------------------------------------------

    /// Finalise a level after its orders filled.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_executed(
        &mut self,
        index: usize,
        executed_z: f64,
        snapshot_seq: u64,
        now_ms: u64,
        primary_lots: f64,
        secondary_lots: f64,
        tickets: Vec<u64>,
    ) {
        let side = match self.state {
            GridState::Active(side) => side,
            GridState::Inactive => return,
        };
        let Some(level) = self.levels.get_mut(index) else {
            return;
        };

        level.status = LevelStatus::Executed;
        level.executed_z = Some(executed_z);
        level.primary_lots = primary_lots;
        level.secondary_lots = secondary_lots;
        level.tickets = tickets;

        self.last_executed_z = Some(executed_z);
        // LONG ladders march down, SHORT up.
        self.next_trigger_z = Some(executed_z - side.direction() * self.cfg.scale_interval);
        self.last_execution_ms = Some(now_ms);
        self.last_executed_seq = Some(snapshot_seq);
        self.generation += 1;

        info!(
            level = index,
            executed_z,
            primary_lots,
            secondary_lots,
            next_trigger_z = self.next_trigger_z.unwrap_or(f64::NAN),
            "grid level executed"
        );
    }

    pub fn set_spread_id(&mut self, id: String) {
        self.spread_id = Some(id);
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn state(&self) -> GridState {
        self.state
    }

    pub fn active_side(&self) -> Option<SpreadSide> {
        match self.state {
            GridState::Active(side) => Some(side),
            GridState::Inactive => None,
        }
    }

    pub fn spread_id(&self) -> Option<&str> {
        self.spread_id.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn anchor_z(&self) -> f64 {
        self.anchor_z
    }

    pub fn last_executed_z(&self) -> Option<f64> {
        self.last_executed_z
    }

    pub fn next_trigger_z(&self) -> Option<f64> {
        self.next_trigger_z
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn executed_fraction(&self) -> f64 {
        self.levels
            .iter()
            .filter(|l| l.status == LevelStatus::Executed)
            .map(|l| l.fraction)
            .sum()
    }

    pub fn executed_count(&self) -> usize {
        self.levels
            .iter()
            .filter(|l| l.status == LevelStatus::Executed)
            .count()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GridConfig {
        GridConfig {
            entry_threshold: 2.0,
            exit_threshold: 0.5,
            stop_loss_z: 3.5,
            scale_interval: 0.5,
            initial_fraction: 0.33,
            min_inter_execution_ms: 0,
            enable_pyramiding: true,
        }
    }

    fn snap(seq: u64, z: f64) -> MarketSnapshot {
        MarketSnapshot {
            seq,
            timestamp_ms: seq as i64 * 1000,
            primary_bid: 2600.0,
            primary_ask: 2600.5,
            secondary_bid: 30.0,
            secondary_ask: 30.01,
            spread: 1700.0 + z * 10.0,
            zscore: z,
            spread_mean: 1700.0,
            spread_std: 10.0,
            hedge_ratio: 30.0,
            correlation: 0.9,
            window_size: 1000,
        }
    }

    /// Drive one snapshot through check + mark_executed if a level triggers.
    fn step(grid: &mut UnifiedGrid, seq: u64, z: f64) -> GridCheckResult {
        let result = grid.check(&snap(seq, z), seq * 1000);
        if let Some(level) = &result.triggered {
            grid.mark_executed(level.index, z, seq, seq * 1000, 0.10, 3.0, vec![seq, seq + 500]);
        }
        result
    }

    #[test]
    fn activation_generates_threshold_anchored_ladder() {
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Long, -2.0).unwrap();

        let levels = grid.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].target_z, -2.0);
        assert_eq!(levels[1].target_z, -2.5);
        assert_eq!(levels[2].target_z, -3.0);

        let total: f64 = levels.iter().map(|l| l.fraction).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((levels[0].fraction - 0.33).abs() < 1e-9);
        assert!((levels[1].fraction - 0.335).abs() < 1e-9);
    }

    #[test]
    fn pyramiding_disabled_yields_single_level() {
        let mut c = cfg();
        c.enable_pyramiding = false;
        let mut grid = UnifiedGrid::new(c);
        grid.activate(SpreadSide::Short, 2.0).unwrap();
        assert_eq!(grid.levels().len(), 1);
    }

    #[test]
    fn entry_boundary_exact_threshold_triggers() {
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Long, -2.0).unwrap();

        // Just short of the threshold: nothing.
        let r = grid.check(&snap(1, -1.999), 1000);
        assert!(r.triggered.is_none());

        // Exactly at the threshold: entry arms.
        let r = grid.check(&snap(2, -2.0), 2000);
        assert_eq!(r.triggered.as_ref().map(|l| l.index), Some(0));
    }

    #[test]
    fn reverse_entry_blocked_while_active() {
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Long, -2.0).unwrap();
        assert!(grid.activate(SpreadSide::Short, 2.0).is_err());
        grid.deactivate(ExitReason::MeanReversion);
        assert!(grid.activate(SpreadSide::Short, 2.0).is_ok());
    }

    #[test]
    fn normal_mean_reversion_long_cycle() {
        // Scenario: z runs [+0.3, -1.2, -2.1, -1.6, -1.1, -0.4].
        let mut grid = UnifiedGrid::new(cfg());

        // Flat grid ignores the first two snapshots (activation happens at
        // the orchestrator once |z| >= entry).
        assert!(grid.check(&snap(1, 0.3), 1000).triggered.is_none());
        grid.activate(SpreadSide::Long, -2.0).unwrap();

        let r = step(&mut grid, 3, -2.1);
        assert_eq!(r.triggered.unwrap().index, 0);
        assert_eq!(grid.next_trigger_z(), Some(-2.6));

        // Reversion path: no pyramid triggers.
        assert!(step(&mut grid, 4, -1.6).triggered.is_none());
        assert!(step(&mut grid, 5, -1.1).triggered.is_none());

        // Exit at -0.4 (>= -0.5).
        let r = grid.check(&snap(6, -0.4), 6000);
        assert_eq!(r.exit, Some(ExitReason::MeanReversion));
    }

    #[test]
    fn pyramiding_with_skip() {
        // Scenario: z runs [-1.9, -2.0, -2.9, -3.1, -0.3].
        let mut grid = UnifiedGrid::new(cfg());

        assert!(grid.check(&snap(1, -1.9), 1000).triggered.is_none());
        grid.activate(SpreadSide::Long, -2.0).unwrap();

        let r = step(&mut grid, 2, -2.0);
        assert_eq!(r.triggered.unwrap().index, 0);

        // Gap to -2.9: L1 (target -2.5) is passed over, nothing executes.
        let r = step(&mut grid, 3, -2.9);
        assert!(r.triggered.is_none());
        assert_eq!(r.skipped.len(), 1);
        assert_eq!(r.skipped[0].index, 1);
        assert_eq!(grid.levels()[1].status, LevelStatus::Skipped);

        // L2 (target -3.0) executes at -3.1.
        let r = step(&mut grid, 4, -3.1);
        assert_eq!(r.triggered.unwrap().index, 2);

        let r = grid.check(&snap(5, -0.3), 5000);
        assert_eq!(r.exit, Some(ExitReason::MeanReversion));
    }

    #[test]
    fn pyramid_then_stop_loss() {
        // Scenario: z runs [-2.0, -2.6, -3.6].
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Long, -2.0).unwrap();

        assert_eq!(step(&mut grid, 1, -2.0).triggered.unwrap().index, 0);
        // -2.6 is 0.1 past L1's -2.5 target: still in its band.
        assert_eq!(step(&mut grid, 2, -2.6).triggered.unwrap().index, 1);

        let r = grid.check(&snap(3, -3.6), 3000);
        assert_eq!(r.exit, Some(ExitReason::StopLoss));
    }

    #[test]
    fn gap_to_stop_region_executes_entry_and_skips_intermediates() {
        // z jumps straight from 0 to -3.0.
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Long, -2.0).unwrap();

        let r = grid.check(&snap(1, -3.0), 1000);
        // Entry executes despite the overshoot.
        assert_eq!(r.triggered.as_ref().unwrap().index, 0);
        // L1 (-2.5) was gapped past; L2 (-3.0, exactly at z) stays WAITING.
        assert_eq!(r.skipped.len(), 1);
        assert_eq!(r.skipped[0].index, 1);
        grid.mark_executed(0, -3.0, 1, 1000, 0.10, 3.0, vec![1, 2]);
        assert_eq!(grid.levels()[2].status, LevelStatus::Waiting);

        // Next snapshot at z <= -3.0 executes the remaining level.
        let r = grid.check(&snap(2, -3.0), 2000);
        assert_eq!(r.triggered.unwrap().index, 2);
    }

    #[test]
    fn one_execution_per_snapshot() {
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Long, -2.0).unwrap();
        grid.mark_executed(0, -2.0, 7, 7000, 0.10, 3.0, vec![1, 2]);

        // Re-checking the SAME snapshot seq cannot fire another level.
        let r = grid.check(&snap(7, -2.6), 7000);
        assert!(r.triggered.is_none());

        // A fresh snapshot may.
        let r = grid.check(&snap(8, -2.6), 8000);
        assert_eq!(r.triggered.unwrap().index, 1);
    }

    #[test]
    fn wall_clock_cooldown_blocks_rapid_executions() {
        let mut c = cfg();
        c.min_inter_execution_ms = 10_000;
        let mut grid = UnifiedGrid::new(c);
        grid.activate(SpreadSide::Long, -2.0).unwrap();
        grid.mark_executed(0, -2.0, 1, 1_000, 0.10, 3.0, vec![1, 2]);

        let r = grid.check(&snap(2, -2.6), 5_000);
        assert!(r.triggered.is_none(), "cooldown must hold");
        assert_eq!(grid.levels()[1].status, LevelStatus::Blocked);

        // The blocked level re-arms once the cooldown elapses.
        let r = grid.check(&snap(3, -2.6), 11_001);
        assert_eq!(r.triggered.unwrap().index, 1);
    }

    #[test]
    fn short_side_mirrors_long() {
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Short, 2.0).unwrap();
        assert_eq!(grid.levels()[1].target_z, 2.5);

        assert_eq!(step(&mut grid, 1, 2.1).triggered.unwrap().index, 0);
        assert_eq!(grid.next_trigger_z(), Some(2.6));

        // Mean-reversion exit at z <= +exit_threshold.
        let r = grid.check(&snap(2, 0.4), 2000);
        assert_eq!(r.exit, Some(ExitReason::MeanReversion));
    }

    #[test]
    fn stop_loss_boundary_is_inclusive() {
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Short, 2.0).unwrap();
        let r = grid.check(&snap(1, 3.5), 1000);
        assert_eq!(r.exit, Some(ExitReason::StopLoss));
    }

    #[test]
    fn executed_count_never_exceeds_level_count() {
        let mut grid = UnifiedGrid::new(cfg());
        grid.activate(SpreadSide::Long, -2.0).unwrap();
        let n = grid.levels().len();
        for seq in 0..20u64 {
            let z = -2.0 - 0.1 * seq as f64;
            step(&mut grid, seq + 1, z.max(-3.4));
        }
        assert!(grid.executed_count() <= n);
    }

    #[test]
    fn generation_bumps_on_mutations() {
        let mut grid = UnifiedGrid::new(cfg());
        let g0 = grid.generation();
        grid.activate(SpreadSide::Long, -2.0).unwrap();
        let g1 = grid.generation();
        assert!(g1 > g0);
        grid.mark_executed(0, -2.0, 1, 1000, 0.1, 3.0, vec![1, 2]);
        let g2 = grid.generation();
        assert!(g2 > g1);
        grid.deactivate(ExitReason::MeanReversion);
        assert!(grid.generation() > g2);
    }

    #[test]
    fn resume_restores_executed_entry() {
        let mut grid = UnifiedGrid::new(cfg());
        grid.resume(
            SpreadSide::Long,
            "101-102".to_string(),
            -2.1,
            -2.1,
            -2.6,
            0.10,
            3.0,
        )
        .unwrap();
        assert_eq!(grid.active_side(), Some(SpreadSide::Long));
        assert_eq!(grid.spread_id(), Some("101-102"));
        assert_eq!(grid.levels()[0].status, LevelStatus::Executed);
        assert_eq!(grid.next_trigger_z(), Some(-2.6));
    }
}
