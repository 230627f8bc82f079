// =============================================================================
// Position monitor — broker reconciliation and manual-closure protocol (C7)
// =============================================================================
//
// Watches the tickets the engine opened and compares them against the broker
// snapshot every poll:
//
//   - ALL registered tickets gone  -> AllClosed (fired once): the operator or
//     the broker flattened the book outside the engine; the orchestrator
//     resets grid, tracker and persisted state.
//   - SOME tickets gone            -> a confirmation prompt opens with a
//     wall-clock deadline. REBALANCE restores the missing legs; CLOSE-ALL or
//     a timeout flattens what is left.
//
// The monitor never issues orders itself — it raises events that the
// pipeline consumes.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Operator answer to the manual-closure prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    Rebalance,
    CloseAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Every monitored ticket disappeared from the broker.
    AllClosed,
    /// Some legs disappeared; a confirmation window is now open.
    PromptOpened { missing: Vec<u64> },
    /// The prompt was answered (or timed out, which forces CloseAll).
    PromptResolved {
        missing: Vec<u64>,
        confirmation: Confirmation,
        timed_out: bool,
    },
}

#[derive(Debug, Clone)]
struct PendingPrompt {
    missing: Vec<u64>,
    deadline_ms: u64,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct PositionMonitor {
    /// ticket -> symbol for every leg the engine expects to exist.
    registered: RwLock<HashMap<u64, String>>,
    pending: RwLock<Option<PendingPrompt>>,
    response: RwLock<Option<Confirmation>>,
    /// Guards against re-firing AllClosed every poll.
    all_closed_latched: RwLock<bool>,
    confirm_timeout_ms: u64,
}

impl PositionMonitor {
    pub fn new(confirm_timeout_s: u64) -> Self {
        Self {
            registered: RwLock::new(HashMap::new()),
            pending: RwLock::new(None),
            response: RwLock::new(None),
            all_closed_latched: RwLock::new(false),
            confirm_timeout_ms: confirm_timeout_s * 1000,
        }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    pub fn register(&self, ticket: u64, symbol: &str) {
        self.registered.write().insert(ticket, symbol.to_string());
        info!(ticket, symbol, "monitoring ticket");
    }

    pub fn unregister(&self, ticket: u64) {
        if self.registered.write().remove(&ticket).is_some() {
            info!(ticket, "stopped monitoring ticket");
        }
    }

    pub fn clear(&self) {
        self.registered.write().clear();
        *self.pending.write() = None;
        *self.response.write() = None;
    }

    pub fn monitored_tickets(&self) -> HashSet<u64> {
        self.registered.read().keys().copied().collect()
    }

    // -------------------------------------------------------------------------
    // Poll
    // -------------------------------------------------------------------------

    /// Compare the broker's live tickets against the registered set.
    /// At most one event is returned per poll.
    pub fn check(&self, live_tickets: &HashSet<u64>, now_ms: u64) -> Option<MonitorEvent> {
        // A pending prompt is resolved before anything else is considered.
        // Clone out first so the read guard is released before the writes.
        let pending = self.pending.read().clone();
        if let Some(prompt) = pending {
            if let Some(confirmation) = self.response.write().take() {
                *self.pending.write() = None;
                info!(?confirmation, "manual-closure prompt answered");
                return Some(MonitorEvent::PromptResolved {
                    missing: prompt.missing,
                    confirmation,
                    timed_out: false,
                });
            }
            if now_ms >= prompt.deadline_ms {
                *self.pending.write() = None;
                warn!("no operator response — forcing CLOSE-ALL");
                return Some(MonitorEvent::PromptResolved {
                    missing: prompt.missing,
                    confirmation: Confirmation::CloseAll,
                    timed_out: true,
                });
            }
            return None;
        }

        let expected = self.monitored_tickets();
        if expected.is_empty() {
            return None;
        }

        let still_open: HashSet<u64> = expected.intersection(live_tickets).copied().collect();

        if still_open.is_empty() {
            let mut latched = self.all_closed_latched.write();
            if *latched {
                return None;
            }
            *latched = true;
            warn!(
                expected = expected.len(),
                "all monitored positions closed externally — system reset"
            );
            self.registered.write().clear();
            return Some(MonitorEvent::AllClosed);
        }

        // Positions exist again: re-arm the latch.
        *self.all_closed_latched.write() = false;

        let mut missing: Vec<u64> = expected.difference(live_tickets).copied().collect();
        if missing.is_empty() {
            return None;
        }
        missing.sort_unstable();

        warn!(?missing, timeout_ms = self.confirm_timeout_ms, "manual closure detected — awaiting operator");
        *self.pending.write() = Some(PendingPrompt {
            missing: missing.clone(),
            deadline_ms: now_ms + self.confirm_timeout_ms,
        });
        *self.response.write() = None;
        Some(MonitorEvent::PromptOpened { missing })
    }

    // -------------------------------------------------------------------------
    // Operator surface
    // -------------------------------------------------------------------------

    /// Record an operator answer. Returns `false` when no prompt is open.
    pub fn confirm(&self, confirmation: Confirmation) -> bool {
        if self.pending.read().is_none() {
            return false;
        }
        *self.response.write() = Some(confirmation);
        true
    }

    pub fn prompt_open(&self) -> bool {
        self.pending.read().is_some()
    }
}

impl std::fmt::Debug for PositionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionMonitor")
            .field("registered", &self.registered.read().len())
            .field("prompt_open", &self.pending.read().is_some())
            .finish()
    }
}
