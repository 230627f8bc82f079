// =============================================================================
// Broker collaborator contracts — MarketFeed, OrderGateway, Clock
// =============================================================================
//
// The engine core never talks to a wire protocol directly. Quote sources and
// order routing live behind these traits; concrete bridges are selected at
// startup. In-tree implementations: the paper gateway (demo fills) and the
// JSON tick-replay feed.
//
// Concurrency contract: only `close(ticket)` may be called in parallel (the
// fast-close worker pool). Everything else is serialised by `GatewayHandle`.
// =============================================================================

pub mod paper;
pub mod replay;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::EngineError;
use crate::types::OrderSide;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One observation of both legs' top-of-book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    /// Epoch milliseconds.
    pub t: i64,
    pub bid_primary: f64,
    pub ask_primary: f64,
    pub bid_secondary: f64,
    pub ask_secondary: f64,
}

/// A single historical close used to seed the rolling window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoryBar {
    /// Epoch milliseconds, aligned to the bar period.
    pub t: i64,
    pub close: f64,
}

/// Static trading parameters for one symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub contract_size: f64,
    pub min_lot: f64,
    pub lot_step: f64,
    pub tick_size: f64,
}

/// Result of a filled market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub ticket: u64,
    pub filled_lots: f64,
    pub filled_price: f64,
}

/// One open position as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub lots: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub unrealised: f64,
}

/// Account-level metrics used by the risk gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    /// Equity / margin in percent; 0.0 when no margin is in use.
    pub margin_level: f64,
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Quote and history source for the instrument pair.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Start streaming ticks for the configured pair. The sender half lives
    /// inside the feed; the stream ends when the feed is exhausted or the
    /// connection drops.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Tick>>;

    /// Historical closes for one symbol, oldest first.
    async fn history(
        &self,
        symbol: &str,
        bar_period_secs: u64,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<HistoryBar>>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;
}

/// Order routing and account state.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_market(
        &self,
        symbol: &str,
        side: OrderSide,
        lots: f64,
        comment: &str,
    ) -> Result<OrderResult, EngineError>;

    /// Close one position by ticket. Returns `false` when the ticket no
    /// longer exists. The only gateway call that may run concurrently.
    async fn close(&self, ticket: u64) -> Result<bool, EngineError>;

    async fn positions(&self) -> Result<Vec<BrokerPosition>, EngineError>;

    async fn account_info(&self) -> Result<AccountInfo, EngineError>;
}

/// Injectable time source so session arithmetic is testable.
pub trait Clock: Send + Sync {
    /// Monotonic-ish epoch milliseconds.
    fn now_ms(&self) -> u64;
    /// Local wall clock for session-boundary arithmetic.
    fn local_time(&self) -> DateTime<Local>;
}

/// Production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    fn local_time(&self) -> DateTime<Local> {
        Local::now()
    }
}

// ---------------------------------------------------------------------------
// GatewayHandle — access serialisation + per-call deadline
// ---------------------------------------------------------------------------

/// Process-wide handle to the broker connection.
///
/// All calls except `close` are funnelled through one mutex because most
/// broker bridges are not thread-safe. Every call carries a deadline; on
/// timeout the outcome is *unknown* and the position monitor's next
/// reconciliation sweep resolves it.
#[derive(Clone)]
pub struct GatewayHandle {
    gateway: Arc<dyn OrderGateway>,
    serial: Arc<tokio::sync::Mutex<()>>,
    deadline: Duration,
}

impl GatewayHandle {
    pub fn new(gateway: Arc<dyn OrderGateway>, deadline: Duration) -> Self {
        Self {
            gateway,
            serial: Arc::new(tokio::sync::Mutex::new(())),
            deadline,
        }
    }

    pub async fn place_market(
        &self,
        symbol: &str,
        side: OrderSide,
        lots: f64,
        comment: &str,
    ) -> Result<OrderResult, EngineError> {
        let _guard = self.serial.lock().await;
        tokio::time::timeout(
            self.deadline,
            self.gateway.place_market(symbol, side, lots, comment),
        )
        .await
        .map_err(|_| EngineError::BrokerTimeout {
            what: format!("place_market {side} {lots} {symbol}"),
        })?
    }

    /// Deliberately does NOT take the serialisation mutex — the fast-close
    /// pool issues these concurrently.
    pub async fn close(&self, ticket: u64) -> Result<bool, EngineError> {
        tokio::time::timeout(self.deadline, self.gateway.close(ticket))
            .await
            .map_err(|_| EngineError::BrokerTimeout {
                what: format!("close #{ticket}"),
            })?
    }

    pub async fn positions(&self) -> Result<Vec<BrokerPosition>, EngineError> {
        let _guard = self.serial.lock().await;
        tokio::time::timeout(self.deadline, self.gateway.positions())
            .await
            .map_err(|_| EngineError::BrokerTimeout {
                what: "positions".to_string(),
            })?
    }

    pub async fn account_info(&self) -> Result<AccountInfo, EngineError> {
        let _guard = self.serial.lock().await;
        tokio::time::timeout(self.deadline, self.gateway.account_info())
            .await
            .map_err(|_| EngineError::BrokerTimeout {
                what: "account_info".to_string(),
            })?
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    struct SlowGateway;

    #[async_trait]
    impl OrderGateway for SlowGateway {
        async fn place_market(
            &self,
            _symbol: &str,
            _side: OrderSide,
            lots: f64,
            _comment: &str,
        ) -> Result<OrderResult, EngineError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(OrderResult {
                ticket: 1,
                filled_lots: lots,
                filled_price: 100.0,
            })
        }

        async fn close(&self, _ticket: u64) -> Result<bool, EngineError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(true)
        }

        async fn positions(&self) -> Result<Vec<BrokerPosition>, EngineError> {
            Ok(Vec::new())
        }

        async fn account_info(&self) -> Result<AccountInfo, EngineError> {
            Ok(AccountInfo {
                balance: 0.0,
                equity: 0.0,
                margin: 0.0,
                free_margin: 0.0,
                margin_level: 0.0,
            })
        }
    }

    #[tokio::test]
    async fn deadline_converts_to_broker_timeout() {
        let handle = GatewayHandle::new(Arc::new(SlowGateway), Duration::from_millis(5));
        let err = handle
            .place_market("XAUUSD", OrderSide::Buy, 0.1, "ID:000000")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BrokerTimeout { .. }));

        let err = handle.close(42).await.unwrap_err();
        assert!(matches!(err, EngineError::BrokerTimeout { .. }));
    }

    #[tokio::test]
    async fn generous_deadline_passes_through() {
        let handle = GatewayHandle::new(Arc::new(SlowGateway), Duration::from_millis(500));
        let result = handle
            .place_market("XAUUSD", OrderSide::Buy, 0.1, "ID:000000")
            .await
            .unwrap();
        assert_eq!(result.ticket, 1);
        assert!(handle.close(42).await.unwrap());
    }
}
