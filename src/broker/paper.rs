// =============================================================================
// Paper gateway — simulated fills against the live quote board
// =============================================================================
//
// The demo-mode order gateway: no request leaves the process. Orders fill
// instantly at the current top-of-book (buys at the ask, sells at the bid),
// positions realise into the simulated balance on close, and margin is
// approximated from notional / leverage so the risk gate's margin-floor path
// is exercisable in paper sessions.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::broker::{AccountInfo, BrokerPosition, OrderGateway, OrderResult, Tick};
use crate::errors::EngineError;
use crate::types::OrderSide;

/// Simulated account leverage for margin arithmetic.
const PAPER_LEVERAGE: f64 = 100.0;

struct PaperPosition {
    ticket: u64,
    symbol: String,
    side: OrderSide,
    lots: f64,
    open_price: f64,
}

struct Book {
    balance: f64,
    next_ticket: u64,
    positions: HashMap<u64, PaperPosition>,
}

pub struct PaperGateway {
    /// Shared with the data pump; always holds the latest tick.
    quotes: Arc<RwLock<Option<Tick>>>,
    primary_symbol: String,
    secondary_symbol: String,
    book: Mutex<Book>,
}

impl PaperGateway {
    pub fn new(
        quotes: Arc<RwLock<Option<Tick>>>,
        primary_symbol: impl Into<String>,
        secondary_symbol: impl Into<String>,
        starting_balance: f64,
    ) -> Self {
        info!(starting_balance, "paper gateway ready (demo fills)");
        Self {
            quotes,
            primary_symbol: primary_symbol.into(),
            secondary_symbol: secondary_symbol.into(),
            book: Mutex::new(Book {
                balance: starting_balance,
                next_ticket: 1000,
                positions: HashMap::new(),
            }),
        }
    }

    /// (bid, ask) for a symbol from the latest tick.
    fn quote(&self, symbol: &str) -> Result<(f64, f64), EngineError> {
        let tick = self.quotes.read().ok_or(EngineError::StaleMarket {
            symbol: symbol.to_string(),
        })?;
        let (bid, ask) = if symbol == self.primary_symbol {
            (tick.bid_primary, tick.ask_primary)
        } else if symbol == self.secondary_symbol {
            (tick.bid_secondary, tick.ask_secondary)
        } else {
            return Err(EngineError::OrderRejected {
                symbol: symbol.to_string(),
                reason: "unknown symbol".to_string(),
            });
        };
        if bid <= 0.0 {
            return Err(EngineError::StaleMarket {
                symbol: symbol.to_string(),
            });
        }
        Ok((bid, ask))
    }

    /// Exit price for an open position: longs close at the bid, shorts at
    /// the ask.
    fn exit_price(&self, pos: &PaperPosition) -> Result<f64, EngineError> {
        let (bid, ask) = self.quote(&pos.symbol)?;
        Ok(match pos.side {
            OrderSide::Buy => bid,
            OrderSide::Sell => ask,
        })
    }

    fn unrealised(pos: &PaperPosition, exit_px: f64) -> f64 {
        (exit_px - pos.open_price) * pos.lots * pos.side.direction()
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place_market(
        &self,
        symbol: &str,
        side: OrderSide,
        lots: f64,
        comment: &str,
    ) -> Result<OrderResult, EngineError> {
        if lots <= 0.0 {
            return Err(EngineError::OrderRejected {
                symbol: symbol.to_string(),
                reason: format!("non-positive volume {lots}"),
            });
        }
        let (bid, ask) = self.quote(symbol)?;
        let fill_price = match side {
            OrderSide::Buy => ask,
            OrderSide::Sell => bid,
        };

        let mut book = self.book.lock();
        book.next_ticket += 1;
        let ticket = book.next_ticket;
        book.positions.insert(
            ticket,
            PaperPosition {
                ticket,
                symbol: symbol.to_string(),
                side,
                lots,
                open_price: fill_price,
            },
        );

        debug!(ticket, symbol, %side, lots, fill_price, comment, "paper fill");
        Ok(OrderResult {
            ticket,
            filled_lots: lots,
            filled_price: fill_price,
        })
    }

    async fn close(&self, ticket: u64) -> Result<bool, EngineError> {
        let pos = {
            let mut book = self.book.lock();
            match book.positions.remove(&ticket) {
                Some(pos) => pos,
                None => return Ok(false),
            }
        };
        let exit_px = match self.exit_price(&pos) {
            Ok(px) => px,
            Err(e) => {
                // Quote gone: put the position back, let the caller retry.
                self.book.lock().positions.insert(ticket, pos);
                return Err(e);
            }
        };
        let pnl = Self::unrealised(&pos, exit_px);
        let mut book = self.book.lock();
        book.balance += pnl;
        debug!(ticket, exit_px, pnl, balance = book.balance, "paper close");
        Ok(true)
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, EngineError> {
        let book = self.book.lock();
        let mut out = Vec::with_capacity(book.positions.len());
        for pos in book.positions.values() {
            let current = self.exit_price(pos).unwrap_or(pos.open_price);
            out.push(BrokerPosition {
                ticket: pos.ticket,
                symbol: pos.symbol.clone(),
                side: pos.side,
                lots: pos.lots,
                open_price: pos.open_price,
                current_price: current,
                unrealised: Self::unrealised(pos, current),
            });
        }
        Ok(out)
    }

    async fn account_info(&self) -> Result<AccountInfo, EngineError> {
        let book = self.book.lock();
        let mut unrealised = 0.0;
        let mut margin = 0.0;
        for pos in book.positions.values() {
            let current = self.exit_price(pos).unwrap_or(pos.open_price);
            unrealised += Self::unrealised(pos, current);
            margin += pos.lots.abs() * current / PAPER_LEVERAGE;
        }
        let equity = book.balance + unrealised;
        Ok(AccountInfo {
            balance: book.balance,
            equity,
            margin,
            free_margin: equity - margin,
            margin_level: if margin > 0.0 {
                equity / margin * 100.0
            } else {
                0.0
            },
        })
    }
}
