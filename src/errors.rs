// =============================================================================
// Typed error kinds for the engine core
// =============================================================================
//
// Policy per kind:
//   StaleMarket / InsufficientWindow  — snapshot suppressed, recovered locally.
//   SingularEstimator                 — hedge ratio left unchanged, warning.
//   OrderRejected                     — abort the action (or hedge-incomplete
//                                       when the first leg already filled).
//   BrokerTimeout                     — outcome unknown; the position monitor's
//                                       next sweep resolves it.
//   ConfigInvalid                     — fatal at startup.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A leg has a zero or missing bid — market closed or feed gap.
    #[error("stale market data for {symbol}: zero bid")]
    StaleMarket { symbol: String },

    /// Rolling window shorter than the warmup length.
    #[error("rolling window too small: {len} bars (warmup {warmup})")]
    InsufficientWindow { len: usize, warmup: usize },

    /// Every hedge-ratio estimator failed (e.g. degenerate price series).
    #[error("all hedge-ratio estimators failed")]
    SingularEstimator,

    /// The gateway refused an order.
    #[error("order rejected for {symbol}: {reason}")]
    OrderRejected { symbol: String, reason: String },

    /// A gateway call exceeded its deadline; the result is unknown.
    #[error("broker call timed out: {what}")]
    BrokerTimeout { what: String },

    /// Startup configuration failed validation. Always fatal.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}
