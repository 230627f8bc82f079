// =============================================================================
// Shared types used across the Meridian pair-trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a single broker order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1.0 for Buy, -1.0 for Sell. Used in PnL arithmetic.
    pub fn direction(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of a two-leg spread position.
///
/// LONG spread = buy primary, sell secondary (entered when z is deeply
/// negative). SHORT spread is the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpreadSide {
    Long,
    Short,
}

impl SpreadSide {
    /// +1.0 for Long, -1.0 for Short.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Order side for the primary leg when opening the spread.
    pub fn primary_order_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side for the secondary leg when opening the spread.
    pub fn secondary_order_side(self) -> OrderSide {
        self.primary_order_side().opposite()
    }
}

impl std::fmt::Display for SpreadSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Why a spread (or all spreads) is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Z-score reverted through the exit threshold.
    MeanReversion,
    /// |z| reached the stop-loss level.
    StopLoss,
    /// Per-setup loss cap breached (closes one spread).
    SetupLossCap,
    /// Session loss cap breached (closes everything, locks trading).
    SessionLossCap,
    /// Margin level fell below the configured floor.
    MarginFloor,
    /// Operator answered CLOSE-ALL to the manual-closure prompt, or the
    /// prompt timed out.
    ManualClosure,
    /// Engine is shutting down and draining open positions.
    Shutdown,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MeanReversion => write!(f, "MeanReversion"),
            Self::StopLoss => write!(f, "StopLoss"),
            Self::SetupLossCap => write!(f, "SetupLossCap"),
            Self::SessionLossCap => write!(f, "SessionLossCap"),
            Self::MarginFloor => write!(f, "MarginFloor"),
            Self::ManualClosure => write!(f, "ManualClosure"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_side_leg_orders() {
        assert_eq!(SpreadSide::Long.primary_order_side(), OrderSide::Buy);
        assert_eq!(SpreadSide::Long.secondary_order_side(), OrderSide::Sell);
        assert_eq!(SpreadSide::Short.primary_order_side(), OrderSide::Sell);
        assert_eq!(SpreadSide::Short.secondary_order_side(), OrderSide::Buy);
    }

    #[test]
    fn order_side_direction_sign() {
        assert_eq!(OrderSide::Buy.direction(), 1.0);
        assert_eq!(OrderSide::Sell.direction(), -1.0);
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }
}
