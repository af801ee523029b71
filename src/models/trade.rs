//! Trade direction and the immutable trade record kept by the strategy.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// Exchange order side used to open a position in this direction.
    pub fn order_side(&self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Ok(Direction::Long),
            "short" | "sell" => Ok(Direction::Short),
            other => anyhow::bail!("Unknown direction '{}'", other),
        }
    }
}

/// A trade placed by the strategy. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub direction: Direction,

    /// Notional size sent with the order
    pub size: Decimal,

    pub entry_price: Decimal,

    /// Price at which the position would be force-closed
    pub liquidation_price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_maps_to_order_side() {
        assert_eq!(Direction::Long.order_side(), OrderSide::Buy);
        assert_eq!(Direction::Short.order_side(), OrderSide::Sell);
        assert_eq!("SELL".parse::<Direction>().unwrap(), Direction::Short);
    }
}
