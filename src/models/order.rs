//! Order request and exchange order models.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Limit => "limit",
            OrderKind::Market => "market",
        }
    }
}

/// Parameters for `create_order`.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Unified symbol, e.g. `BTC/USDT`
    pub symbol: String,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub amount: Decimal,

    /// Limit price; ignored for market orders
    pub price: Option<Decimal>,

    /// Leverage passed along with the order
    pub leverage: u32,

    /// Client-side id so a retried request can be matched on the exchange
    pub client_order_id: String,
}

impl OrderRequest {
    /// Limit order with a fresh client order id.
    pub fn limit(symbol: &str, side: OrderSide, amount: Decimal, price: Decimal, leverage: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind: OrderKind::Limit,
            side,
            amount,
            price: Some(price),
            leverage,
            client_order_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Order as acknowledged by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Decimal,
    pub amount: Decimal,

    /// Quantity filled at acknowledgement time
    pub filled: Decimal,

    pub status: String,
}
