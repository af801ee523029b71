//! Data models for market data, orders and trade records.

mod market;
mod order;
mod trade;

pub use market::{BookLevel, Candle, MarketSnapshot, OrderBook, Ticker, Timeframe};
pub use order::{Order, OrderKind, OrderRequest, OrderSide};
pub use trade::{Direction, TradeRecord};
