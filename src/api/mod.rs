//! Exchange gateway: the capability surface the strategy and monitor use,
//! plus REST clients for OKX and Binance.

mod binance;
mod config;
mod error;
mod okx;
mod retry;

#[cfg(test)]
pub(crate) mod mock;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use crate::models::{Candle, Order, OrderBook, OrderRequest, Ticker, Timeframe};

pub use binance::BinanceClient;
pub use config::{Credentials, ExchangeConfig, ExchangeKind, ProxyConfig};
pub use error::GatewayError;
pub use okx::OkxClient;
pub use retry::{place_order_with_retry, RetryPolicy};

/// Default number of candles requested for charts.
pub const DEFAULT_OHLCV_LIMIT: usize = 100;

/// Default order book depth.
pub const DEFAULT_BOOK_DEPTH: usize = 20;

/// Market data and order entry on one exchange.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Short exchange name for logs and chart titles.
    fn name(&self) -> &'static str;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, GatewayError>;

    /// Candles in ascending time order.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    /// Free USDT balance.
    async fn fetch_balance(&self) -> Result<Decimal, GatewayError>;

    async fn create_order(&self, request: &OrderRequest) -> Result<Order, GatewayError>;
}

/// Build a client for the configured exchange.
pub fn connect(config: &ExchangeConfig) -> Result<Arc<dyn ExchangeGateway>, GatewayError> {
    info!(
        exchange = %config.kind,
        simulated = config.simulated,
        proxy = %config.proxy.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "none".to_string()),
        authenticated = config.credentials.is_some(),
        "Connecting to exchange"
    );

    let gateway: Arc<dyn ExchangeGateway> = match config.kind {
        ExchangeKind::Okx => Arc::new(OkxClient::new(config)?),
        ExchangeKind::Binance => Arc::new(BinanceClient::new(config)?),
    };
    Ok(gateway)
}

/// Parse a decimal string from an exchange payload. Empty strings are zero.
pub(crate) fn parse_decimal(field: &str, value: &str) -> Result<Decimal, GatewayError> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(value)
        .or_else(|_| Decimal::from_scientific(value))
        .map_err(|e| GatewayError::Decode(format!("{} '{}': {}", field, value, e)))
}

/// Split a unified symbol like `BTC/USDT` or `BTC/USDT:USDT` into base and quote.
pub(crate) fn split_symbol(symbol: &str) -> Result<(&str, &str), GatewayError> {
    let pair = symbol.split(':').next().unwrap_or(symbol);
    match pair.split_once('/') {
        Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok((base, quote)),
        _ => Err(GatewayError::UnsupportedSymbol(symbol.to_string())),
    }
}
