//! Trend-following order placement on top of the fund manager.
//!
//! The signal is a single comparison: long when the last price is above the
//! session open, short otherwise. Orders are limit orders at the last price,
//! sized by the fund manager.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::api::{place_order_with_retry, ExchangeGateway, DEFAULT_BOOK_DEPTH};
use crate::models::{Direction, MarketSnapshot, Order, OrderRequest, Ticker, TradeRecord};

use super::{FundManager, TradingConfig};

/// Account and history carried across sessions.
#[derive(Debug, Clone)]
pub struct StrategyState {
    pub fund_manager: FundManager,
    pub trade_history: Vec<TradeRecord>,
}

/// An order placed by `execute_strategy` and the record kept for it.
#[derive(Debug, Clone)]
pub struct ExecutedTrade {
    pub order: Order,
    pub record: TradeRecord,
}

/// Summary for display.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub current_balance: Decimal,
    pub total_trades: usize,
    pub leverage: u32,
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Performance ===")?;
        writeln!(f, "Balance:      ${:.2}", self.current_balance)?;
        writeln!(f, "Total Trades: {}", self.total_trades)?;
        write!(f, "Leverage:     {}x", self.leverage)
    }
}

pub struct TradingStrategy {
    gateway: Arc<dyn ExchangeGateway>,
    fund_manager: FundManager,
    trade_history: Vec<TradeRecord>,
    config: TradingConfig,
}

impl TradingStrategy {
    /// Fresh strategy starting from the configured initial balance.
    pub fn new(gateway: Arc<dyn ExchangeGateway>, config: TradingConfig) -> Self {
        let state = StrategyState {
            fund_manager: FundManager::new(config.initial_balance),
            trade_history: Vec::new(),
        };
        Self::from_state(gateway, config, state)
    }

    pub fn from_state(gateway: Arc<dyn ExchangeGateway>, config: TradingConfig, state: StrategyState) -> Self {
        Self {
            gateway,
            fund_manager: state.fund_manager,
            trade_history: state.trade_history,
            config,
        }
    }

    /// Release the account state, dropping the gateway.
    pub fn into_state(self) -> StrategyState {
        StrategyState {
            fund_manager: self.fund_manager,
            trade_history: self.trade_history,
        }
    }

    /// Copy of the account state, for rebuilding on another gateway.
    pub fn snapshot_state(&self) -> StrategyState {
        StrategyState {
            fund_manager: self.fund_manager.clone(),
            trade_history: self.trade_history.clone(),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn fund_manager(&self) -> &FundManager {
        &self.fund_manager
    }

    pub fn fund_manager_mut(&mut self) -> &mut FundManager {
        &mut self.fund_manager
    }

    pub fn trade_history(&self) -> &[TradeRecord] {
        &self.trade_history
    }

    /// Ticker and order book, fetched concurrently.
    pub async fn get_market_data(&self, symbol: &str) -> Result<MarketSnapshot> {
        let (ticker, order_book) = futures::try_join!(
            self.gateway.fetch_ticker(symbol),
            self.gateway.fetch_order_book(symbol, DEFAULT_BOOK_DEPTH),
        )
        .with_context(|| format!("Failed to fetch market data for {}", symbol))?;

        Ok(MarketSnapshot { ticker, order_book })
    }

    /// Long when the last price is above the session open, short otherwise.
    pub fn trend_of(ticker: &Ticker) -> Direction {
        if ticker.last > ticker.open {
            Direction::Long
        } else {
            Direction::Short
        }
    }

    pub async fn determine_trend(&self, symbol: &str) -> Result<Direction> {
        let snapshot = self.get_market_data(symbol).await?;
        Ok(Self::trend_of(&snapshot.ticker))
    }

    /// Place one limit order in the trend direction at the last price.
    ///
    /// The order carries `config.order_leverage` (1), not the fund manager's
    /// leverage, even though the latter scales the size.
    pub async fn execute_strategy(&mut self, symbol: &str) -> Result<ExecutedTrade> {
        let snapshot = self.get_market_data(symbol).await?;
        let direction = Self::trend_of(&snapshot.ticker);
        let entry_price = snapshot.ticker.last;

        let params = self.fund_manager.get_trade_params(self.config.risk_percent)?;
        if params.position_size <= Decimal::ZERO {
            anyhow::bail!(
                "Position size {} is not positive (balance {}), not placing an order",
                params.position_size,
                params.current_balance
            );
        }

        debug!(
            symbol = %symbol,
            direction = %direction,
            size = %params.position_size,
            sizing_leverage = params.leverage,
            order_leverage = self.config.order_leverage,
            "Placing strategy order"
        );

        let request = OrderRequest::limit(
            symbol,
            direction.order_side(),
            params.position_size,
            entry_price,
            self.config.order_leverage,
        );
        let order = place_order_with_retry(self.gateway.as_ref(), &request, &self.config.retry)
            .await
            .into_result()?;

        let record = TradeRecord {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            direction,
            size: params.position_size,
            entry_price,
            liquidation_price: self.fund_manager.get_liquidation_price(entry_price, direction),
        };
        self.trade_history.push(record.clone());

        info!(
            symbol = %symbol,
            direction = %direction,
            size = %record.size,
            entry = %record.entry_price,
            liquidation = %record.liquidation_price,
            order_id = %order.id,
            "Trade executed"
        );

        Ok(ExecutedTrade { order, record })
    }

    pub fn get_performance_report(&self) -> PerformanceReport {
        PerformanceReport {
            current_balance: self.fund_manager.balance(),
            total_trades: self.trade_history.len(),
            leverage: self.fund_manager.leverage(),
        }
    }
}
