//! Trading configuration.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::api::RetryPolicy;

/// Configuration for order sizing and execution.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    /// Percentage of balance put at risk per trade (2.0 = 2%)
    pub risk_percent: Decimal,

    /// Starting balance when no parameter file exists
    pub initial_balance: Decimal,

    /// Leverage sent with every order. Always 1, independent of the fund
    /// manager's leverage used for sizing.
    pub order_leverage: u32,

    /// Retry schedule for order placement
    pub retry: RetryPolicy,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            risk_percent: dec!(2.0),
            initial_balance: dec!(100.0),
            order_leverage: 1,
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration for the live "backtest" loop.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Number of simulated days; the loop runs `days * 24` iterations
    pub days: u32,

    /// Wall-clock wait between iterations (one simulated hour)
    pub interval: Duration,

    /// Directory the results file is written to
    pub output_dir: PathBuf,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            days: 1,
            interval: Duration::from_secs(3600),
            output_dir: PathBuf::from("."),
        }
    }
}

impl BacktestConfig {
    pub fn iterations(&self) -> u64 {
        u64::from(self.days) * 24
    }
}
