//! Trading logic: fund management and the trend strategy.

mod config;
mod fund_manager;
mod strategy;

pub use config::{BacktestConfig, TradingConfig};
pub use fund_manager::{FundManager, DEFAULT_PARAMS_FILE};
pub use strategy::{StrategyState, TradingStrategy};
