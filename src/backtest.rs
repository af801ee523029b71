//! Live "backtest": repeatedly runs the strategy against the real gateway
//! and records a mark-to-market PnL per order.
//!
//! Each iteration places one order, then re-reads the ticker and values the
//! fill at `filled * (order_price - last)`. Rows are exported to
//! `backtest_<YYYYmmdd_HHMMSS>.csv` in the configured directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::Direction;
use crate::trading::{BacktestConfig, TradingStrategy};

/// Granularity at which the inter-iteration wait checks for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// One exported row.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRecord {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub pnl: Decimal,
}

/// Outcome of a backtest run.
#[derive(Debug, Clone)]
pub struct BacktestReport {
    pub symbol: String,
    pub iterations_planned: u64,
    pub iterations_run: u64,
    pub failed_iterations: u64,
    pub records: Vec<BacktestRecord>,
    /// Path of the exported CSV
    pub output_path: PathBuf,
}

impl BacktestReport {
    pub fn total_pnl(&self) -> Decimal {
        self.records.iter().map(|r| r.pnl).sum()
    }
}

impl std::fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Symbol:      {}", self.symbol)?;
        writeln!(
            f,
            "Iterations:  {}/{} ({} failed)",
            self.iterations_run, self.iterations_planned, self.failed_iterations
        )?;
        writeln!(f, "Orders:      {}", self.records.len())?;
        writeln!(f, "Total PnL:   ${:.4}", self.total_pnl())?;
        writeln!(f, "Exported to: {}", self.output_path.display())?;
        write!(f, "{:=^60}", "")
    }
}

/// Drives `TradingStrategy::execute_strategy` on a fixed schedule.
pub struct Backtester {
    config: BacktestConfig,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    /// Run `days * 24` iterations, or fewer if `shutdown` is raised. The
    /// rows collected so far are exported either way.
    pub async fn run(
        &self,
        strategy: &mut TradingStrategy,
        symbol: &str,
        shutdown: &AtomicBool,
    ) -> Result<BacktestReport> {
        let planned = self.config.iterations();
        info!(
            symbol = %symbol,
            days = self.config.days,
            iterations = planned,
            interval_secs = self.config.interval.as_secs(),
            "Starting backtest"
        );

        let mut records = Vec::new();
        let mut iterations_run = 0;
        let mut failed = 0;

        for i in 0..planned {
            if shutdown.load(Ordering::SeqCst) {
                info!(completed = i, "Backtest interrupted");
                break;
            }
            iterations_run += 1;

            match Self::run_iteration(strategy, symbol).await {
                Ok(record) => {
                    info!(
                        iteration = i + 1,
                        direction = %record.direction,
                        size = %record.size,
                        pnl = %record.pnl,
                        "Backtest iteration complete"
                    );
                    records.push(record);
                }
                Err(e) => {
                    failed += 1;
                    warn!(iteration = i + 1, error = %e, "Backtest iteration failed");
                }
            }

            if i + 1 < planned && !wait_interval(self.config.interval, shutdown).await {
                info!(completed = i + 1, "Backtest interrupted");
                break;
            }
        }

        let output_path = export_backtest_results(&records, &self.config.output_dir)?;

        Ok(BacktestReport {
            symbol: symbol.to_string(),
            iterations_planned: planned,
            iterations_run,
            failed_iterations: failed,
            records,
            output_path,
        })
    }

    async fn run_iteration(strategy: &mut TradingStrategy, symbol: &str) -> Result<BacktestRecord> {
        let trade = strategy.execute_strategy(symbol).await?;
        let current = strategy
            .gateway()
            .fetch_ticker(symbol)
            .await
            .with_context(|| format!("Failed to fetch ticker for {}", symbol))?;

        Ok(BacktestRecord {
            timestamp: trade.record.timestamp,
            direction: trade.record.direction,
            size: trade.record.size,
            entry_price: trade.record.entry_price,
            pnl: trade.order.filled * (trade.order.price - current.last),
        })
    }
}

/// Sleep for `interval`; returns false if shutdown was requested meanwhile.
async fn wait_interval(interval: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        tokio::time::sleep(remaining.min(SHUTDOWN_POLL)).await;
    }
}

/// Write rows to `dir/backtest_<YYYYmmdd_HHMMSS>.csv` and return the path.
pub fn export_backtest_results(records: &[BacktestRecord], dir: &Path) -> Result<PathBuf> {
    let filename = format!("backtest_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"));
    let path = dir.join(filename);

    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_records(&mut writer, records)?;
    writer.flush().context("Failed to flush backtest results")?;

    info!(path = %path.display(), rows = records.len(), "Backtest results exported");
    Ok(path)
}

/// Timestamps are written as Unix seconds with millisecond precision.
fn write_records<W: std::io::Write>(writer: &mut csv::Writer<W>, records: &[BacktestRecord]) -> Result<()> {
    writer.write_record(["timestamp", "direction", "size", "entry_price", "pnl"])?;
    for record in records {
        let timestamp = format!(
            "{}.{:03}",
            record.timestamp.timestamp(),
            record.timestamp.timestamp_subsec_millis()
        );
        writer.write_record([
            timestamp,
            record.direction.as_str().to_string(),
            record.size.to_string(),
            record.entry_price.to_string(),
            record.pnl.to_string(),
        ])?;
    }
    Ok(())
}
