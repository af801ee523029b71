//! Leveraged trend trader for OKX and Binance
//!
//! Polls market data, draws live candlestick charts and places limit
//! orders sized by a balance-driven fund manager.

mod api;
mod backtest;
mod chart;
mod console;
mod db;
mod models;
mod monitor;
mod session;
mod trading;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{ExchangeConfig, ExchangeKind, DEFAULT_BOOK_DEPTH};
use crate::backtest::Backtester;
use crate::chart::ChartSize;
use crate::console::Console;
use crate::db::TradeJournal;
use crate::models::Timeframe;
use crate::monitor::MonitorConfig;
use crate::session::{Session, SessionConfig};
use crate::trading::{
    BacktestConfig, FundManager, StrategyState, TradingConfig, TradingStrategy, DEFAULT_PARAMS_FILE,
};

/// Leveraged trend trader CLI.
#[derive(Parser)]
#[command(name = "levtrader")]
#[command(about = "Charts and risk-sized leveraged orders on OKX and Binance", long_about = None)]
struct Cli {
    /// Exchange to connect to (okx, binance)
    #[arg(short, long, global = true, default_value = "okx")]
    exchange: ExchangeKind,

    /// Trading pair
    #[arg(short, long, global = true, default_value = "BTC/USDT")]
    symbol: String,

    /// Candle timeframe (1m, 3m, 5m, 15m)
    #[arg(short, long, global = true, default_value = "1m")]
    timeframe: Timeframe,

    /// Trade on the live exchange instead of the sandbox
    #[arg(long, global = true)]
    live: bool,

    /// Proxy address, e.g. 127.0.0.1:7890 (defaults to PROXY_HTTP/PROXY_HTTPS)
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Connect directly, ignoring any proxy settings
    #[arg(long, global = true, conflicts_with = "proxy")]
    no_proxy: bool,

    /// Strategy parameter file
    #[arg(long, global = true, default_value = DEFAULT_PARAMS_FILE)]
    params_file: PathBuf,

    /// Trade journal database
    #[arg(short, long, global = true, default_value = "sqlite:./levtrader.db?mode=rwc")]
    database: String,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the ticker and top of book
    Ticker,

    /// Fetch recent candles
    Klines {
        /// Number of candles
        #[arg(short = 'n', long, default_value = "100")]
        limit: usize,

        /// Draw a chart instead of a table
        #[arg(long)]
        chart: bool,
    },

    /// Live chart with interactive commands
    Watch {
        /// Seconds between candle polls
        #[arg(long, default_value = "3")]
        poll: u64,
    },

    /// Place one strategy order
    Trade,

    /// Run the strategy repeatedly and export results to CSV
    Backtest {
        /// Simulated days (24 iterations per day)
        #[arg(long, default_value = "1")]
        days: u32,

        /// Seconds between iterations
        #[arg(long, default_value = "3600")]
        interval: u64,

        /// Directory for the results file
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Show exchange and fund manager balances
    Balance,

    /// Manage the strategy parameter file
    Params {
        #[command(subcommand)]
        action: ParamsAction,
    },

    /// Apply a realised profit or loss to the fund manager
    Pnl {
        /// Profit (positive) or loss (negative)
        #[arg(allow_negative_numbers = true)]
        amount: Decimal,
    },

    /// Show journaled trades
    History {
        /// Number of trades
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum ParamsAction {
    /// Print the stored parameters and the resulting sizing
    Show,

    /// Write parameters, starting from the given balance
    Save {
        #[arg(short, long, default_value = "100")]
        balance: Decimal,
    },

    /// Load and validate the parameter file
    Load,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let mut cli = Cli::parse();
    cli.symbol = cli.symbol.to_uppercase();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let trading = TradingConfig::default();

    match &cli.command {
        Commands::Ticker => {
            let session = open_session(&cli, &trading, None)?;
            let snapshot = session.strategy().get_market_data(&cli.symbol).await?;
            let t = &snapshot.ticker;
            let book = &snapshot.order_book;

            println!("\n=== {} on {} ===", t.symbol, session.config().exchange.kind);
            println!("Last:    {}", t.last);
            println!("Open:    {} ({:.2}%)", t.open, t.change_pct());
            println!("High:    {}", t.high);
            println!("Low:     {}", t.low);
            println!("Volume:  {}", t.volume);
            println!("Trend:   {}", TradingStrategy::trend_of(t));

            println!("\n{:>16} {:>14}   {:<16} {:>14}", "BID", "SIZE", "ASK", "SIZE");
            println!("{}", "-".repeat(64));
            for (bid, ask) in book.bids.iter().zip(book.asks.iter()).take(DEFAULT_BOOK_DEPTH.min(10)) {
                println!("{:>16} {:>14}   {:<16} {:>14}", bid.price, bid.size, ask.price, ask.size);
            }
            if let Some(spread) = book.spread() {
                println!("\nSpread: {}", spread);
            }
        }

        Commands::Klines { limit, chart: draw_chart } => {
            let session = open_session(&cli, &trading, None)?;
            let candles = session
                .strategy()
                .gateway()
                .fetch_ohlcv(&cli.symbol, cli.timeframe, *limit)
                .await
                .with_context(|| format!("Failed to fetch candles for {}", cli.symbol))?;

            if candles.is_empty() {
                anyhow::bail!("No candle data for {} {}", cli.symbol, cli.timeframe);
            }

            if *draw_chart {
                println!("{} {} {}", cli.exchange.as_str().to_uppercase(), cli.symbol, cli.timeframe);
                print!("{}", chart::render_candles(&candles, ChartSize::default()));
            } else {
                println!(
                    "\n{:<17} {:>14} {:>14} {:>14} {:>14} {:>16}",
                    "TIME", "OPEN", "HIGH", "LOW", "CLOSE", "VOLUME"
                );
                println!("{}", "-".repeat(94));
                for c in &candles {
                    let time = c
                        .open_datetime()
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default();
                    println!(
                        "{:<17} {:>14} {:>14} {:>14} {:>14} {:>16}",
                        time, c.open, c.high, c.low, c.close, c.volume
                    );
                }
            }
        }

        Commands::Watch { poll } => {
            let state = load_state(&cli.params_file, &trading)?;
            let mut session = open_session(&cli, &trading, Some(state))?;
            session.set_monitor_template(MonitorConfig {
                poll_interval: Duration::from_secs((*poll).max(1)),
                ..MonitorConfig::new(cli.symbol.clone(), cli.timeframe)
            });
            let journal = open_journal(&cli.database).await;

            let input = console::spawn_stdin_reader();
            let state = Console::new(session, journal, cli.params_file.clone())
                .run(input)
                .await?;

            println!(
                "\nBalance ${:.2}, leverage {}x, {} trade(s) this session",
                state.fund_manager.balance(),
                state.fund_manager.leverage(),
                state.trade_history.len()
            );
        }

        Commands::Trade => {
            let state = load_state(&cli.params_file, &trading)?;
            let mut session = open_session(&cli, &trading, Some(state))?;
            let journal = open_journal(&cli.database).await;

            let trade = session.strategy_mut().execute_strategy(&cli.symbol).await?;

            println!("\n=== Order Placed ===");
            println!("Order ID:    {}", trade.order.id);
            println!("Direction:   {}", trade.record.direction);
            println!("Side:        {}", trade.order.side.as_str());
            println!("Size:        {}", trade.record.size);
            println!("Price:       {}", trade.record.entry_price);
            println!("Liquidation: {}", trade.record.liquidation_price.round_dp(4));
            println!("Status:      {}", trade.order.status);

            if let Some(journal) = journal {
                journal
                    .record_trade(cli.exchange.as_str(), &trade.order.id, &trade.record)
                    .await?;
                journal.close().await;
            }
        }

        Commands::Backtest { days, interval, output } => {
            let state = load_state(&cli.params_file, &trading)?;
            let mut session = open_session(&cli, &trading, Some(state))?;

            let config = BacktestConfig {
                days: *days,
                interval: Duration::from_secs(*interval),
                output_dir: output.clone(),
            };

            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown signal received");
                flag.store(true, Ordering::SeqCst);
            });

            println!("\n=== Backtest ===");
            println!("{} for {} day(s), {} iterations", session.config(), days, config.iterations());
            println!("Press Ctrl+C to stop early\n");

            let report = Backtester::new(config)
                .run(session.strategy_mut(), &cli.symbol, &shutdown)
                .await?;

            println!("{}", report);
            println!("{}", session.strategy().get_performance_report());
        }

        Commands::Balance => {
            let state = load_state(&cli.params_file, &trading)?;
            let session = open_session(&cli, &trading, Some(state))?;

            println!("\n=== Balance ===");
            match session.strategy().gateway().fetch_balance().await {
                Ok(free) => println!("Exchange (free USDT): {}", free),
                Err(e) => println!("Exchange (free USDT): unavailable ({})", e),
            }
            println!("{}", session.strategy().get_performance_report());
        }

        Commands::Params { action } => match action {
            ParamsAction::Show => {
                let fm = load_fund_manager(&cli.params_file, &trading)?;
                let params = fm.get_trade_params(trading.risk_percent)?;
                println!("\n=== Strategy Parameters ({}) ===", cli.params_file.display());
                println!("{}", serde_json::to_string_pretty(&params)?);
            }
            ParamsAction::Save { balance } => {
                let fm = FundManager::new(*balance);
                fm.save_params(&cli.params_file)?;
                println!("Saved balance ${:.2} to {}", balance, cli.params_file.display());
            }
            ParamsAction::Load => {
                let mut fm = FundManager::new(trading.initial_balance);
                if fm.load_params(&cli.params_file)? {
                    println!("Balance:  ${:.2}", fm.balance());
                    println!("Leverage: {}x", fm.leverage());
                } else {
                    println!("No parameter file at {}", cli.params_file.display());
                }
            }
        },

        Commands::Pnl { amount } => {
            let mut fm = load_fund_manager(&cli.params_file, &trading)?;
            let before = fm.get_trade_params(trading.risk_percent)?;

            fm.update_balance(*amount)?;
            fm.save_params(&cli.params_file)?;

            println!("\n=== Balance Update ===");
            println!("Profit:        {}", amount);
            println!("Balance:       ${:.2} -> ${:.2}", before.current_balance, fm.balance());
            println!("Leverage:      {}x -> {}x", before.leverage, fm.leverage());
            println!("Position size: {}", fm.position_size());
        }

        Commands::History { limit } => {
            let journal = TradeJournal::new(&cli.database).await?;
            let trades = journal.recent_trades(*limit).await?;

            if trades.is_empty() {
                println!("No trades recorded. Use 'levtrader trade' to place one.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<8} {:<12} {:<6} {:>12} {:>14} {:>14}",
                "TIME", "EXCHANGE", "SYMBOL", "DIR", "SIZE", "ENTRY", "LIQUIDATION"
            );
            println!("{}", "-".repeat(92));
            for trade in &trades {
                let record = trade.to_record()?;
                println!(
                    "{:<20} {:<8} {:<12} {:<6} {:>12} {:>14} {:>14}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    trade.exchange,
                    truncate(&record.symbol, 12),
                    record.direction,
                    record.size.round_dp(6),
                    record.entry_price,
                    record.liquidation_price.round_dp(4)
                );
            }
            println!("\nTotal trades recorded: {}", journal.trade_count().await?);
            journal.close().await;
        }
    }

    Ok(())
}

fn exchange_config(cli: &Cli) -> ExchangeConfig {
    ExchangeConfig::from_env(cli.exchange, !cli.live, cli.proxy.as_deref(), !cli.no_proxy)
}

fn open_session(cli: &Cli, trading: &TradingConfig, state: Option<StrategyState>) -> Result<Session> {
    let config = SessionConfig {
        exchange: exchange_config(cli),
        symbol: cli.symbol.clone(),
        timeframe: cli.timeframe,
    };
    if config.exchange.credentials.is_none() {
        warn!(exchange = %cli.exchange, "No API credentials configured, order entry disabled");
    }
    Session::open(config, trading.clone(), state)
}

fn load_fund_manager(path: &Path, trading: &TradingConfig) -> Result<FundManager> {
    let mut fm = FundManager::new(trading.initial_balance);
    fm.load_params(path)?;
    Ok(fm)
}

fn load_state(path: &Path, trading: &TradingConfig) -> Result<StrategyState> {
    Ok(StrategyState {
        fund_manager: load_fund_manager(path, trading)?,
        trade_history: Vec::new(),
    })
}

/// The journal is optional for trading; failures are logged and ignored.
async fn open_journal(url: &str) -> Option<TradeJournal> {
    match TradeJournal::new(url).await {
        Ok(journal) => Some(journal),
        Err(e) => {
            warn!(error = %e, "Trade journal unavailable, trades will not be recorded");
            None
        }
    }
}

/// Truncate string for display.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
