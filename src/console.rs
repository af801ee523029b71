//! Interactive watch console.
//!
//! Redraws the chart on every monitor update and reads one command per
//! stdin line. Anything that changes the exchange, proxy, mode, symbol or
//! timeframe goes through `Session::reconfigure`.

use std::io::BufRead;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::{ExchangeKind, ProxyConfig};
use crate::chart::{self, ChartSize};
use crate::db::TradeJournal;
use crate::models::Timeframe;
use crate::monitor::MonitorEvent;
use crate::session::{Session, SessionConfig};
use crate::trading::StrategyState;

const CLEAR_SCREEN: &str = "\x1B[2J\x1B[H";

const HELP: &str = "\
Commands:
  start                 start the live chart
  stop                  stop the live chart
  symbol <SYMBOL>       switch symbol, e.g. symbol ETH/USDT
  timeframe <TF>        switch timeframe (1m, 3m, 5m, 15m)
  exchange <NAME>       switch exchange (okx, binance)
  proxy <ADDR|off>      route through a proxy, or disable it
  live <on|off>         live trading (on) or sandbox (off)
  balance <AMOUNT>      override the fund manager balance
  trade                 place one strategy order
  save                  save strategy parameters
  load                  load strategy parameters
  market                show ticker and top of book
  help                  show this help
  quit                  exit";

/// One line of console input.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Symbol(String),
    Timeframe(Timeframe),
    Exchange(ExchangeKind),
    /// `None` disables the proxy
    Proxy(Option<String>),
    Live(bool),
    Balance(Decimal),
    Trade,
    Save,
    Load,
    Market,
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default().to_lowercase();
        let arg = parts.next();

        let required = |name: &str| arg.with_context(|| format!("'{}' needs an argument, see 'help'", name));
        let switch = |name: &str| -> Result<bool> {
            match required(name)?.to_lowercase().as_str() {
                "on" | "true" | "1" => Ok(true),
                "off" | "false" | "0" => Ok(false),
                other => anyhow::bail!("Expected on or off, got '{}'", other),
            }
        };

        let parsed = match command.as_str() {
            "start" => ConsoleCommand::Start,
            "stop" => ConsoleCommand::Stop,
            "symbol" => ConsoleCommand::Symbol(required("symbol")?.to_uppercase()),
            "timeframe" | "tf" => ConsoleCommand::Timeframe(required("timeframe")?.parse()?),
            "exchange" => ConsoleCommand::Exchange(required("exchange")?.parse()?),
            "proxy" => match required("proxy")? {
                off if off.eq_ignore_ascii_case("off") || off.eq_ignore_ascii_case("none") => {
                    ConsoleCommand::Proxy(None)
                }
                address => ConsoleCommand::Proxy(Some(address.to_string())),
            },
            "live" => ConsoleCommand::Live(switch("live")?),
            "balance" => {
                let value = required("balance")?;
                ConsoleCommand::Balance(
                    Decimal::from_str(value).with_context(|| format!("Invalid balance '{}'", value))?,
                )
            }
            "trade" => ConsoleCommand::Trade,
            "save" => ConsoleCommand::Save,
            "load" => ConsoleCommand::Load,
            "market" => ConsoleCommand::Market,
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            "" => anyhow::bail!("Empty command"),
            other => anyhow::bail!("Unknown command '{}', see 'help'", other),
        };
        Ok(parsed)
    }
}

/// Forward lines from `reader` over a channel, read on a plain OS thread.
///
/// A blocking read cannot be cancelled, so it must not live on the tokio
/// blocking pool: the runtime would wait for it on shutdown. The thread
/// ends at end of input, on a read error, or once the receiver is dropped.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to read console input");
                        break;
                    }
                };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            debug!("Console input reader exited");
        });

    // The sender moved into the closure is dropped with it, so the receiver
    // reports end of input
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start console input thread");
    }
    rx
}

pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    spawn_line_reader(std::io::BufReader::new(std::io::stdin()))
}

pub struct Console {
    session: Session,
    journal: Option<TradeJournal>,
    params_path: PathBuf,
    chart_size: ChartSize,
    events: Option<mpsc::Receiver<MonitorEvent>>,
}

impl Console {
    pub fn new(session: Session, journal: Option<TradeJournal>, params_path: PathBuf) -> Self {
        Self {
            session,
            journal,
            params_path,
            chart_size: ChartSize::default(),
            events: None,
        }
    }

    /// Run until `quit`, end of input or Ctrl+C, reading commands from
    /// `input`. Returns the account state.
    pub async fn run(mut self, mut input: mpsc::Receiver<String>) -> Result<StrategyState> {
        println!("{}\n", HELP);
        self.events = Some(self.session.start_monitor().await);

        loop {
            tokio::select! {
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_event(event),
                    None => self.events = None,
                },
                line = input.recv() => {
                    let Some(line) = line else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<ConsoleCommand>() {
                        Ok(ConsoleCommand::Quit) => break,
                        Ok(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                println!("Error: {:#}", e);
                            }
                        }
                        Err(e) => println!("{}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let state = self.session.close().await;
        if let Some(journal) = &self.journal {
            journal.close().await;
        }
        Ok(state)
    }

    fn handle_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::Update(update) => match chart::render(&update, self.chart_size) {
                Ok(rendered) => {
                    let fm = self.session.strategy().fund_manager();
                    print!("{}{}", CLEAR_SCREEN, rendered);
                    println!(
                        "balance ${:.2} | leverage {}x | {}",
                        fm.balance(),
                        fm.leverage(),
                        self.session.config()
                    );
                }
                // Keep the previous chart on screen
                Err(e) => println!("Chart error: {}", e),
            },
            MonitorEvent::FetchFailed {
                message,
                attempt,
                max_attempts,
            } => {
                println!("Fetch failed: {} (retry {}/{})", message, attempt, max_attempts);
            }
            MonitorEvent::Halted { message } => {
                println!("{}. Type 'start' to resume.", message);
                self.events = None;
            }
        }
    }

    async fn handle_command(&mut self, command: ConsoleCommand) -> Result<()> {
        let current = self.session.config().clone();

        match command {
            ConsoleCommand::Start => {
                if self.session.monitor_running() {
                    println!("Monitor already running");
                } else {
                    self.events = Some(self.session.start_monitor().await);
                    println!("Monitor started");
                }
            }
            ConsoleCommand::Stop => {
                self.session.stop_monitor().await;
                self.events = None;
                println!("Monitor stopped");
            }
            ConsoleCommand::Symbol(symbol) => self.switch(current.with_symbol(symbol)).await?,
            ConsoleCommand::Timeframe(timeframe) => self.switch(current.with_timeframe(timeframe)).await?,
            ConsoleCommand::Exchange(kind) => {
                let exchange = current.exchange.with_kind(kind);
                if exchange.credentials.is_none() {
                    println!("No API credentials for {}, market data only", kind);
                }
                self.switch(current.with_exchange(exchange)).await?
            }
            ConsoleCommand::Proxy(address) => {
                let proxy = address.as_deref().map(ProxyConfig::from_address);
                self.switch(current.with_exchange(current.exchange.with_proxy(proxy))).await?
            }
            ConsoleCommand::Live(live) => {
                if live {
                    warn!("Switching to live trading");
                    println!("LIVE trading enabled: orders use real funds");
                }
                self.switch(current.with_exchange(current.exchange.with_simulated(!live))).await?
            }
            ConsoleCommand::Balance(balance) => {
                self.session.strategy_mut().fund_manager_mut().set_balance(balance);
                println!("Balance set to ${:.2}", balance);
            }
            ConsoleCommand::Trade => {
                let trade = self.session.strategy_mut().execute_strategy(&current.symbol).await?;
                println!(
                    "{} {} {} @ {} (liquidation {}) order {}",
                    trade.record.direction,
                    trade.record.size,
                    trade.record.symbol,
                    trade.record.entry_price,
                    trade.record.liquidation_price.round_dp(4),
                    trade.order.id
                );
                if let Some(journal) = &self.journal {
                    journal
                        .record_trade(current.exchange.kind.as_str(), &trade.order.id, &trade.record)
                        .await?;
                }
            }
            ConsoleCommand::Save => {
                self.session.strategy().fund_manager().save_params(&self.params_path)?;
                println!("Parameters saved to {}", self.params_path.display());
            }
            ConsoleCommand::Load => {
                let fm = self.session.strategy_mut().fund_manager_mut();
                if fm.load_params(&self.params_path)? {
                    println!("Loaded balance ${:.2}, leverage {}x", fm.balance(), fm.leverage());
                } else {
                    println!("No parameter file at {}", self.params_path.display());
                }
            }
            ConsoleCommand::Market => {
                let snapshot = self.session.strategy().get_market_data(&current.symbol).await?;
                let t = &snapshot.ticker;
                println!(
                    "{} last {} open {} ({:.2}%) high {} low {} vol {}",
                    t.symbol,
                    t.last,
                    t.open,
                    t.change_pct(),
                    t.high,
                    t.low,
                    t.volume
                );
                let book = &snapshot.order_book;
                if let (Some(bid), Some(ask), Some(spread)) = (book.best_bid(), book.best_ask(), book.spread()) {
                    println!("bid {} | ask {} | spread {}", bid, ask, spread);
                }
                println!("{}", self.session.strategy().get_performance_report());
            }
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }

    /// Rebuild the session and restart the chart if it was running. A bad
    /// configuration leaves the current session and chart alone.
    async fn switch(&mut self, config: SessionConfig) -> Result<()> {
        let was_running = self.session.monitor_running();
        self.session.reconfigure(config).await?;
        self.events = None;

        println!("Now on {}", self.session.config());
        if was_running {
            self.events = Some(self.session.start_monitor().await);
        }
        Ok(())
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<MonitorEvent>>) -> Option<MonitorEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockGateway;
    use crate::api::{ExchangeConfig, ExchangeGateway, GatewayError};
    use crate::monitor::MonitorConfig;
    use crate::trading::TradingConfig;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn mock_connect(_: &ExchangeConfig) -> Result<Arc<dyn ExchangeGateway>, GatewayError> {
        Ok(Arc::new(MockGateway::new(dec!(1), dec!(1))))
    }

    fn console() -> Console {
        let config = SessionConfig {
            exchange: ExchangeConfig {
                kind: ExchangeKind::Okx,
                credentials: None,
                simulated: true,
                proxy: None,
            },
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::OneMinute,
        };
        let gateway = Arc::new(MockGateway::new(dec!(110), dec!(100)));
        let mut session = Session::with_gateway(config, gateway, TradingConfig::default(), None);
        session.set_connector(mock_connect);
        session.set_monitor_template(MonitorConfig {
            poll_interval: Duration::from_millis(5),
            ..MonitorConfig::new("", Timeframe::OneMinute)
        });
        Console::new(session, None, PathBuf::from("unused_params.json"))
    }

    fn parse(line: &str) -> ConsoleCommand {
        line.parse().unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("start"), ConsoleCommand::Start);
        assert_eq!(parse("  STOP "), ConsoleCommand::Stop);
        assert_eq!(parse("symbol eth/usdt"), ConsoleCommand::Symbol("ETH/USDT".to_string()));
        assert_eq!(parse("timeframe 15m"), ConsoleCommand::Timeframe(Timeframe::FifteenMinutes));
        assert_eq!(parse("exchange binance"), ConsoleCommand::Exchange(ExchangeKind::Binance));
        assert_eq!(parse("balance 250.5"), ConsoleCommand::Balance(dec!(250.5)));
        assert_eq!(parse("q"), ConsoleCommand::Quit);
    }

    #[test]
    fn test_parse_proxy_and_live() {
        assert_eq!(
            parse("proxy 127.0.0.1:7890"),
            ConsoleCommand::Proxy(Some("127.0.0.1:7890".to_string()))
        );
        assert_eq!(parse("proxy off"), ConsoleCommand::Proxy(None));
        assert_eq!(parse("live on"), ConsoleCommand::Live(true));
        assert_eq!(parse("live OFF"), ConsoleCommand::Live(false));
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<ConsoleCommand>().is_err());
        assert!("symbol".parse::<ConsoleCommand>().is_err());
        assert!("timeframe 2h".parse::<ConsoleCommand>().is_err());
        assert!("balance lots".parse::<ConsoleCommand>().is_err());
        assert!("live maybe".parse::<ConsoleCommand>().is_err());
        assert!("dance".parse::<ConsoleCommand>().is_err());
    }

    #[tokio::test]
    async fn test_switch_restarts_running_monitor() {
        let mut console = console();
        console.events = Some(console.session.start_monitor().await);

        let next = console.session.config().with_timeframe(Timeframe::FiveMinutes);
        console.switch(next).await.unwrap();

        assert!(console.session.monitor_running());
        assert_eq!(console.session.config().timeframe, Timeframe::FiveMinutes);
        match next_event(&mut console.events).await {
            Some(MonitorEvent::Update(update)) => assert_eq!(update.timeframe, Timeframe::FiveMinutes),
            other => panic!("expected update, got {:?}", other),
        }

        console.session.close().await;
    }

    #[tokio::test]
    async fn test_switch_keeps_stopped_monitor_stopped() {
        let mut console = console();

        let next = console.session.config().with_symbol("ETH/USDT");
        console.switch(next).await.unwrap();

        assert!(!console.session.monitor_running());
        assert!(console.events.is_none());
        assert_eq!(console.session.config().symbol, "ETH/USDT");
    }

    #[tokio::test]
    async fn test_bad_proxy_leaves_session_untouched() {
        let mut console = console();
        console.session.set_connector(crate::api::connect);
        console.events = Some(console.session.start_monitor().await);

        let current = console.session.config().clone();
        let bad = current.with_exchange(current.exchange.with_proxy(Some(ProxyConfig {
            http: Some("not a url".to_string()),
            https: None,
        })));

        assert!(console.switch(bad).await.is_err());
        assert_eq!(console.session.strategy().gateway().name(), "mock");
        assert!(console.session.monitor_running());
        assert!(console.events.is_some());

        console.session.close().await;
    }

    #[test]
    fn test_line_reader_forwards_lines_then_closes() {
        let mut rx = spawn_line_reader(std::io::Cursor::new("start\nsymbol eth/usdt\n"));

        assert_eq!(rx.blocking_recv().as_deref(), Some("start"));
        assert_eq!(rx.blocking_recv().as_deref(), Some("symbol eth/usdt"));
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn test_quit_does_not_wait_for_pending_input() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();

        // Sender stays open: no end of input, nothing further to read
        let (tx, rx) = mpsc::channel(4);
        let state = runtime
            .block_on(async {
                tx.send("quit".to_string()).await.unwrap();
                console().run(rx).await
            })
            .unwrap();
        assert!(state.trade_history.is_empty());

        let started = Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(tx);
    }

    #[tokio::test]
    async fn test_end_of_input_closes_console() {
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(tx);

        let state = tokio::time::timeout(Duration::from_secs(2), console().run(rx))
            .await
            .expect("console did not exit")
            .unwrap();
        assert_eq!(state.fund_manager.leverage(), 1);
    }
}
