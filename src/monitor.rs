//! Background candle polling for the live chart.
//!
//! A monitor owns one tokio task bound to a single symbol and timeframe.
//! Changing either means stopping it and spawning a new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ExchangeGateway, DEFAULT_OHLCV_LIMIT};
use crate::models::{Candle, Timeframe};

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub symbol: String,
    pub timeframe: Timeframe,

    /// Wait between polls
    pub poll_interval: Duration,

    /// Consecutive failed fetches before the monitor halts
    pub max_consecutive_failures: u32,

    /// Candles requested per poll
    pub candle_limit: usize,

    /// Event channel capacity
    pub channel_capacity: usize,
}

impl MonitorConfig {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            poll_interval: Duration::from_secs(3),
            max_consecutive_failures: 3,
            candle_limit: DEFAULT_OHLCV_LIMIT,
            channel_capacity: 32,
        }
    }
}

/// A fresh candle set for the chart.
#[derive(Debug, Clone)]
pub struct ChartUpdate {
    pub exchange: &'static str,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
    pub updated_at: DateTime<Utc>,
}

impl ChartUpdate {
    /// `EXCHANGE SYMBOL TIMEFRAME (updated: HH:MM:SS)` in local time.
    pub fn title(&self) -> String {
        format!(
            "{} {} {} (updated: {})",
            self.exchange.to_uppercase(),
            self.symbol,
            self.timeframe,
            self.updated_at.with_timezone(&Local).format("%H:%M:%S")
        )
    }
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Update(ChartUpdate),
    FetchFailed {
        message: String,
        attempt: u32,
        max_attempts: u32,
    },
    /// Too many consecutive failures; the task has exited.
    Halted { message: String },
}

/// Handle to a running poll task.
pub struct MarketMonitor {
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
    config: MonitorConfig,
}

impl MarketMonitor {
    /// Start polling. Events arrive on the returned receiver until the
    /// monitor stops or halts.
    pub fn spawn(
        gateway: Arc<dyn ExchangeGateway>,
        config: MonitorConfig,
    ) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());

        info!(
            exchange = gateway.name(),
            symbol = %config.symbol,
            timeframe = %config.timeframe,
            poll_ms = config.poll_interval.as_millis() as u64,
            "Starting market monitor"
        );

        let handle = tokio::spawn(poll_loop(
            gateway,
            config.clone(),
            tx,
            running.clone(),
            wake.clone(),
        ));

        let monitor = Self {
            running,
            wake,
            handle: Some(handle),
            config,
        };
        (monitor, rx)
    }

    /// False once stopped or halted.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the task, wake it if sleeping, and wait for it to exit.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Market monitor task panicked");
            }
            info!(symbol = %self.config.symbol, "Market monitor stopped");
        }
    }
}

impl Drop for MarketMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

async fn poll_loop(
    gateway: Arc<dyn ExchangeGateway>,
    config: MonitorConfig,
    tx: mpsc::Sender<MonitorEvent>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    // Open time of the newest candle last sent; outer None means nothing sent yet
    let mut last_sent: Option<Option<i64>> = None;
    let mut failures: u32 = 0;

    while running.load(Ordering::SeqCst) {
        let fetched = tokio::select! {
            r = gateway.fetch_ohlcv(&config.symbol, config.timeframe, config.candle_limit) => r,
            _ = wake.notified() => break,
        };

        let event = match fetched {
            Ok(candles) => {
                failures = 0;
                let newest = candles.last().map(|c| c.open_time);
                if last_sent == Some(newest) {
                    debug!(symbol = %config.symbol, "No new candle");
                    None
                } else {
                    last_sent = Some(newest);
                    Some(MonitorEvent::Update(ChartUpdate {
                        exchange: gateway.name(),
                        symbol: config.symbol.clone(),
                        timeframe: config.timeframe,
                        candles,
                        updated_at: Utc::now(),
                    }))
                }
            }
            Err(e) => {
                failures += 1;
                warn!(
                    symbol = %config.symbol,
                    attempt = failures,
                    max = config.max_consecutive_failures,
                    error = %e,
                    "Candle fetch failed"
                );
                Some(MonitorEvent::FetchFailed {
                    message: e.to_string(),
                    attempt: failures,
                    max_attempts: config.max_consecutive_failures,
                })
            }
        };

        if let Some(event) = event {
            if !emit(&tx, &wake, event).await {
                break;
            }
        }

        if failures >= config.max_consecutive_failures.max(1) {
            let message = format!("{} consecutive fetch failures, monitor halted", failures);
            error!(symbol = %config.symbol, "{}", message);
            emit(&tx, &wake, MonitorEvent::Halted { message }).await;
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = wake.notified() => break,
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!(symbol = %config.symbol, "Market monitor task exited");
}

/// Send unless the receiver is gone or a stop arrives while the channel is full.
async fn emit(tx: &mpsc::Sender<MonitorEvent>, wake: &Notify, event: MonitorEvent) -> bool {
    tokio::select! {
        r = tx.send(event) => r.is_ok(),
        _ = wake.notified() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockGateway;
    use crate::api::GatewayError;
    use rust_decimal_macros::dec;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(5),
            ..MonitorConfig::new("BTC/USDT", Timeframe::OneMinute)
        }
    }

    fn network_error() -> Result<Vec<Candle>, GatewayError> {
        Err(GatewayError::Network("timeout".to_string()))
    }

    async fn next(rx: &mut mpsc::Receiver<MonitorEvent>) -> Option<MonitorEvent> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn drain(rx: &mut mpsc::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_poll_emits_then_only_on_new_candle() {
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(100)));
        gateway.script_ohlcv(vec![
            Ok(MockGateway::candles(&[1_000, 2_000])),
            Ok(MockGateway::candles(&[1_000, 2_000])),
            Ok(MockGateway::candles(&[2_000, 3_000])),
        ]);

        let (mut monitor, mut rx) = MarketMonitor::spawn(gateway.clone(), fast_config());

        match next(&mut rx).await {
            Some(MonitorEvent::Update(u)) => assert_eq!(u.candles.last().unwrap().open_time, 2_000),
            other => panic!("expected update, got {:?}", other),
        }
        match next(&mut rx).await {
            Some(MonitorEvent::Update(u)) => assert_eq!(u.candles.last().unwrap().open_time, 3_000),
            other => panic!("expected update, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(40)).await;
        monitor.stop().await;

        assert!(gateway.ohlcv_calls() > 3);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_halts_after_three_consecutive_failures() {
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(100)));
        gateway.script_ohlcv(vec![network_error(), network_error(), network_error()]);

        let (monitor, mut rx) = MarketMonitor::spawn(gateway.clone(), fast_config());

        for expected in 1..=3 {
            match next(&mut rx).await {
                Some(MonitorEvent::FetchFailed { attempt, .. }) => assert_eq!(attempt, expected),
                other => panic!("expected failure, got {:?}", other),
            }
        }
        assert!(matches!(next(&mut rx).await, Some(MonitorEvent::Halted { .. })));

        // Task has exited and dropped its sender
        assert!(next(&mut rx).await.is_none());
        assert!(!monitor.is_running());
        assert_eq!(gateway.ohlcv_calls(), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(100)));
        gateway.script_ohlcv(vec![
            network_error(),
            network_error(),
            Ok(MockGateway::candles(&[5_000])),
            network_error(),
            network_error(),
        ]);

        let (mut monitor, mut rx) = MarketMonitor::spawn(gateway, fast_config());

        let mut attempts = Vec::new();
        let mut updates = 0;
        for _ in 0..5 {
            match next(&mut rx).await {
                Some(MonitorEvent::FetchFailed { attempt, .. }) => attempts.push(attempt),
                Some(MonitorEvent::Update(_)) => updates += 1,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(attempts, vec![1, 2, 1, 2]);
        assert_eq!(updates, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(monitor.is_running());
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_stop_wakes_sleeping_task() {
        let gateway = Arc::new(MockGateway::new(dec!(100), dec!(100)));
        let config = MonitorConfig::new("BTC/USDT", Timeframe::FiveMinutes);

        let (mut monitor, mut rx) = MarketMonitor::spawn(gateway, config);
        assert!(matches!(next(&mut rx).await, Some(MonitorEvent::Update(_))));

        // Default interval is 3s; stop must not wait it out
        tokio::time::timeout(Duration::from_millis(500), monitor.stop())
            .await
            .expect("stop timed out");
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_title_format() {
        let update = ChartUpdate {
            exchange: "okx",
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::FifteenMinutes,
            candles: Vec::new(),
            updated_at: Utc::now(),
        };
        let title = update.title();
        assert!(title.starts_with("OKX BTC/USDT 15m (updated: "));
        assert!(title.ends_with(')'));
    }
}
