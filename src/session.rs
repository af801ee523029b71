//! One exchange connection, symbol and timeframe, plus the strategy and
//! monitor bound to them.
//!
//! A session is never edited in place. Switching exchange, proxy, mode,
//! symbol or timeframe builds a new gateway and strategy from a new
//! `SessionConfig`; only the fund manager and trade history carry over.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

use crate::api::{self, ExchangeConfig, ExchangeGateway, GatewayError};
use crate::models::Timeframe;
use crate::monitor::{MarketMonitor, MonitorConfig, MonitorEvent};
use crate::trading::{StrategyState, TradingConfig, TradingStrategy};

/// Immutable session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub exchange: ExchangeConfig,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SessionConfig {
    pub fn with_symbol(&self, symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..self.clone()
        }
    }

    pub fn with_timeframe(&self, timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            ..self.clone()
        }
    }

    pub fn with_exchange(&self, exchange: ExchangeConfig) -> Self {
        Self {
            exchange,
            ..self.clone()
        }
    }
}

impl fmt::Display for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} [{}]",
            self.exchange.kind,
            self.symbol,
            self.timeframe,
            if self.exchange.simulated { "sandbox" } else { "live" }
        )?;
        if let Some(proxy) = &self.exchange.proxy {
            write!(f, " via {}", proxy)?;
        }
        Ok(())
    }
}

type Connector = fn(&ExchangeConfig) -> Result<Arc<dyn ExchangeGateway>, GatewayError>;

pub struct Session {
    config: SessionConfig,
    connector: Connector,
    strategy: TradingStrategy,
    monitor: Option<MarketMonitor>,
    monitor_template: Option<MonitorConfig>,
}

impl Session {
    /// Connect to the configured exchange. `state` carries an existing fund
    /// manager and history; `None` starts from `trading.initial_balance`.
    pub fn open(config: SessionConfig, trading: TradingConfig, state: Option<StrategyState>) -> Result<Self> {
        let gateway = api::connect(&config.exchange)
            .with_context(|| format!("Failed to connect to {}", config.exchange.kind))?;
        Ok(Self::with_gateway(config, gateway, trading, state))
    }

    pub(crate) fn with_gateway(
        config: SessionConfig,
        gateway: Arc<dyn ExchangeGateway>,
        trading: TradingConfig,
        state: Option<StrategyState>,
    ) -> Self {
        let strategy = match state {
            Some(state) => TradingStrategy::from_state(gateway, trading, state),
            None => TradingStrategy::new(gateway, trading),
        };

        info!(session = %config, "Session opened");
        Self {
            config,
            connector: api::connect,
            strategy,
            monitor: None,
            monitor_template: None,
        }
    }

    /// Poll interval and failure limit for monitors started by this
    /// session. Symbol and timeframe always come from the session config.
    pub fn set_monitor_template(&mut self, template: MonitorConfig) {
        self.monitor_template = Some(template);
    }

    #[cfg(test)]
    pub(crate) fn set_connector(&mut self, connector: Connector) {
        self.connector = connector;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn strategy(&self) -> &TradingStrategy {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut TradingStrategy {
        &mut self.strategy
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| m.is_running())
    }

    /// Start a monitor for this session's symbol and timeframe, replacing
    /// any running one.
    pub async fn start_monitor(&mut self) -> mpsc::Receiver<MonitorEvent> {
        self.stop_monitor().await;

        let config = match &self.monitor_template {
            Some(template) => MonitorConfig {
                symbol: self.config.symbol.clone(),
                timeframe: self.config.timeframe,
                ..template.clone()
            },
            None => MonitorConfig::new(self.config.symbol.clone(), self.config.timeframe),
        };

        let (monitor, rx) = MarketMonitor::spawn(self.strategy.gateway().clone(), config);
        self.monitor = Some(monitor);
        rx
    }

    pub async fn stop_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop().await;
        }
    }

    /// Replace this session with one built from `config`.
    ///
    /// The new gateway is built before anything is torn down, so a bad
    /// configuration leaves the current session untouched. The monitor is
    /// stopped and not restarted.
    pub async fn reconfigure(&mut self, config: SessionConfig) -> Result<()> {
        let gateway = (self.connector)(&config.exchange)
            .with_context(|| format!("Failed to connect to {}", config.exchange.kind))?;
        self.replace_gateway(config, gateway).await;
        Ok(())
    }

    pub(crate) async fn replace_gateway(&mut self, config: SessionConfig, gateway: Arc<dyn ExchangeGateway>) {
        self.stop_monitor().await;

        let trading = self.strategy.config().clone();
        let state = self.strategy.snapshot_state();
        info!(from = %self.config, to = %config, "Reconfiguring session");

        self.strategy = TradingStrategy::from_state(gateway, trading, state);
        self.config = config;
    }

    /// Stop the monitor and hand back the account state.
    pub async fn close(mut self) -> StrategyState {
        self.stop_monitor().await;
        info!(session = %self.config, "Session closed");
        self.strategy.into_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockGateway;
    use crate::api::ExchangeKind;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn session_config() -> SessionConfig {
        SessionConfig {
            exchange: ExchangeConfig {
                kind: ExchangeKind::Okx,
                credentials: None,
                simulated: true,
                proxy: None,
            },
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::OneMinute,
        }
    }

    fn mock_session() -> Session {
        let gateway = Arc::new(MockGateway::new(dec!(110), dec!(100)));
        let mut session = Session::with_gateway(session_config(), gateway, TradingConfig::default(), None);
        session.set_monitor_template(MonitorConfig {
            poll_interval: Duration::from_millis(5),
            ..MonitorConfig::new("", Timeframe::OneMinute)
        });
        session
    }

    #[tokio::test]
    async fn test_replace_gateway_carries_account_state() {
        let mut session = mock_session();
        session.strategy_mut().execute_strategy("BTC/USDT").await.unwrap();
        session.strategy_mut().fund_manager_mut().update_balance(dec!(60)).unwrap();

        let next = session_config().with_symbol("ETH/USDT");
        session
            .replace_gateway(next, Arc::new(MockGateway::new(dec!(1), dec!(2))))
            .await;

        assert_eq!(session.config().symbol, "ETH/USDT");
        assert_eq!(session.strategy().trade_history().len(), 1);
        assert_eq!(session.strategy().fund_manager().balance(), dec!(160));
        assert_eq!(session.strategy().fund_manager().leverage(), 2);
    }

    #[tokio::test]
    async fn test_replace_gateway_stops_monitor() {
        let mut session = mock_session();
        let mut rx = session.start_monitor().await;
        assert!(matches!(rx.recv().await, Some(MonitorEvent::Update(_))));
        assert!(session.monitor_running());

        let next = session_config().with_timeframe(Timeframe::FiveMinutes);
        session
            .replace_gateway(next, Arc::new(MockGateway::new(dec!(1), dec!(1))))
            .await;

        assert!(!session.monitor_running());
        // Old task dropped its sender
        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_monitor_follows_session_timeframe() {
        let mut session = mock_session();
        session
            .replace_gateway(
                session_config().with_timeframe(Timeframe::FifteenMinutes),
                Arc::new(MockGateway::new(dec!(1), dec!(1))),
            )
            .await;

        let mut rx = session.start_monitor().await;
        match rx.recv().await {
            Some(MonitorEvent::Update(update)) => {
                assert_eq!(update.timeframe, Timeframe::FifteenMinutes);
                assert_eq!(update.symbol, "BTC/USDT");
            }
            other => panic!("expected update, got {:?}", other),
        }

        let state = session.close().await;
        assert!(state.trade_history.is_empty());
    }

    #[tokio::test]
    async fn test_bad_proxy_leaves_session_untouched() {
        let mut session = mock_session();
        let bad = session_config().with_exchange(session_config().exchange.with_proxy(Some(
            crate::api::ProxyConfig {
                http: Some("not a url".to_string()),
                https: None,
            },
        )));

        assert!(session.reconfigure(bad).await.is_err());
        assert_eq!(session.strategy().gateway().name(), "mock");
    }

    #[test]
    fn test_config_display() {
        let config = session_config();
        assert_eq!(config.to_string(), "okx BTC/USDT 1m [sandbox]");
    }
}
