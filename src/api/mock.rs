//! Scripted in-memory gateway for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::models::{BookLevel, Candle, Order, OrderBook, OrderRequest, Ticker, Timeframe};

use super::{ExchangeGateway, GatewayError};

pub(crate) struct MockGateway {
    last: Mutex<Decimal>,
    open: Decimal,
    ohlcv_script: Mutex<VecDeque<Result<Vec<Candle>, GatewayError>>>,
    steady_candles: Mutex<Vec<Candle>>,
    order_script: Mutex<VecDeque<Result<(), GatewayError>>>,
    placed: Mutex<Vec<OrderRequest>>,
    order_calls: AtomicU32,
    ohlcv_calls: AtomicU32,
}

impl MockGateway {
    pub fn new(last: Decimal, open: Decimal) -> Self {
        Self {
            last: Mutex::new(last),
            open,
            ohlcv_script: Mutex::new(VecDeque::new()),
            steady_candles: Mutex::new(Self::candles(&[1_000])),
            order_script: Mutex::new(VecDeque::new()),
            placed: Mutex::new(Vec::new()),
            order_calls: AtomicU32::new(0),
            ohlcv_calls: AtomicU32::new(0),
        }
    }

    /// Candles with the given open times and a flat price of 100.
    pub fn candles(open_times: &[i64]) -> Vec<Candle> {
        open_times
            .iter()
            .map(|&t| Candle {
                open_time: t,
                open: Decimal::ONE_HUNDRED,
                high: Decimal::ONE_HUNDRED,
                low: Decimal::ONE_HUNDRED,
                close: Decimal::ONE_HUNDRED,
                volume: Decimal::ONE,
            })
            .collect()
    }

    pub fn set_last(&self, last: Decimal) {
        *self.last.lock().unwrap() = last;
    }

    /// Results returned by successive `fetch_ohlcv` calls. Once the script
    /// runs out, every call returns the last successful candle set.
    pub fn script_ohlcv(&self, results: Vec<Result<Vec<Candle>, GatewayError>>) {
        self.ohlcv_script.lock().unwrap().extend(results);
    }

    /// Results of successive `create_order` calls; success once exhausted.
    pub fn script_orders(&self, results: Vec<Result<(), GatewayError>>) {
        self.order_script.lock().unwrap().extend(results);
    }

    pub fn order_calls(&self) -> u32 {
        self.order_calls.load(Ordering::SeqCst)
    }

    pub fn ohlcv_calls(&self) -> u32 {
        self.ohlcv_calls.load(Ordering::SeqCst)
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        let last = *self.last.lock().unwrap();
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            open: self.open,
            high: last.max(self.open),
            low: last.min(self.open),
            volume: Decimal::TEN,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_order_book(&self, symbol: &str, _depth: usize) -> Result<OrderBook, GatewayError> {
        let last = *self.last.lock().unwrap();
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: vec![BookLevel { price: last - Decimal::ONE, size: Decimal::ONE }],
            asks: vec![BookLevel { price: last + Decimal::ONE, size: Decimal::ONE }],
            timestamp: Utc::now(),
        })
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        self.ohlcv_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.ohlcv_script.lock().unwrap().pop_front();
        match next {
            Some(Ok(candles)) => {
                *self.steady_candles.lock().unwrap() = candles.clone();
                Ok(candles)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.steady_candles.lock().unwrap().clone()),
        }
    }

    async fn fetch_balance(&self) -> Result<Decimal, GatewayError> {
        Ok(Decimal::ONE_THOUSAND)
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        let n = self.order_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(Err(e)) = self.order_script.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.placed.lock().unwrap().push(request.clone());

        Ok(Order {
            id: format!("mock-{}", n),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            price: request.price.unwrap_or_default(),
            amount: request.amount,
            filled: request.amount,
            status: "filled".to_string(),
        })
    }
}
