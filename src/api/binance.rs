//! Binance spot REST client.
//!
//! Signed endpoints append `timestamp`, `recvWindow` and a hex
//! HMAC-SHA256 `signature` of the query string. Sandbox mode talks to the
//! spot testnet.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::models::{
    BookLevel, Candle, Order, OrderBook, OrderKind, OrderRequest, OrderSide, Ticker, Timeframe,
};

use super::{parse_decimal, split_symbol, Credentials, ExchangeConfig, ExchangeGateway, GatewayError};

const BINANCE_API_BASE: &str = "https://api.binance.com";
const BINANCE_TESTNET_BASE: &str = "https://testnet.binance.vision";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_WINDOW_MS: u64 = 5000;
const MAX_KLINES: usize = 1000;

/// Depth limits accepted by `/api/v3/depth`.
const DEPTH_LIMITS: [usize; 8] = [5, 10, 20, 50, 100, 500, 1000, 5000];

/// Client for the Binance spot API.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    last_price: String,
    open_price: String,
    high_price: String,
    low_price: String,
    volume: String,
    close_time: i64,
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    client_order_id: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    orig_qty: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    status: String,
}

impl BinanceClient {
    /// Create a client from an exchange configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self, GatewayError> {
        let base = if config.simulated {
            BINANCE_TESTNET_BASE
        } else {
            BINANCE_API_BASE
        };
        Self::with_base_url(config, base.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(config: &ExchangeConfig, base_url: String) -> Result<Self, GatewayError> {
        let mut builder = Client::builder().timeout(DEFAULT_TIMEOUT);
        if let Some(proxy) = &config.proxy {
            builder = proxy.apply(builder)?;
        }
        let http = builder.build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
        })
    }

    /// Binance market id for a unified symbol (`BTC/USDT` -> `BTCUSDT`).
    pub fn market_id(symbol: &str) -> Result<String, GatewayError> {
        let (base, quote) = split_symbol(symbol)?;
        Ok(format!("{}{}", base, quote).to_uppercase())
    }

    /// hex(HMAC-SHA256(secret, query)).
    pub(crate) fn sign(secret: &str, query: &str) -> Result<String, GatewayError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Config(format!("invalid secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Smallest accepted depth limit that covers the requested depth.
    fn depth_limit(depth: usize) -> usize {
        DEPTH_LIMITS
            .iter()
            .copied()
            .find(|&l| l >= depth)
            .unwrap_or(DEPTH_LIMITS[DEPTH_LIMITS.len() - 1])
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<T, GatewayError> {
        let mut query = Self::encode_query(&params);
        let mut request_builder;

        if signed {
            let creds = self
                .credentials
                .as_ref()
                .ok_or(GatewayError::MissingCredentials("binance"))?;

            let stamp = format!(
                "recvWindow={}&timestamp={}",
                RECV_WINDOW_MS,
                Utc::now().timestamp_millis()
            );
            query = if query.is_empty() {
                stamp
            } else {
                format!("{}&{}", query, stamp)
            };
            let signature = Self::sign(&creds.secret, &query)?;
            query = format!("{}&signature={}", query, signature);

            request_builder = self
                .http
                .request(method.clone(), format!("{}{}?{}", self.base_url, path, query))
                .header("X-MBX-APIKEY", &creds.api_key);
        } else {
            let url = if query.is_empty() {
                format!("{}{}", self.base_url, path)
            } else {
                format!("{}{}?{}", self.base_url, path, query)
            };
            request_builder = self.http.request(method.clone(), url);
        }

        if method == Method::POST {
            request_builder = request_builder.header("Content-Length", "0");
        }

        debug!(method = %method, path = %path, "Binance request");

        let response = request_builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(Self::classify(status, text));
        }

        serde_json::from_str(&text).map_err(GatewayError::from)
    }

    fn classify(status: reqwest::StatusCode, body: String) -> GatewayError {
        let Ok(err) = serde_json::from_str::<ApiError>(&body) else {
            return GatewayError::from_status(status, body);
        };

        match err.code {
            -1003 | -1015 => GatewayError::Unavailable {
                status: status.as_u16(),
                message: err.msg,
            },
            -1001 | -1006 | -1007 => GatewayError::Network(err.msg),
            -1022 | -2014 | -2015 => GatewayError::Auth(err.msg),
            -2010 | -1013 | -1111 | -1121 => GatewayError::Rejected(err.msg),
            _ => match GatewayError::from_status(status, err.msg) {
                GatewayError::Exchange { message, .. } => GatewayError::Exchange {
                    code: err.code.to_string(),
                    message,
                },
                other => other,
            },
        }
    }

    fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<BookLevel>, GatewayError> {
        raw.iter()
            .map(|[price, size]| {
                Ok(BookLevel {
                    price: parse_decimal("price", price)?,
                    size: parse_decimal("size", size)?,
                })
            })
            .collect()
    }

    /// Kline rows are mixed arrays: `[openTime, "o", "h", "l", "c", "v", closeTime, ...]`.
    pub(crate) fn parse_klines(rows: Vec<Vec<serde_json::Value>>) -> Result<Vec<Candle>, GatewayError> {
        let field = |row: &[serde_json::Value], idx: usize, name: &str| -> Result<Decimal, GatewayError> {
            let raw = row
                .get(idx)
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::Decode(format!("kline {} missing", name)))?;
            parse_decimal(name, raw)
        };

        rows.iter()
            .map(|row| {
                let row = row.as_slice();
                let open_time = row
                    .first()
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| GatewayError::Decode("kline open time missing".to_string()))?;
                Ok(Candle {
                    open_time,
                    open: field(row, 1, "open")?,
                    high: field(row, 2, "high")?,
                    low: field(row, 3, "low")?,
                    close: field(row, 4, "close")?,
                    volume: field(row, 5, "volume")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ExchangeGateway for BinanceClient {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        let market = Self::market_id(symbol)?;
        let t: TickerResponse = self
            .request(Method::GET, "/api/v3/ticker/24hr", vec![("symbol", market)], false)
            .await?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: parse_decimal("lastPrice", &t.last_price)?,
            open: parse_decimal("openPrice", &t.open_price)?,
            high: parse_decimal("highPrice", &t.high_price)?,
            low: parse_decimal("lowPrice", &t.low_price)?,
            volume: parse_decimal("volume", &t.volume)?,
            timestamp: DateTime::from_timestamp_millis(t.close_time).unwrap_or_else(Utc::now),
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, GatewayError> {
        let market = Self::market_id(symbol)?;
        let params = vec![
            ("symbol", market),
            ("limit", Self::depth_limit(depth).to_string()),
        ];
        let book: DepthResponse = self.request(Method::GET, "/api/v3/depth", params, false).await?;

        let mut bids = Self::parse_levels(&book.bids)?;
        let mut asks = Self::parse_levels(&book.asks)?;
        bids.truncate(depth);
        asks.truncate(depth);

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids,
            asks,
            timestamp: Utc::now(),
        })
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let market = Self::market_id(symbol)?;
        let params = vec![
            ("symbol", market),
            ("interval", timeframe.as_str().to_string()),
            ("limit", limit.clamp(1, MAX_KLINES).to_string()),
        ];
        let rows: Vec<Vec<serde_json::Value>> =
            self.request(Method::GET, "/api/v3/klines", params, false).await?;

        Self::parse_klines(rows)
    }

    async fn fetch_balance(&self) -> Result<Decimal, GatewayError> {
        let account: AccountResponse = self
            .request(Method::GET, "/api/v3/account", Vec::new(), true)
            .await?;

        match account.balances.iter().find(|b| b.asset == "USDT") {
            Some(b) => parse_decimal("free", &b.free),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        let market = Self::market_id(&request.symbol)?;

        if request.leverage > 1 {
            debug!(leverage = request.leverage, "Leverage is not applicable on spot; ignoring");
        }

        let side = match request.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };

        let mut params = vec![
            ("symbol", market),
            ("side", side.to_string()),
            ("quantity", request.amount.normalize().to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
        ];
        match (request.kind, request.price) {
            (OrderKind::Limit, Some(price)) => {
                params.push(("type", "LIMIT".to_string()));
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("price", price.normalize().to_string()));
            }
            _ => params.push(("type", "MARKET".to_string())),
        }

        let r: OrderResponse = self.request(Method::POST, "/api/v3/order", params, true).await?;

        Ok(Order {
            id: r.order_id.to_string(),
            client_order_id: r.client_order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            price: match parse_decimal("price", &r.price)? {
                p if p.is_zero() => request.price.unwrap_or_default(),
                p => p,
            },
            amount: match parse_decimal("origQty", &r.orig_qty)? {
                q if q.is_zero() => request.amount,
                q => q,
            },
            filled: parse_decimal("executedQty", &r.executed_qty)?,
            status: r.status.to_lowercase(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_market_id() {
        assert_eq!(BinanceClient::market_id("BTC/USDT").unwrap(), "BTCUSDT");
        assert_eq!(BinanceClient::market_id("eth/usdt:USDT").unwrap(), "ETHUSDT");
    }

    #[test]
    fn test_sign() {
        let query = "symbol=BTCUSDT&side=BUY&type=LIMIT&timestamp=1700000000000";
        assert_eq!(
            BinanceClient::sign("secret-key", query).unwrap(),
            "8e3b0eda79071af5fd02e2388f47f0f9dd9afb06b378e5294df36820427ea588"
        );
    }

    #[test]
    fn test_depth_limit() {
        assert_eq!(BinanceClient::depth_limit(1), 5);
        assert_eq!(BinanceClient::depth_limit(20), 20);
        assert_eq!(BinanceClient::depth_limit(21), 50);
        assert_eq!(BinanceClient::depth_limit(100_000), 5000);
    }

    #[test]
    fn test_parse_klines() {
        let rows = vec![vec![
            json!(1700000000000i64),
            json!("100.0"),
            json!("105.5"),
            json!("99.0"),
            json!("104.0"),
            json!("12.5"),
            json!(1700000059999i64),
        ]];
        let candles = BinanceClient::parse_klines(rows).unwrap();
        assert_eq!(candles[0].open_time, 1_700_000_000_000);
        assert_eq!(candles[0].high, dec!(105.5));
        assert!(candles[0].is_bullish());

        let bad = vec![vec![json!("x")]];
        assert!(BinanceClient::parse_klines(bad).is_err());
    }

    #[test]
    fn test_classify_error_codes() {
        let body = r#"{"code":-2010,"msg":"Account has insufficient balance"}"#.to_string();
        assert!(matches!(
            BinanceClient::classify(reqwest::StatusCode::BAD_REQUEST, body),
            GatewayError::Rejected(_)
        ));

        let body = r#"{"code":-1003,"msg":"Too many requests"}"#.to_string();
        assert!(BinanceClient::classify(reqwest::StatusCode::TOO_MANY_REQUESTS, body).is_retryable());

        let html = "<html>bad gateway</html>".to_string();
        assert!(BinanceClient::classify(reqwest::StatusCode::BAD_GATEWAY, html).is_retryable());
    }
}
