//! OKX v5 REST client for USDT-margined perpetual swaps.
//!
//! Handles:
//! - Unified symbol mapping (`BTC/USDT` -> `BTC-USDT-SWAP`)
//! - Request signing: base64(HMAC-SHA256(secret, ts + method + path + body))
//! - Demo trading through the `x-simulated-trading` header

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{header::CONTENT_TYPE, Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::models::{BookLevel, Candle, Order, OrderBook, OrderKind, OrderRequest, Ticker, Timeframe};

use super::{parse_decimal, split_symbol, Credentials, ExchangeConfig, ExchangeGateway, GatewayError};

const OKX_API_BASE: &str = "https://www.okx.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// OKX caps `/market/candles` at 300 rows per request.
const MAX_CANDLES: usize = 300;

/// Client for the OKX REST API.
pub struct OkxClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    simulated: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    last: String,
    open24h: String,
    high24h: String,
    low24h: String,
    vol24h: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct BookData {
    asks: Vec<Vec<String>>,
    bids: Vec<Vec<String>>,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    #[serde(default)]
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceDetail {
    ccy: String,
    #[serde(default)]
    avail_bal: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    #[serde(default)]
    ord_id: String,
    #[serde(default)]
    cl_ord_id: String,
    #[serde(default)]
    s_code: String,
    #[serde(default)]
    s_msg: String,
}

impl OkxClient {
    /// Create a client from an exchange configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self, GatewayError> {
        Self::with_base_url(config, OKX_API_BASE.to_string())
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
            simulated: config.simulated,
        })
    }

    /// OKX instrument id of the perpetual swap for a unified symbol.
    pub fn inst_id(symbol: &str) -> Result<String, GatewayError> {
        if symbol.contains('-') && !symbol.contains('/') {
            return Ok(symbol.to_uppercase());
        }
        let (base, quote) = split_symbol(symbol)?;
        Ok(format!("{}-{}-SWAP", base.to_uppercase(), quote.to_uppercase()))
    }

    fn bar(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::OneMinute => "1m",
            Timeframe::ThreeMinutes => "3m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
        }
    }

    /// base64(HMAC-SHA256(secret, prehash)).
    pub(crate) fn sign(secret: &str, prehash: &str) -> Result<String, GatewayError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Config(format!("invalid secret: {}", e)))?;
        mac.update(prehash.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn timestamp() -> String {
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// Send a request and unwrap the `{code, msg, data}` envelope.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        signed: bool,
    ) -> Result<Vec<T>, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(CONTENT_TYPE, "application/json");

        if self.simulated {
            request = request.header("x-simulated-trading", "1");
        }

        if signed {
            let creds = self
                .credentials
                .as_ref()
                .ok_or(GatewayError::MissingCredentials("okx"))?;
            let passphrase = creds
                .passphrase
                .as_deref()
                .ok_or(GatewayError::MissingCredentials("okx"))?;

            let timestamp = Self::timestamp();
            let prehash = format!(
                "{}{}{}{}",
                timestamp,
                method.as_str(),
                path,
                body.as_deref().unwrap_or("")
            );
            let signature = Self::sign(&creds.secret, &prehash)?;

            request = request
                .header("OK-ACCESS-KEY", &creds.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", passphrase);
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        debug!(method = %method, path = %path, "OKX request");

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(GatewayError::from_status(status, text));
        }

        let envelope: Envelope = serde_json::from_str(&text)?;
        if envelope.code != "0" {
            // Order endpoints carry the per-order reason in data[0].sMsg
            let detail = envelope
                .data
                .first()
                .and_then(|d| d.get("sMsg"))
                .and_then(|m| m.as_str())
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .unwrap_or(envelope.msg);
            return Err(Self::classify(&envelope.code, detail));
        }

        envelope
            .data
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(GatewayError::from))
            .collect()
    }

    fn classify(code: &str, message: String) -> GatewayError {
        match code {
            "50001" | "50004" | "50011" | "50013" | "50026" => GatewayError::Unavailable {
                status: 200,
                message,
            },
            c if c.starts_with("501") => GatewayError::Auth(message),
            "1" | "2" => GatewayError::Rejected(message),
            c if c.starts_with("51") => GatewayError::Rejected(message),
            c => GatewayError::Exchange {
                code: c.to_string(),
                message,
            },
        }
    }

    fn parse_levels(raw: &[Vec<String>]) -> Result<Vec<BookLevel>, GatewayError> {
        raw.iter()
            .map(|level| match level.as_slice() {
                [price, size, ..] => Ok(BookLevel {
                    price: parse_decimal("price", price)?,
                    size: parse_decimal("size", size)?,
                }),
                _ => Err(GatewayError::Decode(format!("malformed book level {:?}", level))),
            })
            .collect()
    }

    /// OKX returns candles newest first; flip them to ascending.
    pub(crate) fn parse_candles(rows: Vec<Vec<String>>) -> Result<Vec<Candle>, GatewayError> {
        let mut candles = rows
            .iter()
            .map(|row| match row.as_slice() {
                [ts, open, high, low, close, volume, ..] => Ok(Candle {
                    open_time: ts
                        .parse()
                        .map_err(|_| GatewayError::Decode(format!("candle ts '{}'", ts)))?,
                    open: parse_decimal("open", open)?,
                    high: parse_decimal("high", high)?,
                    low: parse_decimal("low", low)?,
                    close: parse_decimal("close", close)?,
                    volume: parse_decimal("volume", volume)?,
                }),
                _ => Err(GatewayError::Decode(format!("malformed candle {:?}", row))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    fn parse_ts(ts: &str) -> DateTime<Utc> {
        ts.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }

    async fn set_leverage(&self, inst_id: &str, leverage: u32) -> Result<(), GatewayError> {
        let body = serde_json::json!({
            "instId": inst_id,
            "lever": leverage.to_string(),
            "mgnMode": "cross",
        })
        .to_string();

        let _: Vec<serde_json::Value> = self
            .request(Method::POST, "/api/v5/account/set-leverage", Some(body), true)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExchangeGateway for OkxClient {
    fn name(&self) -> &'static str {
        "okx"
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, GatewayError> {
        let inst_id = Self::inst_id(symbol)?;
        let path = format!("/api/v5/market/ticker?instId={}", inst_id);

        let data: Vec<TickerData> = self.request(Method::GET, &path, None, false).await?;
        let t = data
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode(format!("empty ticker for {}", inst_id)))?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: parse_decimal("last", &t.last)?,
            open: parse_decimal("open24h", &t.open24h)?,
            high: parse_decimal("high24h", &t.high24h)?,
            low: parse_decimal("low24h", &t.low24h)?,
            volume: parse_decimal("vol24h", &t.vol24h)?,
            timestamp: Self::parse_ts(&t.ts),
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, GatewayError> {
        let inst_id = Self::inst_id(symbol)?;
        let path = format!("/api/v5/market/books?instId={}&sz={}", inst_id, depth.clamp(1, 400));

        let data: Vec<BookData> = self.request(Method::GET, &path, None, false).await?;
        let book = data
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode(format!("empty order book for {}", inst_id)))?;

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: Self::parse_levels(&book.bids)?,
            asks: Self::parse_levels(&book.asks)?,
            timestamp: Self::parse_ts(&book.ts),
        })
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let inst_id = Self::inst_id(symbol)?;
        let path = format!(
            "/api/v5/market/candles?instId={}&bar={}&limit={}",
            inst_id,
            Self::bar(timeframe),
            limit.clamp(1, MAX_CANDLES)
        );

        let rows: Vec<Vec<String>> = self.request(Method::GET, &path, None, false).await?;
        Self::parse_candles(rows)
    }

    async fn fetch_balance(&self) -> Result<Decimal, GatewayError> {
        let data: Vec<BalanceData> = self
            .request(Method::GET, "/api/v5/account/balance?ccy=USDT", None, true)
            .await?;

        let detail = data
            .iter()
            .flat_map(|d| d.details.iter())
            .find(|d| d.ccy == "USDT");

        match detail {
            Some(d) => parse_decimal("availBal", &d.avail_bal),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        let inst_id = Self::inst_id(&request.symbol)?;

        if request.leverage > 0 {
            self.set_leverage(&inst_id, request.leverage).await?;
        }

        let mut body = serde_json::json!({
            "instId": inst_id,
            "tdMode": "cross",
            "side": request.side.as_str(),
            "ordType": request.kind.as_str(),
            "sz": request.amount.normalize().to_string(),
            "clOrdId": request.client_order_id,
        });
        if let (OrderKind::Limit, Some(price)) = (request.kind, request.price) {
            body["px"] = serde_json::Value::String(price.normalize().to_string());
        }

        let acks: Vec<OrderAck> = self
            .request(Method::POST, "/api/v5/trade/order", Some(body.to_string()), true)
            .await?;
        let ack = acks
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode("empty order acknowledgement".to_string()))?;

        if !ack.s_code.is_empty() && ack.s_code != "0" {
            return Err(GatewayError::Rejected(ack.s_msg));
        }

        Ok(Order {
            id: ack.ord_id,
            client_order_id: if ack.cl_ord_id.is_empty() {
                request.client_order_id.clone()
            } else {
                ack.cl_ord_id
            },
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            price: request.price.unwrap_or_default(),
            amount: request.amount,
            filled: Decimal::ZERO,
            status: "open".to_string(),
        })
    }
}
