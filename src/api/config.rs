//! Exchange connection configuration: which venue, credentials, sandbox, proxy.
//!
//! Configurations are immutable values. Changing the exchange, the proxy or
//! the sandbox flag produces a new `ExchangeConfig` which is handed to a
//! freshly built client.

use std::fmt;
use std::str::FromStr;

use reqwest::ClientBuilder;

use super::GatewayError;

/// Supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExchangeKind {
    #[default]
    Okx,
    Binance,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Okx => "okx",
            ExchangeKind::Binance => "binance",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "okx" | "okex" => Ok(ExchangeKind::Okx),
            "binance" => Ok(ExchangeKind::Binance),
            other => anyhow::bail!("Unsupported exchange '{}' (expected okx or binance)", other),
        }
    }
}

/// API credentials. Debug output never shows the secrets.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,

    /// OKX requires a passphrase chosen when the key was created
    pub passphrase: Option<String>,
}

impl Credentials {
    /// Read credentials for an exchange from the environment.
    ///
    /// Returns `None` when the key or secret is unset or empty; public
    /// market data still works without them.
    pub fn from_env(kind: ExchangeKind) -> Option<Self> {
        let (key_var, secret_var) = match kind {
            ExchangeKind::Okx => ("OKX_API_KEY", "OKX_SECRET"),
            ExchangeKind::Binance => ("BINANCE_API_KEY", "BINANCE_SECRET"),
        };

        let api_key = non_empty_env(key_var)?;
        let secret = non_empty_env(secret_var)?;
        let passphrase = match kind {
            ExchangeKind::Okx => non_empty_env("OKX_PASSPHRASE"),
            ExchangeKind::Binance => None,
        };

        Some(Self {
            api_key,
            secret,
            passphrase,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("secret", &"***")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .finish()
    }
}

fn mask(value: &str) -> String {
    if value.chars().count() <= 4 {
        return "***".to_string();
    }
    format!("{}***", value.chars().take(4).collect::<String>())
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// HTTP/HTTPS proxy addresses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
}

impl ProxyConfig {
    /// Build from a single address such as `127.0.0.1:10809` or
    /// `http://127.0.0.1:10809`. Both schemes go through the same HTTP proxy.
    pub fn from_address(address: &str) -> Self {
        let address = address.trim();
        let host = address
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(address)
            .trim_end_matches('/');
        let url = format!("http://{}", host);

        Self {
            http: Some(url.clone()),
            https: Some(url),
        }
    }

    /// `PROXY_HTTP` / `PROXY_HTTPS`; `None` when both are unset or empty.
    pub fn from_env() -> Option<Self> {
        let proxy = Self {
            http: non_empty_env("PROXY_HTTP"),
            https: non_empty_env("PROXY_HTTPS"),
        };

        if proxy.is_empty() {
            None
        } else {
            Some(proxy)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none()
    }

    /// Install the proxies on a reqwest client builder.
    pub fn apply(&self, mut builder: ClientBuilder) -> Result<ClientBuilder, GatewayError> {
        if let Some(http) = &self.http {
            let proxy = reqwest::Proxy::http(http)
                .map_err(|e| GatewayError::Config(format!("invalid HTTP proxy '{}': {}", http, e)))?;
            builder = builder.proxy(proxy);
        }
        if let Some(https) = &self.https {
            let proxy = reqwest::Proxy::https(https)
                .map_err(|e| GatewayError::Config(format!("invalid HTTPS proxy '{}': {}", https, e)))?;
            builder = builder.proxy(proxy);
        }
        Ok(builder)
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.http, &self.https) {
            (Some(h), Some(s)) if h == s => write!(f, "{}", h),
            (h, s) => write!(
                f,
                "http={} https={}",
                h.as_deref().unwrap_or("-"),
                s.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// Everything needed to build an exchange client.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub kind: ExchangeKind,
    pub credentials: Option<Credentials>,

    /// Route to the exchange sandbox / demo trading environment
    pub simulated: bool,

    pub proxy: Option<ProxyConfig>,
}

impl ExchangeConfig {
    /// Resolve a configuration from the environment.
    ///
    /// With `use_proxy`, an explicit `proxy` address wins over
    /// `PROXY_HTTP`/`PROXY_HTTPS`; without it no proxy is used at all.
    pub fn from_env(kind: ExchangeKind, simulated: bool, proxy: Option<&str>, use_proxy: bool) -> Self {
        let proxy = if use_proxy {
            proxy
                .filter(|p| !p.trim().is_empty())
                .map(ProxyConfig::from_address)
                .or_else(ProxyConfig::from_env)
        } else {
            None
        };

        Self {
            kind,
            credentials: Credentials::from_env(kind),
            simulated,
            proxy,
        }
    }

    /// Same settings on a different exchange, with that exchange's credentials.
    pub fn with_kind(&self, kind: ExchangeKind) -> Self {
        Self {
            kind,
            credentials: Credentials::from_env(kind),
            simulated: self.simulated,
            proxy: self.proxy.clone(),
        }
    }

    pub fn with_proxy(&self, proxy: Option<ProxyConfig>) -> Self {
        Self {
            proxy,
            ..self.clone()
        }
    }

    pub fn with_simulated(&self, simulated: bool) -> Self {
        Self {
            simulated,
            ..self.clone()
        }
    }
}
