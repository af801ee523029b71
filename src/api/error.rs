//! Typed errors returned by the exchange gateway.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection, DNS, TLS or timeout failure before a response arrived.
    #[error("Network error: {0}")]
    Network(String),

    /// The exchange answered but is rate limiting or temporarily down.
    #[error("Exchange unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The order itself was refused (insufficient margin, bad size, ...).
    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Exchange error {code}: {message}")]
    Exchange { code: String, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Missing API credentials for {0}")]
    MissingCredentials(&'static str),

    #[error("Unsupported symbol '{0}'")]
    UnsupportedSymbol(String),

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_) | GatewayError::Unavailable { .. })
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Auth(body),
            StatusCode::TOO_MANY_REQUESTS => GatewayError::Unavailable {
                status: status.as_u16(),
                message: body,
            },
            // Binance answers 418 once an IP is auto-banned for ignoring 429s
            s if s.as_u16() == 418 || s.is_server_error() => GatewayError::Unavailable {
                status: s.as_u16(),
                message: body,
            },
            s => GatewayError::Exchange {
                code: s.as_u16().to_string(),
                message: body,
            },
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else if e.is_builder() {
            GatewayError::Config(e.to_string())
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Decode(e.to_string())
    }
}
