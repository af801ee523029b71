//! Bounded order placement retry.
//!
//! Retryable gateway errors (network, rate limit, 5xx) are retried with
//! exponential backoff up to `max_attempts`; anything else stops at once.

use std::time::Duration;

use anyhow::anyhow;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{info, warn};

use crate::models::{Order, OrderRequest};

use super::{ExchangeGateway, GatewayError};

/// Retry schedule for order placement.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    pub initial_delay: Duration,

    pub multiplier: f64,

    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_delay)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Result of a placement attempt sequence.
#[derive(Debug)]
pub enum OrderOutcome {
    Placed(Order),

    /// Every attempt failed with a retryable error.
    RetriesExhausted { attempts: u32, last_error: GatewayError },

    /// A non-retryable error ended the sequence.
    Rejected(GatewayError),
}

impl OrderOutcome {
    #[cfg(test)]
    pub fn order(&self) -> Option<&Order> {
        match self {
            OrderOutcome::Placed(order) => Some(order),
            _ => None,
        }
    }

    pub fn into_result(self) -> anyhow::Result<Order> {
        match self {
            OrderOutcome::Placed(order) => Ok(order),
            OrderOutcome::RetriesExhausted { attempts, last_error } => Err(anyhow!(
                "Order not placed after {} attempts: {}",
                attempts,
                last_error
            )),
            OrderOutcome::Rejected(e) => Err(anyhow!(e).context("Order placement failed")),
        }
    }
}

/// Submit an order, retrying transient failures according to `policy`.
pub async fn place_order_with_retry(
    gateway: &dyn ExchangeGateway,
    request: &OrderRequest,
    policy: &RetryPolicy,
) -> OrderOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;

    let result = backoff::future::retry(policy.backoff(), || {
        attempts += 1;
        let attempt = attempts;
        async move {
            match gateway.create_order(request).await {
                Ok(order) => Ok(order),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        attempt = attempt,
                        max_attempts = max_attempts,
                        error = %e,
                        "Order placement failed, retrying"
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await;

    match result {
        Ok(order) => {
            info!(
                order_id = %order.id,
                symbol = %order.symbol,
                side = order.side.as_str(),
                attempts = attempts,
                "Order placed"
            );
            OrderOutcome::Placed(order)
        }
        Err(e) if e.is_retryable() => OrderOutcome::RetriesExhausted {
            attempts,
            last_error: e,
        },
        Err(e) => OrderOutcome::Rejected(e),
    }
}
