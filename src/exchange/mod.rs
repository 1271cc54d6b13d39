//! Exchange connectivity capability.
//!
//! The scanner treats exchange access as an external capability behind
//! [`ExchangeConnector`]: markets, tickers and deposit/withdraw fee metadata,
//! each fallible and rate-limited. [`gateway::RateLimitedExchange`] wraps any
//! connector with request counting and rate-limit recovery; the rest of the
//! crate only ever sees the wrapped form.

pub mod binance;
pub mod gateway;
pub mod sim;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::ExchangeCredentials;

/// One listed market on an exchange, reduced to what pair discovery needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Unified symbol, `BASE/QUOTE` (a settlement suffix like `:USDT` may follow).
    pub symbol: String,
    /// Market type as reported by the exchange: "spot", "swap", "future", ...
    pub market_type: String,
}

/// A 24h ticker for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub quote_volume: Option<f64>,
}

/// Deposit/withdraw fee metadata for one currency. `info` carries the raw
/// provider payload; every exchange shapes it differently, so the network fee
/// adapters interpret it rather than this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositWithdrawFee {
    pub currency: String,
    /// Response-level withdrawal fee, when the exchange reports one outside of
    /// the per-network records.
    pub withdraw_fee: Option<f64>,
    pub info: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transient: the gateway waits out a cooldown and retries once.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("exchange API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("authenticated endpoint requires API credentials")]
    MissingCredentials,

    #[error("exchange not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ExchangeError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ExchangeError::RateLimited(_))
    }
}

/// The external connectivity capability, per exchange.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn id(&self) -> &str;

    /// All markets listed on the exchange, keyed by unified symbol.
    async fn load_markets(&self) -> Result<HashMap<String, Market>, ExchangeError>;

    /// Current tickers, optionally restricted to the given symbols.
    async fn fetch_tickers(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<HashMap<String, Ticker>, ExchangeError>;

    /// Deposit/withdraw fee metadata for one currency code.
    async fn fetch_deposit_withdraw_fee(
        &self,
        currency: &str,
    ) -> Result<DepositWithdrawFee, ExchangeError>;
}

/// Construct the connector for a configured exchange id.
///
/// Ids without a bundled connector are reported as unsupported, mirroring the
/// startup behavior for exchanges the connectivity library does not cover.
pub fn build_connector(
    exchange_id: &str,
    credentials: ExchangeCredentials,
) -> Result<Arc<dyn ExchangeConnector>, ExchangeError> {
    match exchange_id {
        "binance" => Ok(Arc::new(binance::BinanceConnector::new(credentials)?)),
        "sim" => Ok(Arc::new(sim::SimExchange::with_demo_markets("sim"))),
        other => {
            warn!(exchange = other, "exchange is not supported, skipping");
            Err(ExchangeError::Unsupported(other.to_string()))
        }
    }
}
