use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bid/ask snapshot for one symbol on one exchange.
///
/// Immutable once stored in the price cache; `timestamp` is unix millis at
/// capture time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceData {
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
    pub timestamp: i64,
}

/// A detected cross-exchange arbitrage opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    #[serde(rename = "type")]
    pub opportunity_type: String,
    pub symbol: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_price: f64,
    pub sell_price: f64,
    pub profit_percentage: f64,
    pub min_volume: f64,
    pub timestamp: DateTime<Utc>,
    /// Display path for the front end, e.g. `["BTC/USDT on binance", "BTC/USDT on okx"]`.
    pub path: Vec<String>,
}

impl Opportunity {
    pub fn cross_exchange(
        symbol: String,
        buy_exchange: String,
        sell_exchange: String,
        buy_price: f64,
        sell_price: f64,
        profit_percentage: f64,
        min_volume: f64,
    ) -> Self {
        let path = vec![
            format!("{} on {}", symbol, buy_exchange),
            format!("{} on {}", symbol, sell_exchange),
        ];
        Self {
            opportunity_type: "Cross-Exchange".to_string(),
            symbol,
            buy_exchange,
            sell_exchange,
            buy_price,
            sell_price,
            profit_percentage,
            min_volume,
            timestamp: Utc::now(),
            path,
        }
    }

    /// The persistence key: at most one live row per ordered exchange pair per symbol.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.buy_exchange, &self.sell_exchange, &self.symbol)
    }
}

/// Normalized view of one transfer network between a buy and a sell exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFeeEntry {
    pub network: Option<String>,
    pub withdrawal_fee: Option<f64>,
    pub deposit_enabled: Option<bool>,
}

/// Sort keys accepted by the opportunities query API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunitySort {
    #[default]
    Timestamp,
    Volume,
    SpreadAsc,
    SpreadDesc,
}

/// Filter parameters for reading the persisted opportunity set.
#[derive(Debug, Clone)]
pub struct OpportunityFilter {
    pub min_volume: f64,
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub buy_exchanges: Vec<String>,
    pub sell_exchanges: Vec<String>,
    pub sort: OpportunitySort,
}

impl Default for OpportunityFilter {
    fn default() -> Self {
        Self {
            min_volume: 0.0,
            min_percentage: 0.0,
            max_percentage: 100.0,
            buy_exchanges: Vec::new(),
            sell_exchanges: Vec::new(),
            sort: OpportunitySort::Timestamp,
        }
    }
}
