//! Environment-driven configuration.
//!
//! Everything is read once at startup; missing variables fall back to the
//! defaults the bot has always run with.

use std::env;
use std::time::Duration;

/// Major quote currencies every exchange is matched against, regardless of
/// what the per-exchange quote analysis finds.
pub const QUOTE_ALLOW_LIST: [&str; 5] = ["USDT", "TRY", "BUSD", "USDC", "BTC"];

#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Lower bound of the profit band (fractional, 0.001 = 0.1%). Strictly exclusive.
    pub min_profit_threshold: f64,
    /// Upper bound of the profit band (fractional, 1.0 = 100%). Strictly exclusive.
    pub max_profit_threshold: f64,
    /// Volume-ranked cap on trading pairs kept per exchange.
    pub max_pairs_per_exchange: usize,
    pub discovery_interval: Duration,
    pub reconcile_interval: Duration,
    pub catalog_refresh_interval: Duration,
    pub cleanup_interval: Duration,
    /// Persisted opportunities older than this are removed by the cleanup timer.
    pub opportunity_max_age: Duration,
    pub stats_interval: Duration,
    pub price_cache_ttl: Duration,
    pub network_fee_cache_ttl: Duration,
    /// Cooldown before the single retry after a rate-limit error.
    pub rate_limit_cooldown: Duration,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            min_profit_threshold: 0.001,
            max_profit_threshold: 1.0,
            max_pairs_per_exchange: 2000,
            discovery_interval: Duration::from_secs(15),
            reconcile_interval: Duration::from_secs(5),
            catalog_refresh_interval: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            opportunity_max_age: Duration::from_secs(30 * 60),
            stats_interval: Duration::from_secs(30),
            price_cache_ttl: Duration::from_millis(2000),
            network_fee_cache_ttl: Duration::from_secs(2 * 60),
            rate_limit_cooldown: Duration::from_secs(15),
        }
    }
}

impl BotConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_profit_threshold: env_f64("MIN_PROFIT_THRESHOLD", defaults.min_profit_threshold),
            max_profit_threshold: env_f64("MAX_PROFIT_THRESHOLD", defaults.max_profit_threshold),
            max_pairs_per_exchange: env_u64("MAX_PAIRS_PER_EXCHANGE", 2000) as usize,
            discovery_interval: env_secs("DISCOVERY_INTERVAL_SECS", defaults.discovery_interval),
            reconcile_interval: env_secs("RECONCILE_INTERVAL_SECS", defaults.reconcile_interval),
            catalog_refresh_interval: env_secs(
                "CATALOG_REFRESH_INTERVAL_SECS",
                defaults.catalog_refresh_interval,
            ),
            cleanup_interval: env_secs("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
            opportunity_max_age: env_secs(
                "OPPORTUNITY_MAX_AGE_SECS",
                defaults.opportunity_max_age,
            ),
            stats_interval: env_secs("CACHE_STATS_INTERVAL_SECS", defaults.stats_interval),
            price_cache_ttl: Duration::from_millis(env_u64("PRICE_CACHE_TTL_MS", 2000)),
            network_fee_cache_ttl: env_secs(
                "NETWORK_FEE_CACHE_TTL_SECS",
                defaults.network_fee_cache_ttl,
            ),
            rate_limit_cooldown: env_secs("RATE_LIMIT_COOLDOWN_SECS", defaults.rate_limit_cooldown),
        }
    }
}

/// Optional API credentials for one exchange. Public market data works without
/// them; fee endpoints on most exchanges do not.
#[derive(Debug, Clone, Default)]
pub struct ExchangeCredentials {
    pub api_key: Option<String>,
    pub secret: Option<String>,
    pub password: Option<String>,
}

impl ExchangeCredentials {
    /// Reads `{ID}_API_KEY`, `{ID}_API_SECRET` and `{ID}_PASSWORD`.
    pub fn from_env(exchange_id: &str) -> Self {
        let prefix = exchange_id.to_uppercase();
        Self {
            api_key: non_empty(env::var(format!("{prefix}_API_KEY")).ok()),
            secret: non_empty(env::var(format!("{prefix}_API_SECRET")).ok()),
            password: non_empty(env::var(format!("{prefix}_PASSWORD")).ok()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.api_key.is_some() && self.secret.is_some()
    }
}

/// Exchange ids the bot should run against, from `ARBIBOT_EXCHANGES` (csv).
pub fn configured_exchanges() -> Vec<String> {
    env::var("ARBIBOT_EXCHANGES")
        .unwrap_or_else(|_| "binance".to_string())
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.min_profit_threshold, 0.001);
        assert_eq!(cfg.max_profit_threshold, 1.0);
        assert_eq!(cfg.price_cache_ttl, Duration::from_millis(2000));
        assert_eq!(cfg.opportunity_max_age, Duration::from_secs(1800));
        assert_eq!(cfg.rate_limit_cooldown, Duration::from_secs(15));
    }

    #[test]
    fn credentials_require_key_and_secret() {
        let creds = ExchangeCredentials {
            api_key: Some("k".into()),
            secret: None,
            password: None,
        };
        assert!(!creds.is_complete());
    }
}
