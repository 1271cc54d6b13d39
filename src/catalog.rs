//! Trading-pair discovery and refresh.
//!
//! Per exchange, keeps the volume-ranked set of eligible spot pairs and the
//! quote currencies that matter there. Rebuilt wholesale every refresh; the
//! swap is atomic per exchange so consumers never see a half-built list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::config::QUOTE_ALLOW_LIST;
use crate::exchange::gateway::RateLimitedExchange;
use crate::exchange::{ExchangeConnector, Market, Ticker};

/// Strips a settlement suffix (`BTC/USDT:USDT` -> `BTC/USDT`). Some exchanges
/// report linear contracts under suffixed symbols.
pub fn normalize_symbol(symbol: &str) -> &str {
    symbol.split(':').next().unwrap_or(symbol)
}

/// Share of an exchange's pairs a quote currency must appear in to count as
/// significant there.
const SIGNIFICANT_QUOTE_SHARE: f64 = 0.05;

pub struct MarketCatalog {
    pairs: RwLock<HashMap<String, Vec<String>>>,
    quote_currencies: RwLock<HashMap<String, HashSet<String>>>,
    last_refresh: RwLock<Option<Instant>>,
    refresh_interval: Duration,
    max_pairs: usize,
}

impl MarketCatalog {
    pub fn new(refresh_interval: Duration, max_pairs: usize) -> Self {
        Self {
            pairs: RwLock::new(HashMap::new()),
            quote_currencies: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
            refresh_interval,
            max_pairs,
        }
    }

    /// True once the refresh interval has elapsed since the last successful
    /// refresh, or when the catalog has never been filled.
    pub fn should_refresh(&self) -> bool {
        if self.pairs.read().is_empty() {
            return true;
        }
        match *self.last_refresh.read() {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    pub fn pairs_for(&self, exchange_id: &str) -> Vec<String> {
        self.pairs.read().get(exchange_id).cloned().unwrap_or_default()
    }

    pub fn quote_currencies_for(&self, exchange_id: &str) -> HashSet<String> {
        self.quote_currencies
            .read()
            .get(exchange_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Refreshes every exchange concurrently. One exchange failing leaves its
    /// prior pair list untouched and never disturbs the others. Returns the
    /// full ticker maps fetched along the way so the caller can seed its
    /// ticker book instead of fetching twice.
    pub async fn refresh(
        &self,
        gateways: &HashMap<String, Arc<RateLimitedExchange>>,
    ) -> HashMap<String, HashMap<String, Ticker>> {
        info!("fetching trading pairs from all exchanges");

        let tasks = gateways.iter().map(|(exchange_id, gateway)| {
            let exchange_id = exchange_id.clone();
            let gateway = gateway.clone();
            async move {
                let result = Self::fetch_exchange_pairs(&gateway).await;
                (exchange_id, result)
            }
        });

        let mut fetched_tickers = HashMap::new();
        let mut any_success = false;

        for (exchange_id, result) in join_all(tasks).await {
            match result {
                Ok((markets, tickers)) => {
                    let valid_pairs = self.rank_pairs(&markets, &tickers);
                    debug!(
                        exchange = %exchange_id,
                        pairs = valid_pairs.len(),
                        tickers = tickers.len(),
                        "catalog refreshed"
                    );
                    self.analyze_quote_currencies(&exchange_id, &valid_pairs);
                    self.pairs.write().insert(exchange_id.clone(), valid_pairs);
                    fetched_tickers.insert(exchange_id, tickers);
                    any_success = true;
                }
                Err(e) => {
                    error!(exchange = %exchange_id, error = %e, "error fetching trading pairs");
                }
            }
        }

        if any_success {
            *self.last_refresh.write() = Some(Instant::now());
        }
        fetched_tickers
    }

    async fn fetch_exchange_pairs(
        gateway: &RateLimitedExchange,
    ) -> Result<(HashMap<String, Market>, HashMap<String, Ticker>), crate::exchange::ExchangeError>
    {
        let markets = gateway.load_markets().await?;
        let tickers = gateway.fetch_tickers(None).await?;
        Ok((markets, tickers))
    }

    /// Filter to allow-listed spot pairs with volume, rank by quote volume
    /// descending, cap at `max_pairs`.
    fn rank_pairs(
        &self,
        markets: &HashMap<String, Market>,
        tickers: &HashMap<String, Ticker>,
    ) -> Vec<String> {
        let mut valid: Vec<(&String, f64)> = tickers
            .iter()
            .filter(|(symbol, ticker)| is_valid_pair(symbol, ticker, markets))
            .map(|(symbol, ticker)| (symbol, ticker.quote_volume.unwrap_or(0.0)))
            .collect();

        valid.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        valid.truncate(self.max_pairs);
        valid.into_iter().map(|(symbol, _)| symbol.clone()).collect()
    }

    /// Quote currencies covering at least 5% of the exchange's pairs, always
    /// unioned with the major-quote allow-list.
    fn analyze_quote_currencies(&self, exchange_id: &str, pairs: &[String]) {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for pair in pairs {
            if let Some(quote) = normalize_symbol(pair).split('/').nth(1) {
                *counts.entry(quote).or_insert(0) += 1;
            }
        }

        let min_count = pairs.len() as f64 * SIGNIFICANT_QUOTE_SHARE;
        let mut quotes = self.quote_currencies.write();
        let set = quotes.entry(exchange_id.to_string()).or_default();
        for (quote, count) in counts {
            if count as f64 >= min_count {
                set.insert(quote.to_string());
            }
        }
        for quote in QUOTE_ALLOW_LIST {
            set.insert(quote.to_string());
        }
        debug!(
            exchange = exchange_id,
            quotes = set.len(),
            "significant quote currencies"
        );
    }
}

fn is_valid_pair(symbol: &str, ticker: &Ticker, markets: &HashMap<String, Market>) -> bool {
    let market_symbol = normalize_symbol(symbol);
    let Some(market) = markets.get(market_symbol) else {
        return false;
    };
    if market.market_type != "spot" {
        return false;
    }

    let Some(quote) = market_symbol.split('/').nth(1) else {
        debug!(symbol, "invalid symbol format");
        return false;
    };

    QUOTE_ALLOW_LIST.contains(&quote) && ticker.quote_volume.unwrap_or(0.0) > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::gateway::{RateLimitedExchange, RequestCounters};
    use crate::exchange::sim::SimExchange;
    use crate::exchange::ExchangeError;

    fn gateway(sim: Arc<SimExchange>) -> Arc<RateLimitedExchange> {
        Arc::new(RateLimitedExchange::new(
            sim,
            Arc::new(RequestCounters::new()),
            Duration::from_millis(5),
        ))
    }

    fn gateway_map(
        entries: Vec<(&str, Arc<SimExchange>)>,
    ) -> HashMap<String, Arc<RateLimitedExchange>> {
        entries
            .into_iter()
            .map(|(id, sim)| (id.to_string(), gateway(sim)))
            .collect()
    }

    #[test]
    fn normalize_strips_settlement_suffix() {
        assert_eq!(normalize_symbol("BTC/USDT:USDT"), "BTC/USDT");
        assert_eq!(normalize_symbol("BTC/USDT"), "BTC/USDT");
    }

    #[tokio::test]
    async fn refresh_keeps_only_allowlisted_spot_pairs_with_volume() {
        let sim = Arc::new(SimExchange::new("simx"));
        sim.set_spot_market("BTC/USDT", 64000.0, 64010.0, 1_000_000.0);
        sim.set_spot_market("ETH/BTC", 0.05, 0.051, 500.0);
        // Non-allow-listed quote.
        sim.set_spot_market("ETH/DAI", 3200.0, 3201.0, 900.0);
        // Perp market, filtered by type.
        sim.set_market("SOL/USDT:USDT", "swap");
        sim.set_ticker(
            "SOL/USDT:USDT",
            Ticker {
                symbol: "SOL/USDT:USDT".into(),
                bid: Some(150.0),
                ask: Some(150.1),
                quote_volume: Some(2_000_000.0),
            },
        );
        // Zero volume.
        sim.set_spot_market("XRP/USDT", 0.5, 0.51, 0.0);

        let catalog = MarketCatalog::new(Duration::from_secs(300), 100);
        catalog.refresh(&gateway_map(vec![("simx", sim)])).await;

        let pairs = catalog.pairs_for("simx");
        assert_eq!(pairs, vec!["BTC/USDT".to_string(), "ETH/BTC".to_string()]);
    }

    #[tokio::test]
    async fn pairs_are_volume_ranked_and_capped() {
        let sim = Arc::new(SimExchange::new("simx"));
        sim.set_spot_market("A/USDT", 1.0, 1.1, 100.0);
        sim.set_spot_market("B/USDT", 1.0, 1.1, 300.0);
        sim.set_spot_market("C/USDT", 1.0, 1.1, 200.0);

        let catalog = MarketCatalog::new(Duration::from_secs(300), 2);
        catalog.refresh(&gateway_map(vec![("simx", sim)])).await;

        assert_eq!(
            catalog.pairs_for("simx"),
            vec!["B/USDT".to_string(), "C/USDT".to_string()]
        );
    }

    #[tokio::test]
    async fn settlement_suffixed_spot_symbol_is_kept() {
        let sim = Arc::new(SimExchange::new("simx"));
        // Market listed under the normalized symbol, ticker under the suffixed one.
        sim.set_market("BTC/USDT", "spot");
        sim.set_ticker(
            "BTC/USDT:USDT",
            Ticker {
                symbol: "BTC/USDT:USDT".into(),
                bid: Some(64000.0),
                ask: Some(64010.0),
                quote_volume: Some(1000.0),
            },
        );

        let catalog = MarketCatalog::new(Duration::from_secs(300), 100);
        catalog.refresh(&gateway_map(vec![("simx", sim)])).await;
        assert_eq!(catalog.pairs_for("simx"), vec!["BTC/USDT:USDT".to_string()]);
    }

    #[tokio::test]
    async fn significant_quotes_include_allowlist() {
        let sim = Arc::new(SimExchange::new("simx"));
        for i in 0..20 {
            sim.set_spot_market(&format!("T{i}/USDT"), 1.0, 1.1, 100.0 + i as f64);
        }
        sim.set_spot_market("ETH/BTC", 0.05, 0.051, 50.0);

        let catalog = MarketCatalog::new(Duration::from_secs(300), 100);
        catalog.refresh(&gateway_map(vec![("simx", sim)])).await;

        let quotes = catalog.quote_currencies_for("simx");
        // USDT dominates; BTC is below 5% but lives in the allow-list anyway.
        assert!(quotes.contains("USDT"));
        assert!(quotes.contains("BTC"));
        assert!(quotes.contains("USDC"));
    }

    #[tokio::test]
    async fn one_failing_exchange_does_not_abort_the_others() {
        let ok = Arc::new(SimExchange::with_demo_markets("good"));
        let bad = Arc::new(SimExchange::with_demo_markets("bad"));
        bad.fail_next(ExchangeError::Api {
            status: 500,
            body: "down".into(),
        });

        let catalog = MarketCatalog::new(Duration::from_secs(300), 100);
        catalog
            .refresh(&gateway_map(vec![("good", ok), ("bad", bad)]))
            .await;

        assert!(!catalog.pairs_for("good").is_empty());
        assert!(catalog.pairs_for("bad").is_empty());
        // A partially successful refresh still counts as a refresh.
        assert!(!catalog.should_refresh());
    }

    #[tokio::test]
    async fn failed_refresh_leaves_prior_catalog_untouched() {
        let sim = Arc::new(SimExchange::with_demo_markets("simx"));
        let catalog = MarketCatalog::new(Duration::from_secs(300), 100);
        let gateways = gateway_map(vec![("simx", sim.clone())]);
        catalog.refresh(&gateways).await;
        let before = catalog.pairs_for("simx");
        assert!(!before.is_empty());

        sim.fail_next(ExchangeError::Api {
            status: 500,
            body: "down".into(),
        });
        catalog.refresh(&gateways).await;
        assert_eq!(catalog.pairs_for("simx"), before);
    }

    #[test]
    fn empty_catalog_wants_refresh() {
        let catalog = MarketCatalog::new(Duration::from_secs(300), 100);
        assert!(catalog.should_refresh());
    }
}
