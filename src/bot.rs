//! Scanner orchestration.
//!
//! Owns the periodic work: the discovery cycle that scans fresh tickers for
//! new opportunities, the reconciliation pass that re-prices persisted rows,
//! age-based cleanup and cache stats reporting. Each loop runs on its own
//! tokio interval and stops when the shutdown channel fires.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::arbitrage::{OpportunityEngine, PriceQuote};
use crate::cache::MarketCache;
use crate::catalog::{normalize_symbol, MarketCatalog};
use crate::config::BotConfig;
use crate::exchange::gateway::{RateLimitedExchange, RequestCounters};
use crate::exchange::{ExchangeConnector, Ticker};
use crate::models::{Opportunity, PriceData};
use crate::storage::OpportunityStore;

/// Taker fee assumed on each leg when re-validating a persisted opportunity.
const LEG_FEE: f64 = 0.001;
const ROUND_TRIP_FEE: f64 = 2.0 * LEG_FEE;

pub struct ArbitrageBot {
    gateways: HashMap<String, Arc<RateLimitedExchange>>,
    catalog: Arc<MarketCatalog>,
    cache: Arc<MarketCache>,
    store: Arc<OpportunityStore>,
    engine: OpportunityEngine,
    /// Last fetched ticker per exchange per original symbol; refreshed each
    /// cycle, read when the short-TTL price cache misses.
    tickers: RwLock<HashMap<String, HashMap<String, Ticker>>>,
    counters: Arc<RequestCounters>,
    opportunity_tx: broadcast::Sender<Opportunity>,
    config: BotConfig,
    cycles: AtomicU64,
}

impl ArbitrageBot {
    pub fn new(
        gateways: HashMap<String, Arc<RateLimitedExchange>>,
        cache: Arc<MarketCache>,
        store: Arc<OpportunityStore>,
        counters: Arc<RequestCounters>,
        config: BotConfig,
    ) -> Self {
        let (opportunity_tx, _) = broadcast::channel(256);
        Self {
            catalog: Arc::new(MarketCatalog::new(
                config.catalog_refresh_interval,
                config.max_pairs_per_exchange,
            )),
            engine: OpportunityEngine::new(
                config.min_profit_threshold,
                config.max_profit_threshold,
            ),
            gateways,
            cache,
            store,
            tickers: RwLock::new(HashMap::new()),
            counters,
            opportunity_tx,
            config,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn exchange_ids(&self) -> Vec<String> {
        self.gateways.keys().cloned().collect()
    }

    /// Live feed of newly detected opportunities.
    pub fn subscribe(&self) -> broadcast::Receiver<Opportunity> {
        self.opportunity_tx.subscribe()
    }

    /// Current price for one symbol on one exchange: cache first, then the
    /// ticker book. A ticker without both a positive bid and ask is unusable
    /// and yields nothing.
    pub fn get_ticker_price(&self, exchange_id: &str, symbol: &str) -> Option<PriceData> {
        if let Some(cached) = self.cache.get_price(exchange_id, symbol) {
            return Some(cached);
        }

        let data = {
            let book = self.tickers.read();
            let ticker = book.get(exchange_id)?.get(symbol)?;
            let bid = ticker.bid.filter(|b| *b > 0.0)?;
            let ask = ticker.ask.filter(|a| *a > 0.0)?;
            PriceData {
                bid,
                ask,
                volume: ticker.quote_volume.unwrap_or(0.0),
                timestamp: chrono::Utc::now().timestamp_millis(),
            }
        };
        self.cache.put_price(exchange_id, symbol, data);
        Some(data)
    }

    /// Refetch tickers for the given exchanges, restricted to their catalog
    /// pairs, and fold the results into the ticker book and price cache. One
    /// exchange failing never disturbs the others.
    async fn refresh_tickers(&self, exchange_ids: &[String]) {
        self.refresh_tickers_including(exchange_ids, &[]).await;
    }

    /// Like [`refresh_tickers`](Self::refresh_tickers) but also requests
    /// `extra_symbols` on every exchange. Reconciliation needs this: a
    /// persisted row can reference a symbol that has since dropped out of the
    /// volume-ranked catalog cap.
    async fn refresh_tickers_including(&self, exchange_ids: &[String], extra_symbols: &[String]) {
        let tasks = exchange_ids.iter().filter_map(|exchange_id| {
            let gateway = self.gateways.get(exchange_id)?.clone();
            let mut pairs = self.catalog.pairs_for(exchange_id);
            for symbol in extra_symbols {
                if !pairs.contains(symbol) {
                    pairs.push(symbol.clone());
                }
            }
            let exchange_id = exchange_id.clone();
            Some(async move {
                let symbols = if pairs.is_empty() { None } else { Some(&pairs[..]) };
                let result = gateway.fetch_tickers(symbols).await;
                (exchange_id, result)
            })
        });

        for (exchange_id, result) in join_all(tasks).await {
            match result {
                Ok(tickers) => self.store_tickers(&exchange_id, tickers),
                Err(e) => {
                    error!(exchange = %exchange_id, error = %e, "ticker refresh failed");
                }
            }
        }
    }

    fn store_tickers(&self, exchange_id: &str, tickers: HashMap<String, Ticker>) {
        let updates: Vec<(String, String, PriceData)> = tickers
            .values()
            .filter_map(|t| {
                let bid = t.bid.filter(|b| *b > 0.0)?;
                let ask = t.ask.filter(|a| *a > 0.0)?;
                Some((
                    exchange_id.to_string(),
                    t.symbol.clone(),
                    PriceData {
                        bid,
                        ask,
                        volume: t.quote_volume.unwrap_or(0.0),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    },
                ))
            })
            .collect();
        self.cache.batch_update_prices(&updates);
        debug!(exchange = exchange_id, tickers = tickers.len(), "ticker book updated");
        self.tickers.write().insert(exchange_id.to_string(), tickers);
    }

    /// Group current prices by normalized symbol, one quote per exchange per
    /// symbol. Catalog pair lists are volume-ranked, so when two raw symbols
    /// normalize identically the more liquid one wins.
    fn collect_quotes(&self) -> HashMap<String, Vec<PriceQuote>> {
        let mut grouped: HashMap<String, Vec<PriceQuote>> = HashMap::new();
        let mut seen: HashMap<String, HashSet<String>> = HashMap::new();

        for exchange_id in self.gateways.keys() {
            for pair in self.catalog.pairs_for(exchange_id) {
                let symbol = normalize_symbol(&pair).to_string();
                if !seen.entry(symbol.clone()).or_default().insert(exchange_id.clone()) {
                    continue;
                }
                if let Some(price) = self.get_ticker_price(exchange_id, &pair) {
                    grouped.entry(symbol).or_default().push(PriceQuote {
                        exchange_id: exchange_id.clone(),
                        original_symbol: pair,
                        price,
                    });
                }
            }
        }
        grouped
    }

    /// One full discovery pass: refresh market data, scan, persist, publish.
    pub async fn discovery_cycle(&self) {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(cycle, "discovery cycle starting");

        if self.catalog.should_refresh() {
            let fetched = self.catalog.refresh(&self.gateways).await;
            // Exchanges whose catalog fetch failed still get a plain ticker
            // refresh so their book prices are not a full cycle stale.
            let missing: Vec<String> = self
                .gateways
                .keys()
                .filter(|id| !fetched.contains_key(*id))
                .cloned()
                .collect();
            for (exchange_id, tickers) in fetched {
                self.store_tickers(&exchange_id, tickers);
            }
            if !missing.is_empty() {
                self.refresh_tickers(&missing).await;
            }
        } else {
            let ids = self.exchange_ids();
            self.refresh_tickers(&ids).await;
        }

        let quotes = self.collect_quotes();
        let opportunities = self.engine.find_cross_exchange(&quotes);

        for op in &opportunities {
            if let Err(e) = self.store.upsert(op) {
                error!(
                    symbol = %op.symbol,
                    buy = %op.buy_exchange,
                    sell = %op.sell_exchange,
                    error = %e,
                    "failed to persist opportunity"
                );
                continue;
            }
            // Receiver lag or absence is not an error.
            let _ = self.opportunity_tx.send(op.clone());
        }

        let requests = self.counters.snapshot();
        if !requests.is_empty() {
            info!(?requests, "exchange requests this cycle");
            self.counters.reset();
        }
        self.cache.log_stats();
        info!(cycle, found = opportunities.len(), "discovery cycle complete");
    }

    /// Re-price every persisted opportunity against fresh tickers. A row whose
    /// spread no longer clears the fee-adjusted threshold, or whose legs can
    /// no longer be priced, is deleted; survivors get updated prices.
    pub async fn check_active_opportunities(&self) {
        let rows = match self.store.list_all() {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failed to load opportunities for reconciliation");
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        let involved: Vec<String> = rows
            .iter()
            .flat_map(|r| [r.buy_exchange.clone(), r.sell_exchange.clone()])
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let symbols: Vec<String> = rows
            .iter()
            .map(|r| r.symbol.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        self.refresh_tickers_including(&involved, &symbols).await;

        let mut kept = 0usize;
        let mut dropped = 0usize;
        for row in &rows {
            let buy = self.get_ticker_price(&row.buy_exchange, &row.symbol);
            let sell = self.get_ticker_price(&row.sell_exchange, &row.symbol);

            let (Some(buy), Some(sell)) = (buy, sell) else {
                debug!(
                    symbol = %row.symbol,
                    buy = %row.buy_exchange,
                    sell = %row.sell_exchange,
                    "leg no longer priceable, dropping"
                );
                self.delete_row(row);
                dropped += 1;
                continue;
            };

            let profit = sell.bid / buy.ask - 1.0 - ROUND_TRIP_FEE;
            if profit > self.config.min_profit_threshold {
                let result = self.store.update_live(
                    &row.buy_exchange,
                    &row.sell_exchange,
                    &row.symbol,
                    profit * 100.0,
                    buy.ask,
                    sell.bid,
                    buy.volume.min(sell.volume),
                );
                if let Err(e) = result {
                    error!(symbol = %row.symbol, error = %e, "failed to update opportunity");
                }
                kept += 1;
            } else {
                self.delete_row(row);
                dropped += 1;
            }
        }
        info!(total = rows.len(), kept, dropped, "reconciliation pass complete");
    }

    fn delete_row(&self, row: &Opportunity) {
        if let Err(e) = self
            .store
            .delete(&row.buy_exchange, &row.sell_exchange, &row.symbol)
        {
            error!(symbol = %row.symbol, error = %e, "failed to delete opportunity");
        }
    }

    /// Spawn the four background loops. Each stops when `shutdown` fires.
    pub fn spawn_all(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        self.spawn_discovery(shutdown.subscribe());
        self.spawn_reconciliation(shutdown.subscribe());
        self.spawn_cleanup(shutdown.subscribe());
        self.spawn_stats(shutdown.subscribe());
    }

    fn spawn_discovery(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let bot = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(bot.config.discovery_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => bot.discovery_cycle().await,
                    _ = shutdown.recv() => {
                        info!("discovery loop stopping");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_reconciliation(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let bot = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(bot.config.reconcile_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => bot.check_active_opportunities().await,
                    _ = shutdown.recv() => {
                        info!("reconciliation loop stopping");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_cleanup(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let bot = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(bot.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let max_age = match chrono::Duration::from_std(bot.config.opportunity_max_age) {
                            Ok(age) => age,
                            Err(e) => {
                                warn!(error = %e, "invalid max age, skipping cleanup");
                                continue;
                            }
                        };
                        let cutoff = chrono::Utc::now() - max_age;
                        if let Err(e) = bot.store.delete_older_than(cutoff) {
                            error!(error = %e, "cleanup failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("cleanup loop stopping");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_stats(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let bot = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(bot.config.stats_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        bot.cache.log_stats();
                        bot.cache.reset_stats();
                    }
                    _ = shutdown.recv() => {
                        info!("stats loop stopping");
                        break;
                    }
                }
            }
        });
    }
}
