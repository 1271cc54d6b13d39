//! In-memory market data caches.
//!
//! One short-TTL store for per-exchange/per-symbol price snapshots and one
//! longer-TTL store for network/fee lookups. Both are bounded by entry count
//! and by TTL, whichever triggers first. Expiry is lazy (checked on read);
//! there is no background sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::models::{NetworkFeeEntry, PriceData};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub price_ttl: Duration,
    pub price_capacity: usize,
    pub network_fee_ttl: Duration,
    pub network_fee_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            price_ttl: Duration::from_millis(2000),
            price_capacity: 10_000,
            network_fee_ttl: Duration::from_secs(2 * 60),
            network_fee_capacity: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
}

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

/// Network fee cache value. `None` is an explicit absent-marker: "we asked,
/// the exchanges had no data". It satisfies reads for a full TTL window so a
/// missing currency does not trigger a retry storm.
type FeeCacheValue = Option<Vec<NetworkFeeEntry>>;

pub struct MarketCache {
    prices: RwLock<HashMap<String, Entry<PriceData>>>,
    network_fees: RwLock<HashMap<String, Entry<FeeCacheValue>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    total_requests: AtomicU64,
    config: CacheConfig,
}

impl MarketCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            network_fees: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            config,
        }
    }

    fn price_key(exchange_id: &str, symbol: &str) -> String {
        format!("{exchange_id}:{symbol}")
    }

    /// Cached price lookup. Counts every call as a request and either a hit or
    /// a miss; an entry past its TTL counts as a miss and is dropped.
    pub fn get_price(&self, exchange_id: &str, symbol: &str) -> Option<PriceData> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let key = Self::price_key(exchange_id, symbol);

        let expired = {
            let prices = self.prices.read();
            match prices.get(&key) {
                Some(entry) if entry.stored_at.elapsed() < self.config.price_ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value);
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.prices.write().remove(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put_price(&self, exchange_id: &str, symbol: &str, data: PriceData) {
        let key = Self::price_key(exchange_id, symbol);
        let mut prices = self.prices.write();
        if prices.len() >= self.config.price_capacity && !prices.contains_key(&key) {
            evict_stalest(&mut prices);
        }
        prices.insert(
            key,
            Entry {
                value: data,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn batch_update_prices(&self, updates: &[(String, String, PriceData)]) {
        let mut prices = self.prices.write();
        for (exchange_id, symbol, data) in updates {
            let key = Self::price_key(exchange_id, symbol);
            if prices.len() >= self.config.price_capacity && !prices.contains_key(&key) {
                evict_stalest(&mut prices);
            }
            prices.insert(
                key,
                Entry {
                    value: *data,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    /// Outer `None` = cache miss. Inner `None` = cached absent-marker.
    pub fn get_network_fees(&self, key: &str) -> Option<FeeCacheValue> {
        let expired = {
            let fees = self.network_fees.read();
            match fees.get(key) {
                Some(entry) if entry.stored_at.elapsed() < self.config.network_fee_ttl => {
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.network_fees.write().remove(key);
        }
        None
    }

    pub fn put_network_fees(&self, key: &str, value: FeeCacheValue) {
        let mut fees = self.network_fees.write();
        if fees.len() >= self.config.network_fee_capacity && !fees.contains_key(key) {
            evict_stalest(&mut fees);
        }
        fees.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let hit_rate = if total_requests > 0 {
            hits as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
        }
    }

    /// Reset hit/miss counters. Called by the stats timer after reporting,
    /// never between business-logic calls.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.total_requests.store(0, Ordering::Relaxed);
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            hit_rate = format!("{:.2}%", stats.hit_rate),
            hits = stats.hits,
            misses = stats.misses,
            total = stats.total_requests,
            "cache stats"
        );
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// Drop the entry with the oldest `stored_at`. Linear scan; capacity bounds
/// keep the maps small enough that this never shows up in profiles.
fn evict_stalest<T>(map: &mut HashMap<String, Entry<T>>) {
    if let Some(key) = map
        .iter()
        .min_by_key(|(_, e)| e.stored_at)
        .map(|(k, _)| k.clone())
    {
        map.remove(&key);
    }
}
