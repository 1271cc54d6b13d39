//! Transfer network and withdrawal fee resolution.
//!
//! Answers "which networks can move `currency` from the buy exchange to the
//! sell exchange, and what does the withdrawal cost". Every exchange shapes
//! its fee payload differently, so a per-exchange [`FeeShapeAdapter`] extracts
//! the per-network records from the raw `info` blob before the two sides are
//! merged. Results are cached, including an explicit "no data" marker so a
//! currency neither side knows about does not get re-queried every request.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::MarketCache;
use crate::exchange::gateway::RateLimitedExchange;
use crate::exchange::{DepositWithdrawFee, ExchangeConnector, ExchangeError};
use crate::models::NetworkFeeEntry;

/// One per-network record as extracted from a provider payload.
#[derive(Debug, Clone)]
pub struct NetworkRecord {
    pub network: String,
    pub withdrawal_fee: Option<f64>,
    pub deposit_enabled: Option<bool>,
}

/// Interprets one exchange's raw fee payload shape. Supporting a new exchange
/// means adding an adapter here, not branching in the resolver.
trait FeeShapeAdapter: Send + Sync {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord>;
}

fn adapter_for(exchange_id: &str) -> &'static dyn FeeShapeAdapter {
    match exchange_id {
        "binance" | "mexc" | "bingx" => &BinanceFamilyShape,
        "okx" => &OkxShape,
        "gateio" => &GateioShape,
        "bitget" => &BitgetShape,
        "bitmex" => &BitmexShape,
        "poloniex" => &PoloniexShape,
        "huobi" | "htx" => &HuobiShape,
        "kucoin" => &KucoinShape,
        "bybit" => &BybitShape,
        _ => &GenericShape,
    }
}

/// Collapse exchange-specific network spellings onto one canonical name so
/// both sides of a transfer can be matched up.
pub fn normalize_network(raw: &str) -> String {
    let mut name = raw.trim().to_uppercase();

    // "BNB SMART CHAIN (BEP20)" -> "BEP20"
    if let Some(start) = name.find('(') {
        if let Some(end) = name.rfind(')') {
            if end > start + 1 {
                name = name[start + 1..end].trim().to_string();
            }
        }
    }

    match name.as_str() {
        "BEP20" | "BSC" | "BNB SMART CHAIN" => "BSC".to_string(),
        "BEP2" | "BNB BEACON CHAIN" => "BNB".to_string(),
        "ERC20" | "ETHEREUM" => "ETH".to_string(),
        "TRC20" | "TRON" => "TRX".to_string(),
        "ARBITRUM ONE" | "ARBITRUMONE" => "ARBITRUM".to_string(),
        "POLYGON" | "POLYGON POS" => "MATIC".to_string(),
        _ => name,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn as_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// binance, mexc and bingx all report a `networkList` array.
struct BinanceFamilyShape;

impl FeeShapeAdapter for BinanceFamilyShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        fee.info
            .get("networkList")
            .and_then(Value::as_array)
            .map(|nets| {
                nets.iter()
                    .filter_map(|n| {
                        Some(NetworkRecord {
                            network: as_str(n, "network")?.to_string(),
                            withdrawal_fee: n.get("withdrawFee").and_then(as_f64),
                            deposit_enabled: n.get("depositEnable").and_then(Value::as_bool),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// okx returns one record per chain, named "CCY-Chain", nested either directly
/// or under the currency code.
struct OkxShape;

impl FeeShapeAdapter for OkxShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        let chains = if let Some(arr) = fee.info.as_array() {
            arr.clone()
        } else {
            fee.info
                .as_object()
                .and_then(|obj| obj.values().find_map(|v| v.as_array().cloned()))
                .unwrap_or_default()
        };

        chains
            .iter()
            .filter_map(|n| {
                let chain = as_str(n, "chain")?;
                let network = chain.split('-').next_back().unwrap_or(chain);
                Some(NetworkRecord {
                    network: network.to_string(),
                    withdrawal_fee: n.get("minFee").and_then(as_f64),
                    deposit_enabled: n.get("canDep").and_then(Value::as_bool),
                })
            })
            .collect()
    }
}

/// gateio keys per-chain withdrawal fees by chain name; deposit status is a
/// currency-level "0"/"1" flag with no per-chain detail.
struct GateioShape;

impl FeeShapeAdapter for GateioShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        let deposit_enabled = match as_str(&fee.info, "deposit_disabled") {
            Some("0") => Some(true),
            Some("1") => Some(false),
            _ => None,
        };
        fee.info
            .get("withdraw_fix_on_chains")
            .and_then(Value::as_object)
            .map(|chains| {
                chains
                    .iter()
                    .map(|(chain, value)| NetworkRecord {
                        network: chain.clone(),
                        withdrawal_fee: as_f64(value),
                        deposit_enabled,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct BitgetShape;

impl FeeShapeAdapter for BitgetShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        fee.info
            .get("chains")
            .and_then(Value::as_array)
            .map(|chains| {
                chains
                    .iter()
                    .filter_map(|c| {
                        Some(NetworkRecord {
                            network: as_str(c, "chain")?.to_string(),
                            withdrawal_fee: c.get("withdrawFee").and_then(as_f64),
                            deposit_enabled: as_str(c, "rechargeable").map(|v| v == "true"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct BitmexShape;

impl FeeShapeAdapter for BitmexShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        fee.info
            .get("networks")
            .and_then(Value::as_array)
            .map(|nets| {
                nets.iter()
                    .filter_map(|n| {
                        Some(NetworkRecord {
                            network: as_str(n, "asset")?.to_string(),
                            withdrawal_fee: n.get("withdrawalFee").and_then(as_f64),
                            deposit_enabled: n.get("depositEnabled").and_then(Value::as_bool),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// poloniex reports the parent blockchain plus optional child chains, all
/// sharing the currency-level fee and deposit state.
struct PoloniexShape;

impl FeeShapeAdapter for PoloniexShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        let info = &fee.info;
        let deposit_enabled = as_str(info, "walletDepositState").map(|state| state == "ENABLED");
        let withdrawal_fee = info.get("withdrawalFee").and_then(as_f64);

        let mut records = Vec::new();
        if let Some(chain) = as_str(info, "blockchain") {
            records.push(NetworkRecord {
                network: chain.to_string(),
                withdrawal_fee,
                deposit_enabled,
            });
        }
        if let Some(children) = info.get("childChains").and_then(Value::as_array) {
            for child in children.iter().filter_map(Value::as_str) {
                records.push(NetworkRecord {
                    network: child.to_string(),
                    withdrawal_fee,
                    deposit_enabled,
                });
            }
        }
        records
    }
}

struct HuobiShape;

impl FeeShapeAdapter for HuobiShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        fee.info
            .get("chains")
            .and_then(Value::as_array)
            .map(|chains| {
                chains
                    .iter()
                    .filter_map(|c| {
                        Some(NetworkRecord {
                            network: as_str(c, "displayName")
                                .or(as_str(c, "chain"))?
                                .to_string(),
                            withdrawal_fee: c.get("transactFeeWithdraw").and_then(as_f64),
                            deposit_enabled: as_str(c, "depositStatus").map(|s| s == "allowed"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// kucoin only exposes a single chain per currency record.
struct KucoinShape;

impl FeeShapeAdapter for KucoinShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        as_str(&fee.info, "chain")
            .map(|chain| {
                vec![NetworkRecord {
                    network: chain.to_string(),
                    withdrawal_fee: fee.info.get("withdrawalMinFee").and_then(as_f64),
                    deposit_enabled: None,
                }]
            })
            .unwrap_or_default()
    }
}

struct BybitShape;

impl FeeShapeAdapter for BybitShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        fee.info
            .get("chains")
            .and_then(Value::as_array)
            .map(|chains| {
                chains
                    .iter()
                    .filter_map(|c| {
                        Some(NetworkRecord {
                            network: as_str(c, "chain")?.to_string(),
                            // bybit omits the fee on zero-fee chains.
                            withdrawal_fee: c.get("withdrawFee").and_then(as_f64).or(Some(0.0)),
                            deposit_enabled: as_str(c, "chainDeposit").map(|v| v == "1"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// No per-network detail known; just the response-level fee.
struct GenericShape;

impl FeeShapeAdapter for GenericShape {
    fn extract_networks(&self, fee: &DepositWithdrawFee) -> Vec<NetworkRecord> {
        fee.withdraw_fee
            .map(|f| {
                vec![NetworkRecord {
                    network: String::new(),
                    withdrawal_fee: Some(f),
                    deposit_enabled: None,
                }]
            })
            .unwrap_or_default()
    }
}

/// Resolves withdraw-side fees and deposit-side availability for a currency
/// moving between two exchanges, with caching in front.
pub struct NetworkFeeResolver {
    cache: Arc<MarketCache>,
}

impl NetworkFeeResolver {
    pub fn new(cache: Arc<MarketCache>) -> Self {
        Self { cache }
    }

    fn cache_key(buy: &str, sell: &str, currency: &str) -> String {
        format!("{}:{}:{}", buy, sell, currency.to_uppercase())
    }

    /// Networks usable to withdraw `currency` from `buy` and deposit on
    /// `sell`. Returns `None` when no usable data exists; provider failures
    /// never propagate. A confirmed "neither side lists this currency" is
    /// cached as absent; a transient failure on either side is not cached at
    /// all.
    pub async fn resolve(
        &self,
        currency: &str,
        buy: &Arc<RateLimitedExchange>,
        sell: &Arc<RateLimitedExchange>,
    ) -> Option<Vec<NetworkFeeEntry>> {
        let key = Self::cache_key(buy.id(), sell.id(), currency);
        if let Some(cached) = self.cache.get_network_fees(&key) {
            debug!(%key, "network fee cache hit");
            return cached;
        }

        let currency = currency.to_uppercase();
        let (buy_res, sell_res) = tokio::join!(
            buy.fetch_deposit_withdraw_fee(&currency),
            sell.fetch_deposit_withdraw_fee(&currency),
        );

        let buy_fee = Self::unpack(buy.id(), &currency, buy_res);
        let sell_fee = Self::unpack(sell.id(), &currency, sell_res);

        // Any transient failure: report nothing and leave the cache untouched
        // so the next request retries. Building a result off the surviving
        // side alone would cache fee-less entries for a full TTL window.
        if matches!(buy_fee, FeeLookup::Transient) || matches!(sell_fee, FeeLookup::Transient) {
            return None;
        }

        // BTreeMap keeps the response ordering stable across calls.
        let mut fees: BTreeMap<String, Option<f64>> = BTreeMap::new();
        let mut deposits: BTreeMap<String, Option<bool>> = BTreeMap::new();
        let mut buy_general_fee = None;

        if let FeeLookup::Found(fee) = &buy_fee {
            buy_general_fee = fee.withdraw_fee;
            for record in adapter_for(buy.id()).extract_networks(fee) {
                fees.entry(normalize_network(&record.network))
                    .or_insert(record.withdrawal_fee);
            }
        }
        if let FeeLookup::Found(fee) = &sell_fee {
            for record in adapter_for(sell.id()).extract_networks(fee) {
                deposits
                    .entry(normalize_network(&record.network))
                    .or_insert(record.deposit_enabled);
            }
        }

        let networks: Vec<String> = fees
            .keys()
            .chain(deposits.keys())
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        if networks.is_empty() {
            debug!(%key, "no transfer networks found, caching absent marker");
            self.cache.put_network_fees(&key, None);
            return None;
        }

        let entries: Vec<NetworkFeeEntry> = networks
            .into_iter()
            .map(|network| NetworkFeeEntry {
                withdrawal_fee: fees
                    .get(&network)
                    .copied()
                    .flatten()
                    .or(buy_general_fee),
                deposit_enabled: deposits.get(&network).copied().flatten(),
                network: Some(network),
            })
            .collect();

        self.cache.put_network_fees(&key, Some(entries.clone()));
        Some(entries)
    }

    fn unpack(
        exchange_id: &str,
        currency: &str,
        result: Result<DepositWithdrawFee, ExchangeError>,
    ) -> FeeLookup {
        match result {
            Ok(fee) => FeeLookup::Found(fee),
            Err(ExchangeError::Decode(msg)) => {
                debug!(exchange = exchange_id, currency, %msg, "currency has no fee data");
                FeeLookup::NotListed
            }
            Err(err) => {
                warn!(exchange = exchange_id, currency, error = %err, "fee lookup failed");
                FeeLookup::Transient
            }
        }
    }
}

enum FeeLookup {
    Found(DepositWithdrawFee),
    /// The exchange answered but does not list the currency.
    NotListed,
    /// Network/API failure; do not cache a verdict off this.
    Transient,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::cache::{CacheConfig, MarketCache};
    use crate::exchange::gateway::{RateLimitedExchange, RequestCounters};
    use crate::exchange::sim::SimExchange;

    fn gateway(sim: Arc<SimExchange>) -> Arc<RateLimitedExchange> {
        Arc::new(RateLimitedExchange::new(
            sim,
            Arc::new(RequestCounters::new()),
            Duration::from_millis(5),
        ))
    }

    fn resolver() -> NetworkFeeResolver {
        NetworkFeeResolver::new(Arc::new(MarketCache::new(CacheConfig::default())))
    }

    #[test]
    fn network_names_are_canonicalized() {
        assert_eq!(normalize_network("BEP20"), "BSC");
        assert_eq!(normalize_network("BNB Smart Chain (BEP20)"), "BSC");
        assert_eq!(normalize_network("erc20"), "ETH");
        assert_eq!(normalize_network("Tron"), "TRX");
        assert_eq!(normalize_network("SOL"), "SOL");
    }

    #[test]
    fn binance_shape_extracts_network_list() {
        let fee = DepositWithdrawFee {
            currency: "USDT".into(),
            withdraw_fee: Some(1.0),
            info: json!({
                "networkList": [
                    {"network": "BSC", "withdrawFee": "0.29", "depositEnable": true},
                    {"network": "TRX", "withdrawFee": "1.0", "depositEnable": false},
                ]
            }),
        };
        let records = adapter_for("binance").extract_networks(&fee);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].network, "BSC");
        assert_eq!(records[0].withdrawal_fee, Some(0.29));
        assert_eq!(records[1].deposit_enabled, Some(false));
    }

    #[test]
    fn okx_shape_splits_chain_suffix() {
        let fee = DepositWithdrawFee {
            currency: "USDT".into(),
            withdraw_fee: None,
            info: json!([
                {"chain": "USDT-TRC20", "minFee": "0.8", "canDep": true},
            ]),
        };
        let records = adapter_for("okx").extract_networks(&fee);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].network, "TRC20");
        assert_eq!(records[0].withdrawal_fee, Some(0.8));
    }

    #[test]
    fn gateio_shape_reads_per_chain_fees() {
        let fee = DepositWithdrawFee {
            currency: "USDT".into(),
            withdraw_fee: None,
            info: json!({
                "deposit_disabled": "0",
                "withdraw_fix_on_chains": {"BSC": "0.3", "ETH": "4.1"},
            }),
        };
        let mut records = adapter_for("gateio").extract_networks(&fee);
        records.sort_by(|a, b| a.network.cmp(&b.network));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].network, "BSC");
        assert_eq!(records[0].deposit_enabled, Some(true));
        assert_eq!(records[1].withdrawal_fee, Some(4.1));
    }

    #[test]
    fn poloniex_shape_includes_child_chains() {
        let fee = DepositWithdrawFee {
            currency: "USDT".into(),
            withdraw_fee: None,
            info: json!({
                "blockchain": "TRON",
                "childChains": ["ETH", "BSC"],
                "withdrawalFee": "1.5",
                "walletDepositState": "ENABLED",
            }),
        };
        let records = adapter_for("poloniex").extract_networks(&fee);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.withdrawal_fee == Some(1.5)));
        assert!(records.iter().all(|r| r.deposit_enabled == Some(true)));
    }

    #[test]
    fn unknown_exchange_falls_back_to_general_fee() {
        let fee = DepositWithdrawFee {
            currency: "USDT".into(),
            withdraw_fee: Some(2.5),
            info: json!({}),
        };
        let records = adapter_for("somewhere").extract_networks(&fee);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].withdrawal_fee, Some(2.5));
    }

    #[tokio::test]
    async fn merges_withdraw_and_deposit_sides() {
        let buy = Arc::new(SimExchange::new("binance"));
        buy.set_network_fee("USDT", "BSC", 0.29, false);
        let sell = Arc::new(SimExchange::new("mexc"));
        sell.set_network_fee("USDT", "BEP20", 1.0, true);

        let entries = resolver()
            .resolve("USDT", &gateway(buy), &gateway(sell))
            .await
            .expect("should resolve");

        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.network.as_deref(), Some("BSC"));
        // Fee comes from the withdraw side, deposit flag from the deposit side.
        assert_eq!(entry.withdrawal_fee, Some(0.29));
        assert_eq!(entry.deposit_enabled, Some(true));
    }

    #[tokio::test]
    async fn cache_hit_skips_provider_calls() {
        let buy = Arc::new(SimExchange::new("binance"));
        buy.set_network_fee("USDT", "BSC", 0.29, true);
        let sell = Arc::new(SimExchange::new("mexc"));
        sell.set_network_fee("USDT", "BSC", 1.0, true);

        let resolver = resolver();
        let buy_gw = gateway(buy.clone());
        let sell_gw = gateway(sell.clone());

        resolver.resolve("USDT", &buy_gw, &sell_gw).await.unwrap();
        let calls_after_first = buy.call_count() + sell.call_count();
        resolver.resolve("USDT", &buy_gw, &sell_gw).await.unwrap();
        assert_eq!(buy.call_count() + sell.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn unknown_currency_is_cached_as_absent() {
        let buy = Arc::new(SimExchange::new("binance"));
        let sell = Arc::new(SimExchange::new("mexc"));

        let resolver = resolver();
        let buy_gw = gateway(buy.clone());
        let sell_gw = gateway(sell.clone());

        assert!(resolver.resolve("NOPE", &buy_gw, &sell_gw).await.is_none());
        let calls_after_first = buy.call_count() + sell.call_count();
        // Second ask is answered by the absent marker.
        assert!(resolver.resolve("NOPE", &buy_gw, &sell_gw).await.is_none());
        assert_eq!(buy.call_count() + sell.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn transient_failures_are_not_cached() {
        let buy = Arc::new(SimExchange::new("binance"));
        buy.set_network_fee("USDT", "BSC", 0.29, true);
        let sell = Arc::new(SimExchange::new("mexc"));
        sell.set_network_fee("USDT", "BSC", 1.0, true);
        buy.fail_next(ExchangeError::Api {
            status: 500,
            body: "down".into(),
        });
        sell.fail_next(ExchangeError::Api {
            status: 500,
            body: "down".into(),
        });

        let resolver = resolver();
        let buy_gw = gateway(buy.clone());
        let sell_gw = gateway(sell.clone());

        assert!(resolver.resolve("USDT", &buy_gw, &sell_gw).await.is_none());
        // Retry succeeds once the outage clears.
        assert!(resolver.resolve("USDT", &buy_gw, &sell_gw).await.is_some());
    }

    #[tokio::test]
    async fn one_sided_transient_failure_is_not_cached() {
        let buy = Arc::new(SimExchange::new("binance"));
        buy.set_network_fee("USDT", "BSC", 0.29, true);
        let sell = Arc::new(SimExchange::new("mexc"));
        sell.set_network_fee("USDT", "BSC", 1.0, true);
        // Only the withdraw side has an outage.
        buy.fail_next(ExchangeError::Api {
            status: 500,
            body: "down".into(),
        });

        let resolver = resolver();
        let buy_gw = gateway(buy.clone());
        let sell_gw = gateway(sell.clone());

        assert!(resolver.resolve("USDT", &buy_gw, &sell_gw).await.is_none());

        // Once the outage clears, the fee comes through rather than a cached
        // fee-less entry built from the deposit side alone.
        let entries = resolver
            .resolve("USDT", &buy_gw, &sell_gw)
            .await
            .expect("should resolve after recovery");
        assert_eq!(entries[0].withdrawal_fee, Some(0.29));
    }

    #[tokio::test]
    async fn one_sided_data_still_resolves() {
        let buy = Arc::new(SimExchange::new("binance"));
        buy.set_network_fee("USDT", "TRX", 1.0, true);
        let sell = Arc::new(SimExchange::new("mexc"));

        let entries = resolver()
            .resolve("USDT", &gateway(buy), &gateway(sell))
            .await
            .expect("withdraw-side data alone is enough");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].network.as_deref(), Some("TRX"));
        assert_eq!(entries[0].deposit_enabled, None);
    }
}
