//! Binance REST connector.
//!
//! The one bundled concrete implementation of [`ExchangeConnector`]. Market
//! and ticker data use the public REST API; deposit/withdraw fee metadata
//! comes from the HMAC-signed `capital/config/getall` endpoint and therefore
//! requires API credentials.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use super::{DepositWithdrawFee, ExchangeConnector, ExchangeError, Market, Ticker};
use crate::config::ExchangeCredentials;

const BINANCE_API_BASE: &str = "https://api.binance.com";

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceConnector {
    client: Client,
    base_url: String,
    credentials: ExchangeCredentials,
    /// Raw symbol ("BTCUSDT") -> unified symbol ("BTC/USDT") and the reverse,
    /// both built by `load_markets`. Ticker responses only carry the raw form;
    /// filtered fetches need the reverse direction.
    symbol_map: RwLock<HashMap<String, String>>,
    raw_by_unified: RwLock<HashMap<String, String>>,
}

impl BinanceConnector {
    pub fn new(credentials: ExchangeCredentials) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            base_url: BINANCE_API_BASE.to_string(),
            credentials,
            symbol_map: RwLock::new(HashMap::new()),
            raw_by_unified: RwLock::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(credentials: ExchangeCredentials, base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            credentials,
            symbol_map: RwLock::new(HashMap::new()),
            raw_by_unified: RwLock::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Maps HTTP-level failures into the error taxonomy. Binance signals rate
    /// limiting with 429 (and 418 once a ban kicks in).
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ExchangeError> {
        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExchangeError::RateLimited(body));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    fn unify(&self, raw_symbol: &str) -> String {
        self.symbol_map
            .read()
            .get(raw_symbol)
            .cloned()
            .unwrap_or_else(|| raw_symbol.to_string())
    }

    /// Raw forms for the requested unified symbols; unknown symbols drop out.
    fn raw_symbols_for(&self, unified: &[String]) -> Vec<String> {
        let map = self.raw_by_unified.read();
        unified.iter().filter_map(|u| map.get(u).cloned()).collect()
    }

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let secret = self
            .credentials
            .secret
            .as_deref()
            .ok_or(ExchangeError::MissingCredentials)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::Decode(format!("HMAC key error: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    status: String,
    #[serde(default)]
    is_spot_trading_allowed: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    bid_price: String,
    ask_price: String,
    quote_volume: String,
}

fn parse_price(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|p| p.is_finite() && *p > 0.0)
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn id(&self) -> &str {
        "binance"
    }

    async fn load_markets(&self) -> Result<HashMap<String, Market>, ExchangeError> {
        let resp = self
            .client
            .get(self.url("/api/v3/exchangeInfo"))
            .send()
            .await?;
        let info: ExchangeInfo = Self::check_status(resp).await?.json().await?;

        let mut markets = HashMap::with_capacity(info.symbols.len());
        let mut symbol_map = HashMap::with_capacity(info.symbols.len());
        let mut raw_by_unified = HashMap::with_capacity(info.symbols.len());
        for s in info.symbols {
            if s.status != "TRADING" {
                continue;
            }
            let unified = format!("{}/{}", s.base_asset, s.quote_asset);
            raw_by_unified.insert(unified.clone(), s.symbol.clone());
            symbol_map.insert(s.symbol, unified.clone());
            markets.insert(
                unified.clone(),
                Market {
                    symbol: unified,
                    market_type: if s.is_spot_trading_allowed {
                        "spot".to_string()
                    } else {
                        "other".to_string()
                    },
                },
            );
        }
        *self.symbol_map.write() = symbol_map;
        *self.raw_by_unified.write() = raw_by_unified;
        Ok(markets)
    }

    async fn fetch_tickers(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<HashMap<String, Ticker>, ExchangeError> {
        let mut request = self.client.get(self.url("/api/v3/ticker/24hr"));

        if let Some(wanted) = symbols {
            // The endpoint takes raw symbols as a JSON array query param.
            let raw = self.raw_symbols_for(wanted);
            if raw.is_empty() {
                return Ok(HashMap::new());
            }
            request = request.query(&[("symbols", json!(raw).to_string())]);
        }

        let resp = request.send().await?;
        let rows: Vec<Ticker24h> = Self::check_status(resp).await?.json().await?;

        let mut tickers = HashMap::with_capacity(rows.len());
        for row in rows {
            let unified = self.unify(&row.symbol);
            tickers.insert(
                unified.clone(),
                Ticker {
                    symbol: unified,
                    bid: parse_price(&row.bid_price),
                    ask: parse_price(&row.ask_price),
                    quote_volume: row.quote_volume.parse::<f64>().ok(),
                },
            );
        }
        Ok(tickers)
    }

    async fn fetch_deposit_withdraw_fee(
        &self,
        currency: &str,
    ) -> Result<DepositWithdrawFee, ExchangeError> {
        let api_key = self
            .credentials
            .api_key
            .as_deref()
            .ok_or(ExchangeError::MissingCredentials)?;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let query = format!("timestamp={timestamp}");
        let signature = self.sign(&query)?;

        let resp = self
            .client
            .get(self.url("/sapi/v1/capital/config/getall"))
            .header("X-MBX-APIKEY", api_key)
            .query(&[
                ("timestamp", timestamp.to_string()),
                ("signature", signature),
            ])
            .send()
            .await?;
        let coins: Vec<Value> = Self::check_status(resp).await?.json().await?;

        let coin = coins
            .iter()
            .find(|c| c.get("coin").and_then(Value::as_str) == Some(currency))
            .cloned()
            .ok_or_else(|| ExchangeError::Decode(format!("currency {currency} not listed")))?;

        // First network's fee doubles as the response-level fallback.
        let withdraw_fee = coin
            .get("networkList")
            .and_then(Value::as_array)
            .and_then(|nets| nets.first())
            .and_then(|n| n.get("withdrawFee"))
            .and_then(|f| f.as_str().and_then(|s| s.parse::<f64>().ok()).or(f.as_f64()));

        Ok(DepositWithdrawFee {
            currency: currency.to_string(),
            withdraw_fee,
            info: coin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_price_rejects_zero_and_garbage() {
        assert_eq!(parse_price("64000.10"), Some(64000.10));
        assert_eq!(parse_price("0.00000000"), None);
        assert_eq!(parse_price("not-a-price"), None);
    }

    #[test]
    fn filtered_fetch_maps_unified_symbols_through_the_reverse_index() {
        let connector =
            BinanceConnector::with_base_url(ExchangeCredentials::default(), "http://x".into());
        {
            let mut map = connector.raw_by_unified.write();
            map.insert("BTC/USDT".into(), "BTCUSDT".into());
            map.insert("ETH/USDT".into(), "ETHUSDT".into());
        }

        let raw = connector.raw_symbols_for(&["BTC/USDT".to_string(), "SOL/USDT".to_string()]);
        assert_eq!(raw, vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn signing_requires_secret() {
        let connector =
            BinanceConnector::with_base_url(ExchangeCredentials::default(), "http://x".into());
        assert!(matches!(
            connector.sign("timestamp=1"),
            Err(ExchangeError::MissingCredentials)
        ));
    }

    #[test]
    fn signature_is_hex_encoded_hmac() {
        let connector = BinanceConnector::with_base_url(
            ExchangeCredentials {
                api_key: Some("key".into()),
                secret: Some("secret".into()),
                password: None,
            },
            "http://x".into(),
        );
        let sig = connector.sign("timestamp=1700000000000").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
