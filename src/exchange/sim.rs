//! Scriptable in-memory exchange.
//!
//! Stands in for a real connector in tests and dry runs: markets, tickers and
//! fee payloads are plain maps, and failures can be queued to exercise the
//! gateway's recovery paths.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{DepositWithdrawFee, ExchangeConnector, ExchangeError, Market, Ticker};

pub struct SimExchange {
    id: String,
    markets: Mutex<HashMap<String, Market>>,
    tickers: Mutex<HashMap<String, Ticker>>,
    fees: Mutex<HashMap<String, DepositWithdrawFee>>,
    fail_queue: Mutex<VecDeque<ExchangeError>>,
    calls: Mutex<u64>,
}

impl SimExchange {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            markets: Mutex::new(HashMap::new()),
            tickers: Mutex::new(HashMap::new()),
            fees: Mutex::new(HashMap::new()),
            fail_queue: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    /// A simulator preloaded with a couple of liquid spot pairs.
    pub fn with_demo_markets(id: &str) -> Self {
        let sim = Self::new(id);
        sim.set_spot_market("BTC/USDT", 64000.0, 64010.0, 1_500_000.0);
        sim.set_spot_market("ETH/USDT", 3200.0, 3201.0, 800_000.0);
        sim
    }

    /// Adds a spot market together with its ticker.
    pub fn set_spot_market(&self, symbol: &str, bid: f64, ask: f64, quote_volume: f64) {
        self.markets.lock().insert(
            symbol.to_string(),
            Market {
                symbol: symbol.to_string(),
                market_type: "spot".to_string(),
            },
        );
        self.tickers.lock().insert(
            symbol.to_string(),
            Ticker {
                symbol: symbol.to_string(),
                bid: Some(bid),
                ask: Some(ask),
                quote_volume: Some(quote_volume),
            },
        );
    }

    pub fn set_market(&self, symbol: &str, market_type: &str) {
        self.markets.lock().insert(
            symbol.to_string(),
            Market {
                symbol: symbol.to_string(),
                market_type: market_type.to_string(),
            },
        );
    }

    pub fn set_ticker(&self, symbol: &str, ticker: Ticker) {
        self.tickers.lock().insert(symbol.to_string(), ticker);
    }

    pub fn remove_ticker(&self, symbol: &str) {
        self.tickers.lock().remove(symbol);
    }

    /// Installs a binance-shaped fee payload for `currency` with one network.
    pub fn set_network_fee(
        &self,
        currency: &str,
        network: &str,
        withdraw_fee: f64,
        deposit_enabled: bool,
    ) {
        self.fees.lock().insert(
            currency.to_string(),
            DepositWithdrawFee {
                currency: currency.to_string(),
                withdraw_fee: Some(withdraw_fee),
                info: json!({
                    "networkList": [{
                        "network": network,
                        "withdrawFee": withdraw_fee.to_string(),
                        "depositEnable": deposit_enabled,
                    }]
                }),
            },
        );
    }

    /// Queues an error; the next call (in FIFO order across all operations)
    /// fails with it.
    pub fn fail_next(&self, err: ExchangeError) {
        self.fail_queue.lock().push_back(err);
    }

    pub fn call_count(&self) -> u64 {
        *self.calls.lock()
    }

    fn record_call(&self) -> Result<(), ExchangeError> {
        *self.calls.lock() += 1;
        if let Some(err) = self.fail_queue.lock().pop_front() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeConnector for SimExchange {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_markets(&self) -> Result<HashMap<String, Market>, ExchangeError> {
        self.record_call()?;
        Ok(self.markets.lock().clone())
    }

    async fn fetch_tickers(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<HashMap<String, Ticker>, ExchangeError> {
        self.record_call()?;
        let tickers = self.tickers.lock();
        match symbols {
            None => Ok(tickers.clone()),
            Some(wanted) => Ok(wanted
                .iter()
                .filter_map(|s| tickers.get(s).map(|t| (s.clone(), t.clone())))
                .collect()),
        }
    }

    async fn fetch_deposit_withdraw_fee(
        &self,
        currency: &str,
    ) -> Result<DepositWithdrawFee, ExchangeError> {
        self.record_call()?;
        self.fees
            .lock()
            .get(currency)
            .cloned()
            .ok_or_else(|| ExchangeError::Decode(format!("no fee data for {currency}")))
    }
}
