//! Rate-limit-aware exchange access.
//!
//! [`RateLimitedExchange`] implements the same capability as the raw connector
//! and delegates with retry logic: an explicit decorator rather than patched
//! methods. Every call increments the exchange's request counter first; a
//! rate-limit failure waits out a fixed cooldown and retries the operation
//! exactly once, and any second or non-rate-limit failure propagates.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::{DepositWithdrawFee, ExchangeConnector, ExchangeError, Market, Ticker};

/// Per-exchange monotonic counters of outbound calls. Diagnostic only: logged
/// once per discovery cycle, then reset.
#[derive(Default)]
pub struct RequestCounters {
    counts: Mutex<HashMap<String, u64>>,
}

impl RequestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, exchange_id: &str) {
        *self.counts.lock().entry(exchange_id.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts.lock().clone()
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

pub struct RateLimitedExchange {
    inner: Arc<dyn ExchangeConnector>,
    counters: Arc<RequestCounters>,
    cooldown: Duration,
}

impl RateLimitedExchange {
    pub fn new(
        inner: Arc<dyn ExchangeConnector>,
        counters: Arc<RequestCounters>,
        cooldown: Duration,
    ) -> Self {
        Self {
            inner,
            counters,
            cooldown,
        }
    }

    async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.counters.increment(self.inner.id());

        match op().await {
            Err(ExchangeError::RateLimited(msg)) => {
                warn!(
                    exchange = self.inner.id(),
                    cooldown_secs = self.cooldown.as_secs(),
                    %msg,
                    "rate limit hit, waiting before retrying"
                );
                tokio::time::sleep(self.cooldown).await;
                info!(exchange = self.inner.id(), "resuming after rate limit cooldown");
                op().await
            }
            other => other,
        }
    }
}

#[async_trait]
impl ExchangeConnector for RateLimitedExchange {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn load_markets(&self) -> Result<HashMap<String, Market>, ExchangeError> {
        self.execute(|| self.inner.load_markets()).await
    }

    async fn fetch_tickers(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<HashMap<String, Ticker>, ExchangeError> {
        self.execute(|| self.inner.fetch_tickers(symbols)).await
    }

    async fn fetch_deposit_withdraw_fee(
        &self,
        currency: &str,
    ) -> Result<DepositWithdrawFee, ExchangeError> {
        self.execute(|| self.inner.fetch_deposit_withdraw_fee(currency))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::sim::SimExchange;

    fn gateway(sim: Arc<SimExchange>) -> RateLimitedExchange {
        RateLimitedExchange::new(sim, Arc::new(RequestCounters::new()), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn retries_once_after_rate_limit() {
        let sim = Arc::new(SimExchange::with_demo_markets("sim"));
        sim.fail_next(ExchangeError::RateLimited("429".into()));

        let gw = gateway(sim.clone());
        let markets = gw.load_markets().await.expect("retry should succeed");
        assert!(!markets.is_empty());
        // One failing call plus one successful retry.
        assert_eq!(sim.call_count(), 2);
    }

    #[tokio::test]
    async fn second_rate_limit_propagates() {
        let sim = Arc::new(SimExchange::with_demo_markets("sim"));
        sim.fail_next(ExchangeError::RateLimited("429".into()));
        sim.fail_next(ExchangeError::RateLimited("429 again".into()));

        let gw = gateway(sim.clone());
        let err = gw.load_markets().await.unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(sim.call_count(), 2);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_propagate_immediately() {
        let sim = Arc::new(SimExchange::with_demo_markets("sim"));
        sim.fail_next(ExchangeError::Api {
            status: 500,
            body: "boom".into(),
        });

        let gw = gateway(sim.clone());
        let err = gw.load_markets().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Api { status: 500, .. }));
        assert_eq!(sim.call_count(), 1);
    }

    #[tokio::test]
    async fn every_call_increments_the_counter() {
        let sim = Arc::new(SimExchange::with_demo_markets("sim"));
        let counters = Arc::new(RequestCounters::new());
        let gw = RateLimitedExchange::new(sim, counters.clone(), Duration::from_millis(5));

        gw.load_markets().await.unwrap();
        gw.fetch_tickers(None).await.unwrap();

        assert_eq!(counters.snapshot().get("sim"), Some(&2));
        counters.reset();
        assert!(counters.snapshot().is_empty());
    }
}
