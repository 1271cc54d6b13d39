use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use arbibot_backend::api::{self, AppState};
use arbibot_backend::bot::ArbitrageBot;
use arbibot_backend::cache::{CacheConfig, MarketCache};
use arbibot_backend::config::{configured_exchanges, BotConfig, ExchangeCredentials};
use arbibot_backend::exchange::build_connector;
use arbibot_backend::exchange::gateway::{RateLimitedExchange, RequestCounters};
use arbibot_backend::network_fees::NetworkFeeResolver;
use arbibot_backend::storage::OpportunityStore;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbibot_backend=debug,tower_http=info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = BotConfig::from_env();
    let counters = Arc::new(RequestCounters::new());

    let mut gateways: HashMap<String, Arc<RateLimitedExchange>> = HashMap::new();
    for exchange_id in configured_exchanges() {
        let credentials = ExchangeCredentials::from_env(&exchange_id);
        if !credentials.is_complete() {
            warn!(
                exchange = %exchange_id,
                "no API credentials, fee endpoints will be unavailable"
            );
        }
        match build_connector(&exchange_id, credentials) {
            Ok(connector) => {
                gateways.insert(
                    exchange_id,
                    Arc::new(RateLimitedExchange::new(
                        connector,
                        counters.clone(),
                        config.rate_limit_cooldown,
                    )),
                );
            }
            Err(e) => warn!(exchange = %exchange_id, error = %e, "skipping exchange"),
        }
    }
    if gateways.is_empty() {
        bail!("no usable exchanges configured, set ARBIBOT_EXCHANGES");
    }
    info!(exchanges = ?gateways.keys().collect::<Vec<_>>(), "exchanges initialized");

    let cache = Arc::new(MarketCache::new(CacheConfig {
        price_ttl: config.price_cache_ttl,
        network_fee_ttl: config.network_fee_cache_ttl,
        ..CacheConfig::default()
    }));

    let db_path = env::var("DB_PATH").unwrap_or_else(|_| "opportunities.db".to_string());
    let store = Arc::new(OpportunityStore::new(&db_path)?);

    let bot = Arc::new(ArbitrageBot::new(
        gateways.clone(),
        cache.clone(),
        store.clone(),
        counters.clone(),
        config,
    ));

    // Log the live opportunity feed.
    let mut events = bot.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(op) => info!(
                    symbol = %op.symbol,
                    buy = %op.buy_exchange,
                    sell = %op.sell_exchange,
                    profit_pct = format!("{:.2}", op.profit_percentage),
                    "new opportunity"
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "opportunity feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    bot.spawn_all(&shutdown_tx);

    let state = AppState {
        store,
        resolver: Arc::new(NetworkFeeResolver::new(cache.clone())),
        counters,
        cache,
        exchanges: Arc::new(gateways),
    };
    let app = api::router(state);

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Resolves on ctrl-c and tells the background loops to stop before the
/// server begins draining connections.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received, stopping background loops");
    let _ = shutdown_tx.send(());
}
