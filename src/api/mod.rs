//! HTTP API.
//!
//! Read-only view over the persisted opportunity set plus the network fee
//! resolver. All handlers are thin: parse the query, call into the shared
//! state, shape the response.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cache::MarketCache;
use crate::exchange::gateway::{RateLimitedExchange, RequestCounters};
use crate::models::{OpportunityFilter, OpportunitySort};
use crate::network_fees::NetworkFeeResolver;
use crate::storage::OpportunityStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<OpportunityStore>,
    pub resolver: Arc<NetworkFeeResolver>,
    pub counters: Arc<RequestCounters>,
    pub cache: Arc<MarketCache>,
    pub exchanges: Arc<HashMap<String, Arc<RateLimitedExchange>>>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/opportunities", get(list_opportunities))
        .route("/opportunity", get(get_opportunity))
        .route("/active-exchanges", get(active_exchanges))
        .route("/opportunity-network-and-fee", get(network_and_fee))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpportunitiesQuery {
    sort_by: Option<OpportunitySort>,
    min_volume: Option<f64>,
    min_percentage: Option<f64>,
    max_percentage: Option<f64>,
    /// Comma-separated exchange ids.
    buy_exchanges: Option<String>,
    sell_exchanges: Option<String>,
}

fn csv_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn build_filter(query: &OpportunitiesQuery) -> OpportunityFilter {
    OpportunityFilter {
        min_volume: query.min_volume.unwrap_or(0.0),
        // Sub-half-percent spreads are noise for the UI unless asked for.
        min_percentage: query.min_percentage.unwrap_or(0.5),
        max_percentage: query.max_percentage.unwrap_or(100.0),
        buy_exchanges: csv_list(query.buy_exchanges.as_deref()),
        sell_exchanges: csv_list(query.sell_exchanges.as_deref()),
        sort: query.sort_by.unwrap_or_default(),
    }
}

async fn list_opportunities(
    State(state): State<AppState>,
    Query(query): Query<OpportunitiesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = build_filter(&query);
    let rows = state.store.query(&filter)?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpportunityQuery {
    symbol: String,
    buy_exchange: String,
    sell_exchange: String,
}

/// Single-row lookup by persistence key. Responds with `null` when no live
/// row matches, not a 404; absence is a normal answer here.
async fn get_opportunity(
    State(state): State<AppState>,
    Query(query): Query<OpportunityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let row = state.store.get(
        &query.buy_exchange.to_lowercase(),
        &query.sell_exchange.to_lowercase(),
        &query.symbol,
    )?;
    Ok(Json(row))
}

async fn active_exchanges(State(state): State<AppState>) -> Json<Vec<String>> {
    let mut ids: Vec<String> = state.exchanges.keys().map(|id| id.to_uppercase()).collect();
    ids.sort();
    Json(ids)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkFeeQuery {
    coin_to_withdraw: Option<String>,
    buy_exchange: Option<String>,
    sell_exchange: Option<String>,
}

async fn network_and_fee(
    State(state): State<AppState>,
    Query(query): Query<NetworkFeeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (Some(currency), Some(buy_id), Some(sell_id)) = (
        query.coin_to_withdraw.as_deref(),
        query.buy_exchange.as_deref(),
        query.sell_exchange.as_deref(),
    ) else {
        return Err(ApiError::BadRequest(
            "coinToWithdraw, buyExchange and sellExchange are required".to_string(),
        ));
    };

    let buy = state
        .exchanges
        .get(&buy_id.to_lowercase())
        .ok_or_else(|| ApiError::BadRequest(format!("unknown exchange: {buy_id}")))?;
    let sell = state
        .exchanges
        .get(&sell_id.to_lowercase())
        .ok_or_else(|| ApiError::BadRequest(format!("unknown exchange: {sell_id}")))?;

    let entries = state.resolver.resolve(currency, buy, sell).await;
    Ok(Json(entries))
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "requests": state.counters.snapshot(),
        "cache": state.cache.stats(),
        "opportunities": state.store.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_hide_sub_half_percent_spreads() {
        let filter = build_filter(&OpportunitiesQuery::default());
        assert_eq!(filter.min_percentage, 0.5);
        assert_eq!(filter.max_percentage, 100.0);
        assert_eq!(filter.min_volume, 0.0);
        assert_eq!(filter.sort, OpportunitySort::Timestamp);
        assert!(filter.buy_exchanges.is_empty());
    }

    #[test]
    fn exchange_lists_are_parsed_and_lowercased() {
        let query = OpportunitiesQuery {
            buy_exchanges: Some("Binance, OKX,,".to_string()),
            sell_exchanges: Some("bybit".to_string()),
            ..Default::default()
        };
        let filter = build_filter(&query);
        assert_eq!(filter.buy_exchanges, vec!["binance", "okx"]);
        assert_eq!(filter.sell_exchanges, vec!["bybit"]);
    }

    #[test]
    fn sort_keys_deserialize_from_query_values() {
        let query: OpportunitiesQuery =
            serde_urlencoded::from_str("sortBy=spread_desc&minPercentage=1.5").unwrap();
        assert_eq!(query.sort_by, Some(OpportunitySort::SpreadDesc));
        assert_eq!(query.min_percentage, Some(1.5));
    }
}
