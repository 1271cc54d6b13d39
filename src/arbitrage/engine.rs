//! Cross-exchange matching.
//!
//! Given current per-exchange prices grouped by normalized symbol, emits every
//! (symbol, buy exchange, sell exchange) triple whose spread lands inside the
//! configured profit band. O(E²) per symbol where E is the number of exchanges
//! quoting it; E is small, so the dominant cost is upstream ticker fetching.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::models::{Opportunity, PriceData};

/// One exchange's contribution to a normalized symbol.
#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub exchange_id: String,
    pub original_symbol: String,
    pub price: PriceData,
}

pub struct OpportunityEngine {
    min_profit_threshold: f64,
    max_profit_threshold: f64,
}

impl OpportunityEngine {
    pub fn new(min_profit_threshold: f64, max_profit_threshold: f64) -> Self {
        Self {
            min_profit_threshold,
            max_profit_threshold,
        }
    }

    /// Every profitable buy-on-i / sell-on-j pairing across the grouped
    /// quotes. The profit band is strictly exclusive on both ends; boundary
    /// values are not emitted. Results come back sorted by minimum leg volume,
    /// descending.
    pub fn find_cross_exchange(
        &self,
        quotes_by_symbol: &HashMap<String, Vec<PriceQuote>>,
    ) -> Vec<Opportunity> {
        debug!("searching for cross-exchange opportunities");
        let mut opportunities = Vec::new();

        for (symbol, quotes) in quotes_by_symbol {
            if quotes.len() < 2 {
                continue;
            }

            for buy in quotes {
                for sell in quotes {
                    // Grouping guarantees one quote per exchange, so this also
                    // rules out duplicate (buy, sell, symbol) keys per cycle.
                    if buy.exchange_id == sell.exchange_id {
                        continue;
                    }

                    let buy_price = buy.price.ask;
                    let sell_price = sell.price.bid;
                    let profit = sell_price / buy_price - 1.0;

                    if profit > self.min_profit_threshold && profit < self.max_profit_threshold {
                        let opportunity = Opportunity::cross_exchange(
                            symbol.clone(),
                            buy.exchange_id.clone(),
                            sell.exchange_id.clone(),
                            buy_price,
                            sell_price,
                            profit * 100.0,
                            buy.price.volume.min(sell.price.volume),
                        );
                        info!(
                            symbol = %symbol,
                            buy = %buy.exchange_id,
                            sell = %sell.exchange_id,
                            profit_pct = format!("{:.2}", opportunity.profit_percentage),
                            "found cross-exchange opportunity"
                        );
                        opportunities.push(opportunity);
                    }
                }
            }
        }

        info!(count = opportunities.len(), "cross-exchange search complete");
        opportunities.sort_by(|a, b| {
            b.min_volume
                .partial_cmp(&a.min_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        opportunities
    }
}
