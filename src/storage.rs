//! SQLite-backed opportunity persistence.
//!
//! One live row per (buy_exchange, sell_exchange, symbol); discovery and
//! reconciliation race on the same keys, so the upsert is a single
//! `INSERT ... ON CONFLICT ... DO UPDATE` statement.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::models::{Opportunity, OpportunityFilter, OpportunitySort};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS opportunities (
    type TEXT NOT NULL,
    buy_exchange TEXT NOT NULL,
    sell_exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    profit_percentage REAL NOT NULL,
    buy_price REAL NOT NULL,
    sell_price REAL NOT NULL,
    volume REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    UNIQUE(buy_exchange, sell_exchange, symbol)
);

CREATE INDEX IF NOT EXISTS idx_opportunities_timestamp
    ON opportunities(timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_opportunities_profit
    ON opportunities(profit_percentage DESC);
"#;

pub struct OpportunityStore {
    conn: Arc<Mutex<Connection>>,
}

impl OpportunityStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM opportunities", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = db_path, existing_rows = count, "opportunity store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert, or on unique-key conflict refresh prices/volume/timestamp.
    /// Atomic at the storage layer.
    pub fn upsert(&self, op: &Opportunity) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO opportunities
             (type, buy_exchange, sell_exchange, symbol, profit_percentage,
              buy_price, sell_price, volume, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(buy_exchange, sell_exchange, symbol) DO UPDATE SET
                 profit_percentage = excluded.profit_percentage,
                 buy_price = excluded.buy_price,
                 sell_price = excluded.sell_price,
                 volume = excluded.volume,
                 timestamp = excluded.timestamp",
            params![
                &op.opportunity_type,
                &op.buy_exchange,
                &op.sell_exchange,
                &op.symbol,
                op.profit_percentage,
                op.buy_price,
                op.sell_price,
                op.min_volume,
                op.timestamp.timestamp_millis(),
            ],
        )
        .context("Failed to upsert opportunity")?;
        Ok(())
    }

    pub fn list_all(&self) -> Result<Vec<Opportunity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT type, buy_exchange, sell_exchange, symbol, profit_percentage,
                    buy_price, sell_price, volume, timestamp
             FROM opportunities",
        )?;
        let rows = stmt.query_map([], row_to_opportunity)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get(
        &self,
        buy_exchange: &str,
        sell_exchange: &str,
        symbol: &str,
    ) -> Result<Option<Opportunity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT type, buy_exchange, sell_exchange, symbol, profit_percentage,
                    buy_price, sell_price, volume, timestamp
             FROM opportunities
             WHERE buy_exchange = ?1 AND sell_exchange = ?2 AND symbol = ?3",
        )?;
        let mut rows =
            stmt.query_map(params![buy_exchange, sell_exchange, symbol], row_to_opportunity)?;
        rows.next().transpose().map_err(Into::into)
    }

    /// Filtered/sorted read for the API layer. Exchange allow-lists expand
    /// into dynamic IN clauses.
    pub fn query(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>> {
        let mut sql = String::from(
            "SELECT type, buy_exchange, sell_exchange, symbol, profit_percentage,
                    buy_price, sell_price, volume, timestamp
             FROM opportunities
             WHERE volume >= ?1 AND profit_percentage >= ?2 AND profit_percentage <= ?3",
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(filter.min_volume),
            Box::new(filter.min_percentage),
            Box::new(filter.max_percentage),
        ];

        for (column, list) in [
            ("buy_exchange", &filter.buy_exchanges),
            ("sell_exchange", &filter.sell_exchanges),
        ] {
            if !list.is_empty() {
                let placeholders: Vec<String> = list
                    .iter()
                    .map(|v| {
                        values.push(Box::new(v.to_lowercase()));
                        format!("?{}", values.len())
                    })
                    .collect();
                sql.push_str(&format!(" AND {} IN ({})", column, placeholders.join(", ")));
            }
        }

        sql.push_str(match filter.sort {
            OpportunitySort::Timestamp => " ORDER BY timestamp DESC",
            OpportunitySort::Volume => " ORDER BY volume DESC",
            OpportunitySort::SpreadAsc => " ORDER BY profit_percentage ASC",
            OpportunitySort::SpreadDesc => " ORDER BY profit_percentage DESC",
        });

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(values.iter().map(|v| v.as_ref())),
            row_to_opportunity,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Refresh a live row in place (reconciliation path).
    pub fn update_live(
        &self,
        buy_exchange: &str,
        sell_exchange: &str,
        symbol: &str,
        profit_percentage: f64,
        buy_price: f64,
        sell_price: f64,
        volume: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE opportunities SET
                 profit_percentage = ?4, buy_price = ?5, sell_price = ?6,
                 volume = ?7, timestamp = ?8
             WHERE buy_exchange = ?1 AND sell_exchange = ?2 AND symbol = ?3",
            params![
                buy_exchange,
                sell_exchange,
                symbol,
                profit_percentage,
                buy_price,
                sell_price,
                volume,
                Utc::now().timestamp_millis(),
            ],
        )
        .context("Failed to update opportunity")?;
        Ok(())
    }

    pub fn delete(&self, buy_exchange: &str, sell_exchange: &str, symbol: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM opportunities
             WHERE buy_exchange = ?1 AND sell_exchange = ?2 AND symbol = ?3",
            params![buy_exchange, sell_exchange, symbol],
        )
        .context("Failed to delete opportunity")?;
        Ok(())
    }

    /// Age-based cleanup; returns the number of rows removed.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM opportunities WHERE timestamp < ?1",
                params![cutoff.timestamp_millis()],
            )
            .context("Failed to clean up expired opportunities")?;
        if removed > 0 {
            info!(removed, "cleaned up expired opportunities");
        } else {
            debug!("no expired opportunities to clean up");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM opportunities", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn row_to_opportunity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Opportunity> {
    let symbol: String = row.get(3)?;
    let buy_exchange: String = row.get(1)?;
    let sell_exchange: String = row.get(2)?;
    let millis: i64 = row.get(8)?;
    Ok(Opportunity {
        opportunity_type: row.get(0)?,
        path: vec![
            format!("{} on {}", symbol, buy_exchange),
            format!("{} on {}", symbol, sell_exchange),
        ],
        buy_exchange,
        sell_exchange,
        symbol,
        profit_percentage: row.get(4)?,
        buy_price: row.get(5)?,
        sell_price: row.get(6)?,
        min_volume: row.get(7)?,
        timestamp: Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn store() -> (OpportunityStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = OpportunityStore::new(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }

    fn op(buy: &str, sell: &str, symbol: &str, profit: f64, volume: f64) -> Opportunity {
        Opportunity::cross_exchange(
            symbol.to_string(),
            buy.to_string(),
            sell.to_string(),
            100.0,
            100.0 * (1.0 + profit / 100.0),
            profit,
            volume,
        )
    }

    #[test]
    fn upsert_is_idempotent_per_key() {
        let (store, _file) = store();
        store.upsert(&op("binance", "okx", "BTC/USDT", 1.0, 500.0)).unwrap();
        store.upsert(&op("binance", "okx", "BTC/USDT", 2.5, 700.0)).unwrap();

        assert_eq!(store.len(), 1);
        let row = store.get("binance", "okx", "BTC/USDT").unwrap().unwrap();
        assert_eq!(row.profit_percentage, 2.5);
        assert_eq!(row.min_volume, 700.0);
    }

    #[test]
    fn reversed_exchange_pairs_are_distinct_rows() {
        let (store, _file) = store();
        store.upsert(&op("binance", "okx", "BTC/USDT", 1.0, 500.0)).unwrap();
        store.upsert(&op("okx", "binance", "BTC/USDT", 1.0, 500.0)).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn delete_removes_only_the_keyed_row() {
        let (store, _file) = store();
        store.upsert(&op("binance", "okx", "BTC/USDT", 1.0, 500.0)).unwrap();
        store.upsert(&op("binance", "okx", "ETH/USDT", 1.0, 500.0)).unwrap();

        store.delete("binance", "okx", "BTC/USDT").unwrap();
        assert!(store.get("binance", "okx", "BTC/USDT").unwrap().is_none());
        assert!(store.get("binance", "okx", "ETH/USDT").unwrap().is_some());
    }

    #[test]
    fn cleanup_removes_aged_rows_regardless_of_profit() {
        let (store, _file) = store();
        let mut old = op("binance", "okx", "BTC/USDT", 50.0, 500.0);
        old.timestamp = Utc::now() - ChronoDuration::minutes(45);
        store.upsert(&old).unwrap();
        store.upsert(&op("binance", "okx", "ETH/USDT", 1.0, 500.0)).unwrap();

        let cutoff = Utc::now() - ChronoDuration::minutes(30);
        let removed = store.delete_older_than(cutoff).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("binance", "okx", "BTC/USDT").unwrap().is_none());
    }

    #[test]
    fn query_applies_filters_and_sort() {
        let (store, _file) = store();
        store.upsert(&op("binance", "okx", "BTC/USDT", 3.0, 900.0)).unwrap();
        store.upsert(&op("okx", "bybit", "ETH/USDT", 1.0, 100.0)).unwrap();
        store.upsert(&op("bybit", "binance", "SOL/USDT", 9.0, 500.0)).unwrap();

        let filter = OpportunityFilter {
            min_volume: 200.0,
            min_percentage: 0.5,
            max_percentage: 100.0,
            sort: OpportunitySort::SpreadDesc,
            ..Default::default()
        };
        let rows = store.query(&filter).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol, "SOL/USDT");
        assert_eq!(rows[1].symbol, "BTC/USDT");

        let filter = OpportunityFilter {
            buy_exchanges: vec!["binance".to_string()],
            sell_exchanges: vec!["okx".to_string()],
            ..Default::default()
        };
        let rows = store.query(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTC/USDT");
    }

    #[test]
    fn update_live_refreshes_prices_in_place() {
        let (store, _file) = store();
        store.upsert(&op("binance", "okx", "BTC/USDT", 1.0, 500.0)).unwrap();
        store
            .update_live("binance", "okx", "BTC/USDT", 1.8, 101.0, 102.8, 650.0)
            .unwrap();

        assert_eq!(store.len(), 1);
        let row = store.get("binance", "okx", "BTC/USDT").unwrap().unwrap();
        assert_eq!(row.profit_percentage, 1.8);
        assert_eq!(row.buy_price, 101.0);
        assert_eq!(row.min_volume, 650.0);
    }
}
