//! Cross-exchange arbitrage scanner.
//!
//! Periodically pulls spot tickers from a set of exchanges, matches them for
//! price spreads inside a configured profit band, persists the live
//! opportunity set to SQLite and serves it over HTTP.

pub mod api;
pub mod arbitrage;
pub mod bot;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod exchange;
pub mod models;
pub mod network_fees;
pub mod storage;
