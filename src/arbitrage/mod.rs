//! Cross-exchange opportunity detection.

pub mod engine;

pub use engine::{OpportunityEngine, PriceQuote};
