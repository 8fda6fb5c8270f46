//! Multi-site product matching and price history.
//!
//! Scraped listings are normalized, matched into canonical products,
//! resolved into purchasable variants and priced over time in an
//! append-only ledger.

pub mod alerts;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod matcher;
pub mod models;
pub mod normalizer;
pub mod resolver;
pub mod service;
pub mod tracker;
pub mod traits;

pub use config::TrackerConfig;
pub use tracker::{IngestReport, PriceTracker};
