//! # Swap Momentum
//!
//! A periodic cross-sectional momentum rebalancer for perpetual swaps.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Gateway traits, Binance USDⓈ-M client, paper exchange
//! - `strategy`: Scoring, selection, reconciliation, sizing, execution, scheduling
//! - `persistence`: SQLite cycle journal
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
