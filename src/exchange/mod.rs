//! Exchange integrations for the rebalancer.
//!
//! ## Gateways
//! The strategy consumes two traits:
//! - `MarketDataGate`: instrument metadata, candles, tickers
//! - `ExecutionGateway`: positions, open orders, order placement, leverage
//!
//! ## Implementations
//! - `BinanceClient`: USDⓈ-M perpetual futures over REST
//! - `PaperExchange`: in-memory fills for paper trading and tests

mod client;
mod error;
pub mod mock;
mod retry;
mod traits;
mod types;

pub use client::BinanceClient;
pub use error::GatewayError;
pub use mock::PaperExchange;
pub use retry::{retry_read, RetryPolicy};
pub use traits::{ExecutionGateway, GatewayResult, MarketDataGate};
#[cfg(test)]
pub use traits::{MockExecutionGateway, MockMarketDataGate};
pub use types::*;
