//! Venue-agnostic gateway traits.
//!
//! The strategy only talks to an exchange through these two seams:
//! - `MarketDataGate` for instrument metadata, candles and tickers
//! - `ExecutionGateway` for positions, open orders and order placement
//!
//! `BinanceClient` implements both against the live venue; `PaperExchange`
//! implements both in memory for paper trading and tests.

use super::error::GatewayError;
use super::types::*;
use async_trait::async_trait;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Source of market data.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataGate: Send + Sync {
    /// Precision metadata for every tradable perpetual contract.
    async fn fetch_instruments(&self) -> GatewayResult<Vec<InstrumentSpec>>;

    /// Most recent `limit` candles, oldest first.
    async fn fetch_candles(
        &self,
        instrument: &Instrument,
        timeframe: &str,
        limit: usize,
    ) -> GatewayResult<CandleSeries>;

    async fn fetch_ticker(&self, instrument: &Instrument) -> GatewayResult<Ticker>;
}

/// Account and order operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Non-zero positions matching the filter.
    async fn fetch_positions(&self, filter: &PositionFilter) -> GatewayResult<Vec<LivePosition>>;

    async fn fetch_open_orders(&self) -> GatewayResult<Vec<OpenOrder>>;

    async fn cancel_order(&self, order_id: &str, instrument: &Instrument) -> GatewayResult<()>;

    async fn place_market_order(&self, order: &MarketOrder) -> GatewayResult<OrderReceipt>;

    async fn set_leverage(
        &self,
        instrument: &Instrument,
        leverage: u8,
        margin_mode: MarginMode,
    ) -> GatewayResult<()>;
}
