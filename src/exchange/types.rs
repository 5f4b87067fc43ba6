//! Exchange-facing domain types shared by the gateways and the strategy.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A perpetual-swap contract identified by its exchange-native symbol (e.g. "BTCUSDT").
///
/// The symbol is the only identity used anywhere in the engine: configured universe entries,
/// candle series, targets and live positions are all matched by exact symbol equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into().trim().to_uppercase())
    }

    pub fn symbol(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instrument {
    fn from(symbol: &str) -> Self {
        Self::new(symbol)
    }
}

/// Precision metadata for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSpec {
    pub instrument: Instrument,
    /// Minimum price increment
    pub price_step: Decimal,
    /// Minimum quantity increment, in contracts
    pub amount_step: Decimal,
    /// Minimum order size, in contracts
    pub min_amount: Decimal,
    /// Minimum order notional in quote currency (zero when the venue has none)
    pub min_notional: Decimal,
    /// Underlying quantity represented by one contract
    pub contract_multiplier: Decimal,
}

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    /// Bar open time, milliseconds since epoch
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Ordered candles for one instrument and timeframe.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleSeries {
    pub instrument: Instrument,
    pub timeframe: String,
    pub candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(instrument: Instrument, timeframe: impl Into<String>, candles: Vec<Candle>) -> Self {
        Self {
            instrument,
            timeframe: timeframe.into(),
            candles,
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }

    /// True when timestamps are strictly increasing (no duplicates, no reordering).
    pub fn is_strictly_increasing(&self) -> bool {
        self.candles
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp)
    }
}

/// Latest traded price for an instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub instrument: Instrument,
    pub last_price: Decimal,
}

/// Side of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens exposure on this side.
    pub fn opening_order(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces exposure on this side.
    pub fn closing_order(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// A position held on the exchange, as reported by the latest fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct LivePosition {
    pub instrument: Instrument,
    pub side: PositionSide,
    /// Always positive, in contracts
    pub contracts: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
}

/// Which positions a fetch should return.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionFilter {
    /// Every non-zero position in the account
    All,
    /// Only the listed instruments
    Instruments(Vec<Instrument>),
}

impl PositionFilter {
    pub fn matches(&self, instrument: &Instrument) -> bool {
        match self {
            PositionFilter::All => true,
            PositionFilter::Instruments(list) => list.contains(instrument),
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Margin mode for positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

/// A resting order returned by the open-orders query.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: Decimal,
}

/// Market order request.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub instrument: Instrument,
    pub side: OrderSide,
    /// In contracts
    pub quantity: Decimal,
    pub margin_mode: MarginMode,
    pub reduce_only: bool,
    pub position_side: PositionSide,
    /// Price the quantity was derived from; informational for live venues, the fill price for paper
    pub reference_price: Decimal,
}

/// Acknowledgement returned when an order is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderReceipt {
    pub order_id: String,
    pub instrument: Instrument,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}
