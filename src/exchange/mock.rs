//! Paper exchange for paper trading and tests.
//!
//! Holds instruments, candles, prices and per-side positions in memory and
//! implements both gateway traits. Orders fill immediately at the reference
//! price carried on the request.

use super::error::GatewayError;
use super::traits::{ExecutionGateway, GatewayResult, MarketDataGate};
use super::types::*;
use crate::utils::decimal::weighted_average;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A simulated position on one side of one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct PaperPosition {
    pub contracts: Decimal,
    pub entry_price: Decimal,
}

/// Mutable account state.
#[derive(Debug, Clone)]
pub struct PaperAccount {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub positions: BTreeMap<(Instrument, PositionSide), PaperPosition>,
    pub open_orders: Vec<OpenOrder>,
    pub leverage: HashMap<Instrument, (u8, MarginMode)>,
    pub total_fees: Decimal,
    pub realized_pnl: Decimal,
    /// Every accepted order, in submission order
    pub filled_orders: Vec<MarketOrder>,
}

impl PaperAccount {
    fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            balance: initial_balance,
            positions: BTreeMap::new(),
            open_orders: Vec::new(),
            leverage: HashMap::new(),
            total_fees: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            filled_orders: Vec::new(),
        }
    }
}

/// Failure switches for exercising error paths.
#[derive(Debug, Default)]
struct FailureInjection {
    candles: HashMap<Instrument, GatewayError>,
    tickers: HashMap<Instrument, GatewayError>,
    orders: HashMap<Instrument, GatewayError>,
    positions: Option<GatewayError>,
    instruments: Option<GatewayError>,
    /// Transient failures returned before reads succeed again
    transient_position_failures: u32,
}

/// In-memory exchange implementing `MarketDataGate` and `ExecutionGateway`.
pub struct PaperExchange {
    account: Arc<RwLock<PaperAccount>>,
    instruments: Arc<RwLock<BTreeMap<Instrument, InstrumentSpec>>>,
    candles: Arc<RwLock<HashMap<Instrument, CandleSeries>>>,
    prices: Arc<RwLock<HashMap<Instrument, Decimal>>>,
    failures: Arc<RwLock<FailureInjection>>,
    cancelled: Arc<RwLock<HashSet<String>>>,
    order_id_counter: AtomicU64,
    /// Taker fee rate (0.04%)
    fee_rate: Decimal,
}

impl PaperExchange {
    /// Create a paper exchange with an initial quote balance.
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            account: Arc::new(RwLock::new(PaperAccount::new(initial_balance))),
            instruments: Arc::new(RwLock::new(BTreeMap::new())),
            candles: Arc::new(RwLock::new(HashMap::new())),
            prices: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(RwLock::new(FailureInjection::default())),
            cancelled: Arc::new(RwLock::new(HashSet::new())),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.0004),
        }
    }

    pub async fn add_instrument(&self, spec: InstrumentSpec) {
        self.instruments
            .write()
            .await
            .insert(spec.instrument.clone(), spec);
    }

    /// Replace the candle series served for its instrument; also sets the price to the last close.
    pub async fn set_candles(&self, series: CandleSeries) {
        if let Some(last) = series.candles.last() {
            if let Ok(price) = Decimal::try_from(last.close) {
                self.prices
                    .write()
                    .await
                    .insert(series.instrument.clone(), price);
            }
        }
        self.candles
            .write()
            .await
            .insert(series.instrument.clone(), series);
    }

    pub async fn set_price(&self, instrument: &Instrument, price: Decimal) {
        self.prices.write().await.insert(instrument.clone(), price);
    }

    /// Seed a position directly, bypassing order flow.
    pub async fn seed_position(
        &self,
        instrument: &Instrument,
        side: PositionSide,
        contracts: Decimal,
        entry_price: Decimal,
    ) {
        self.account.write().await.positions.insert(
            (instrument.clone(), side),
            PaperPosition {
                contracts,
                entry_price,
            },
        );
    }

    /// Seed a resting order that the next cancel sweep should remove.
    pub async fn seed_open_order(&self, instrument: &Instrument, side: OrderSide, quantity: Decimal) -> String {
        let order_id = self.next_order_id().to_string();
        self.account.write().await.open_orders.push(OpenOrder {
            order_id: order_id.clone(),
            instrument: instrument.clone(),
            side,
            quantity,
        });
        order_id
    }

    pub async fn fail_candles(&self, instrument: &Instrument, error: GatewayError) {
        self.failures
            .write()
            .await
            .candles
            .insert(instrument.clone(), error);
    }

    pub async fn fail_ticker(&self, instrument: &Instrument, error: GatewayError) {
        self.failures
            .write()
            .await
            .tickers
            .insert(instrument.clone(), error);
    }

    pub async fn fail_orders(&self, instrument: &Instrument, error: GatewayError) {
        self.failures
            .write()
            .await
            .orders
            .insert(instrument.clone(), error);
    }

    pub async fn fail_positions(&self, error: Option<GatewayError>) {
        self.failures.write().await.positions = error;
    }

    pub async fn fail_instruments(&self, error: Option<GatewayError>) {
        self.failures.write().await.instruments = error;
    }

    /// Make the next `count` position fetches fail with a transport error.
    pub async fn fail_positions_transiently(&self, count: u32) {
        self.failures.write().await.transient_position_failures = count;
    }

    /// Snapshot of the account for inspection.
    pub async fn account(&self) -> PaperAccount {
        self.account.read().await.clone()
    }

    /// Ids of orders cancelled so far.
    pub async fn cancelled_orders(&self) -> HashSet<String> {
        self.cancelled.read().await.clone()
    }

    pub async fn position(&self, instrument: &Instrument, side: PositionSide) -> Option<PaperPosition> {
        self.account
            .read()
            .await
            .positions
            .get(&(instrument.clone(), side))
            .cloned()
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataGate for PaperExchange {
    async fn fetch_instruments(&self) -> GatewayResult<Vec<InstrumentSpec>> {
        if let Some(error) = self.failures.read().await.instruments.clone() {
            return Err(error);
        }
        Ok(self.instruments.read().await.values().cloned().collect())
    }

    async fn fetch_candles(
        &self,
        instrument: &Instrument,
        timeframe: &str,
        limit: usize,
    ) -> GatewayResult<CandleSeries> {
        if let Some(error) = self.failures.read().await.candles.get(instrument).cloned() {
            return Err(error);
        }

        let candles = self.candles.read().await;
        let series = candles
            .get(instrument)
            .ok_or_else(|| GatewayError::Rejected {
                code: -1121,
                message: format!("Invalid symbol {}", instrument),
            })?;

        let skip = series.candles.len().saturating_sub(limit);
        Ok(CandleSeries::new(
            instrument.clone(),
            timeframe,
            series.candles[skip..].to_vec(),
        ))
    }

    async fn fetch_ticker(&self, instrument: &Instrument) -> GatewayResult<Ticker> {
        if let Some(error) = self.failures.read().await.tickers.get(instrument).cloned() {
            return Err(error);
        }

        let price = self
            .prices
            .read()
            .await
            .get(instrument)
            .copied()
            .ok_or_else(|| GatewayError::Rejected {
                code: -1121,
                message: format!("Invalid symbol {}", instrument),
            })?;

        Ok(Ticker {
            instrument: instrument.clone(),
            last_price: price,
        })
    }
}

#[async_trait]
impl ExecutionGateway for PaperExchange {
    async fn fetch_positions(&self, filter: &PositionFilter) -> GatewayResult<Vec<LivePosition>> {
        {
            let mut failures = self.failures.write().await;
            if failures.transient_position_failures > 0 {
                failures.transient_position_failures -= 1;
                return Err(GatewayError::Transport("simulated connection reset".into()));
            }
            if let Some(error) = failures.positions.clone() {
                return Err(error);
            }
        }

        let account = self.account.read().await;
        let prices = self.prices.read().await;

        Ok(account
            .positions
            .iter()
            .filter(|((instrument, _), p)| !p.contracts.is_zero() && filter.matches(instrument))
            .map(|((instrument, side), p)| LivePosition {
                instrument: instrument.clone(),
                side: *side,
                contracts: p.contracts,
                entry_price: p.entry_price,
                mark_price: prices.get(instrument).copied().unwrap_or(p.entry_price),
            })
            .collect())
    }

    async fn fetch_open_orders(&self) -> GatewayResult<Vec<OpenOrder>> {
        Ok(self.account.read().await.open_orders.clone())
    }

    async fn cancel_order(&self, order_id: &str, instrument: &Instrument) -> GatewayResult<()> {
        let mut account = self.account.write().await;
        let before = account.open_orders.len();
        account
            .open_orders
            .retain(|o| !(o.order_id == order_id && &o.instrument == instrument));

        if account.open_orders.len() == before {
            return Err(GatewayError::Rejected {
                code: -2011,
                message: format!("Unknown order {}", order_id),
            });
        }

        self.cancelled.write().await.insert(order_id.to_string());
        debug!(%order_id, %instrument, "Paper order cancelled");
        Ok(())
    }

    async fn place_market_order(&self, order: &MarketOrder) -> GatewayResult<OrderReceipt> {
        if let Some(error) = self.failures.read().await.orders.get(&order.instrument).cloned() {
            return Err(error);
        }

        if order.quantity <= Decimal::ZERO {
            return Err(GatewayError::Rejected {
                code: -4003,
                message: "Quantity less than or equal to zero.".into(),
            });
        }

        let contract_multiplier = self
            .instruments
            .read()
            .await
            .get(&order.instrument)
            .map(|s| s.contract_multiplier)
            .unwrap_or(Decimal::ONE);

        let price = order.reference_price;
        let notional = order.quantity * contract_multiplier * price;
        let fee = notional * self.fee_rate;
        let key = (order.instrument.clone(), order.position_side);

        let mut account = self.account.write().await;

        if order.reduce_only {
            let held = account
                .positions
                .get(&key)
                .map(|p| p.contracts)
                .unwrap_or(Decimal::ZERO);
            if held.is_zero() || order.side != order.position_side.closing_order() {
                return Err(GatewayError::Rejected {
                    code: -2022,
                    message: "ReduceOnly Order is rejected.".into(),
                });
            }

            let closed = order.quantity.min(held);
            let entry = account.positions[&key].entry_price;
            let pnl = match order.position_side {
                PositionSide::Long => (price - entry) * closed * contract_multiplier,
                PositionSide::Short => (entry - price) * closed * contract_multiplier,
            };
            account.realized_pnl += pnl;
            account.balance += pnl;

            let remaining = held - closed;
            if remaining.is_zero() {
                account.positions.remove(&key);
            } else if let Some(position) = account.positions.get_mut(&key) {
                position.contracts = remaining;
            }
        } else {
            if order.side != order.position_side.opening_order() {
                return Err(GatewayError::Rejected {
                    code: -4061,
                    message: "Order's position side does not match user's setting.".into(),
                });
            }

            let position = account.positions.entry(key).or_insert(PaperPosition {
                contracts: Decimal::ZERO,
                entry_price: price,
            });
            position.entry_price = weighted_average(&[
                (position.entry_price, position.contracts),
                (price, order.quantity),
            ]);
            position.contracts += order.quantity;
        }

        account.balance -= fee;
        account.total_fees += fee;
        account.filled_orders.push(order.clone());

        let order_id = self.next_order_id();

        info!(
            order_id,
            instrument = %order.instrument,
            side = %order.side,
            position_side = %order.position_side,
            quantity = %order.quantity,
            price = %price,
            fee = %fee,
            "Paper order filled"
        );

        Ok(OrderReceipt {
            order_id: order_id.to_string(),
            instrument: order.instrument.clone(),
            side: order.side,
            quantity: order.quantity,
            avg_price: Some(price),
            timestamp: Utc::now(),
        })
    }

    async fn set_leverage(
        &self,
        instrument: &Instrument,
        leverage: u8,
        margin_mode: MarginMode,
    ) -> GatewayResult<()> {
        debug!(%instrument, leverage, ?margin_mode, "Paper set leverage");
        self.account
            .write()
            .await
            .leverage
            .insert(instrument.clone(), (leverage, margin_mode));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Instrument {
        Instrument::new("BTCUSDT")
    }

    fn market(side: OrderSide, position_side: PositionSide, quantity: Decimal, reduce_only: bool) -> MarketOrder {
        MarketOrder {
            instrument: btc(),
            side,
            quantity,
            margin_mode: MarginMode::Cross,
            reduce_only,
            position_side,
            reference_price: dec!(50000),
        }
    }

    #[tokio::test]
    async fn test_open_long_then_close() {
        let exchange = PaperExchange::new(dec!(10000));

        exchange
            .place_market_order(&market(OrderSide::Buy, PositionSide::Long, dec!(0.1), false))
            .await
            .unwrap();
        let position = exchange.position(&btc(), PositionSide::Long).await.unwrap();
        assert_eq!(position.contracts, dec!(0.1));
        assert_eq!(position.entry_price, dec!(50000));

        exchange
            .place_market_order(&market(OrderSide::Sell, PositionSide::Long, dec!(0.1), true))
            .await
            .unwrap();
        assert!(exchange.position(&btc(), PositionSide::Long).await.is_none());

        let account = exchange.account().await;
        assert_eq!(account.filled_orders.len(), 2);
        // 2 fills of 5000 notional at 0.04%
        assert_eq!(account.total_fees, dec!(4));
        assert_eq!(account.balance, dec!(9996));
    }

    #[tokio::test]
    async fn test_reduce_only_without_position_is_rejected() {
        let exchange = PaperExchange::new(dec!(10000));
        let result = exchange
            .place_market_order(&market(OrderSide::Buy, PositionSide::Short, dec!(1), true))
            .await;
        assert!(matches!(result, Err(GatewayError::Rejected { code: -2022, .. })));
    }

    #[tokio::test]
    async fn test_hedged_sides_are_independent() {
        let exchange = PaperExchange::new(dec!(10000));
        exchange
            .seed_position(&btc(), PositionSide::Long, dec!(1), dec!(40000))
            .await;
        exchange
            .seed_position(&btc(), PositionSide::Short, dec!(2), dec!(41000))
            .await;

        let positions = exchange.fetch_positions(&PositionFilter::All).await.unwrap();
        assert_eq!(positions.len(), 2);
        assert!(positions.iter().any(|p| p.side == PositionSide::Short && p.contracts == dec!(2)));
    }

    #[tokio::test]
    async fn test_realized_pnl_on_short_close() {
        let exchange = PaperExchange::new(dec!(10000));
        exchange
            .seed_position(&btc(), PositionSide::Short, dec!(1), dec!(51000))
            .await;

        exchange
            .place_market_order(&market(OrderSide::Buy, PositionSide::Short, dec!(1), true))
            .await
            .unwrap();

        let account = exchange.account().await;
        assert_eq!(account.realized_pnl, dec!(1000));
    }

    #[tokio::test]
    async fn test_cancel_removes_open_order() {
        let exchange = PaperExchange::new(dec!(10000));
        let id = exchange.seed_open_order(&btc(), OrderSide::Buy, dec!(1)).await;

        exchange.cancel_order(&id, &btc()).await.unwrap();
        assert!(exchange.fetch_open_orders().await.unwrap().is_empty());
        assert!(exchange.cancelled_orders().await.contains(&id));
        assert!(exchange.cancel_order(&id, &btc()).await.is_err());
    }

    #[tokio::test]
    async fn test_candle_limit_keeps_most_recent() {
        let exchange = PaperExchange::new(dec!(10000));
        let candles = (0..10)
            .map(|i| Candle {
                timestamp: i,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 100.0 + i as f64,
                volume: 1.0,
            })
            .collect();
        exchange
            .set_candles(CandleSeries::new(btc(), "1h", candles))
            .await;

        let series = exchange.fetch_candles(&btc(), "1h", 3).await.unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.candles[0].timestamp, 7);

        let ticker = exchange.fetch_ticker(&btc()).await.unwrap();
        assert_eq!(ticker.last_price, dec!(109));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let exchange = PaperExchange::new(dec!(10000));
        exchange.fail_positions_transiently(1).await;

        assert!(exchange.fetch_positions(&PositionFilter::All).await.is_err());
        assert!(exchange.fetch_positions(&PositionFilter::All).await.is_ok());

        exchange
            .fail_orders(&btc(), GatewayError::Transport("reset".into()))
            .await;
        let result = exchange
            .place_market_order(&market(OrderSide::Buy, PositionSide::Long, dec!(1), false))
            .await;
        assert!(result.unwrap_err().outcome_unknown());
    }
}
