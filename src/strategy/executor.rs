//! Order execution for reconciliation actions.
//!
//! Executes actions strictly in order. Market orders are sent once and never
//! retried: a failure is recorded as rejected (the venue refused it) or unknown
//! (the request may have reached the venue) and the instrument is re-evaluated
//! from a fresh snapshot next cycle.

use super::reconciler::ReconciliationAction;
use super::scheduler::ShutdownSignal;
use super::sizer::OrderSizer;
use crate::config::ExecutionConfig;
use crate::exchange::{
    retry_read, ExecutionGateway, GatewayError, Instrument, InstrumentSpec, MarginMode,
    MarketDataGate, MarketOrder, OrderReceipt, PositionSide, RetryPolicy,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{error, info, warn};

/// Result of submitting one market order.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Placed(OrderReceipt),
    Rejected(String),
    /// The request may have reached the exchange; verify before acting on it
    Unknown(String),
}

impl OrderOutcome {
    fn from_error(error: &GatewayError) -> Self {
        if error.outcome_unknown() {
            OrderOutcome::Unknown(error.to_string())
        } else {
            OrderOutcome::Rejected(error.to_string())
        }
    }

    pub fn is_placed(&self) -> bool {
        matches!(self, OrderOutcome::Placed(_))
    }
}

/// What happened to one reconciliation action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionStatus {
    /// An order was submitted for `quantity` contracts
    Submitted {
        quantity: Decimal,
        outcome: OrderOutcome,
    },
    /// No order was sent
    Skipped(String),
}

impl ActionStatus {
    pub fn is_placed(&self) -> bool {
        matches!(self, ActionStatus::Submitted { outcome, .. } if outcome.is_placed())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ActionStatus::Submitted { outcome, .. } if !outcome.is_placed())
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStatus::Submitted {
                outcome: OrderOutcome::Placed(receipt),
                ..
            } => write!(f, "placed ({})", receipt.order_id),
            ActionStatus::Submitted {
                outcome: OrderOutcome::Rejected(reason),
                ..
            } => write!(f, "rejected: {}", reason),
            ActionStatus::Submitted {
                outcome: OrderOutcome::Unknown(reason),
                ..
            } => write!(f, "unknown: {}", reason),
            ActionStatus::Skipped(reason) => write!(f, "skipped: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub action: ReconciliationAction,
    pub status: ActionStatus,
}

/// Everything the executor did (and did not do) for one plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub records: Vec<ExecutionRecord>,
    /// Actions not started because shutdown was requested
    pub unexecuted: Vec<ReconciliationAction>,
}

impl ExecutionReport {
    pub fn opened(&self) -> usize {
        self.count(|r| !r.action.is_close() && r.status.is_placed())
    }

    pub fn closed(&self) -> usize {
        self.count(|r| r.action.is_close() && r.status.is_placed())
    }

    pub fn failed(&self) -> usize {
        self.count(|r| r.status.is_failed())
    }

    pub fn skipped(&self) -> usize {
        self.count(|r| matches!(r.status, ActionStatus::Skipped(_)))
    }

    fn count(&self, predicate: impl Fn(&ExecutionRecord) -> bool) -> usize {
        self.records.iter().filter(|r| predicate(r)).count()
    }
}

/// Turns reconciliation actions into market orders.
pub struct OrderExecutor {
    leverage: u8,
    margin_mode: MarginMode,
    retry: RetryPolicy,
    sizer: OrderSizer,
}

impl OrderExecutor {
    /// Create a new order executor.
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            leverage: config.max_leverage,
            margin_mode: config.margin_mode,
            retry: config.retry_policy(),
            sizer: OrderSizer::new(),
        }
    }

    /// Execute `actions` in order.
    ///
    /// An open whose instrument had a close fail earlier in the plan is skipped.
    /// When shutdown is requested the action in flight completes and the rest
    /// are returned as unexecuted.
    pub async fn execute<M, E>(
        &self,
        market: &M,
        gateway: &E,
        specs: &HashMap<Instrument, InstrumentSpec>,
        actions: &[ReconciliationAction],
        shutdown: &ShutdownSignal,
    ) -> ExecutionReport
    where
        M: MarketDataGate + ?Sized,
        E: ExecutionGateway + ?Sized,
    {
        let mut report = ExecutionReport::default();
        let mut unconfirmed_closes: HashSet<Instrument> = HashSet::new();

        for (index, action) in actions.iter().enumerate() {
            if shutdown.is_triggered() {
                report.unexecuted = actions[index..].to_vec();
                for pending in &report.unexecuted {
                    warn!(action = %pending, "Shutdown requested, action not executed");
                }
                break;
            }

            let status = match action {
                ReconciliationAction::Close {
                    instrument,
                    side,
                    quantity,
                    mark_price,
                } => {
                    let status = self
                        .close(market, gateway, instrument, *side, *quantity, *mark_price)
                        .await;
                    if !status.is_placed() {
                        unconfirmed_closes.insert(instrument.clone());
                    }
                    status
                }
                ReconciliationAction::Open {
                    instrument,
                    side,
                    notional,
                } => {
                    if unconfirmed_closes.contains(instrument) {
                        ActionStatus::Skipped("close of opposite side not confirmed".into())
                    } else {
                        match specs.get(instrument) {
                            Some(spec) => self.open(market, gateway, spec, *side, *notional).await,
                            None => ActionStatus::Skipped("no instrument metadata".into()),
                        }
                    }
                }
            };

            if let ActionStatus::Skipped(reason) = &status {
                warn!(action = %action, %reason, "Action skipped");
            }

            report.records.push(ExecutionRecord {
                action: action.clone(),
                status,
            });
        }

        report
    }

    /// Close `quantity` contracts on `side`, priced from the latest ticker.
    ///
    /// A ticker failure never blocks a close; the position's mark is used instead.
    async fn close<M, E>(
        &self,
        market: &M,
        gateway: &E,
        instrument: &Instrument,
        side: PositionSide,
        quantity: Decimal,
        mark_price: Decimal,
    ) -> ActionStatus
    where
        M: MarketDataGate + ?Sized,
        E: ExecutionGateway + ?Sized,
    {
        let price = match retry_read("ticker", &self.retry, || market.fetch_ticker(instrument)).await
        {
            Ok(ticker) => ticker.last_price,
            Err(e) => {
                warn!(%instrument, error = %e, %mark_price, "Ticker unavailable, closing at mark");
                mark_price
            }
        };

        info!(%instrument, %side, %quantity, %price, "Closing position");

        let order = MarketOrder {
            instrument: instrument.clone(),
            side: side.closing_order(),
            quantity,
            margin_mode: self.margin_mode,
            reduce_only: true,
            position_side: side,
            reference_price: price,
        };

        self.submit(gateway, &order).await
    }

    async fn open<M, E>(
        &self,
        market: &M,
        gateway: &E,
        spec: &InstrumentSpec,
        side: PositionSide,
        notional: Decimal,
    ) -> ActionStatus
    where
        M: MarketDataGate + ?Sized,
        E: ExecutionGateway + ?Sized,
    {
        let instrument = &spec.instrument;

        if let Err(e) = gateway
            .set_leverage(instrument, self.leverage, self.margin_mode)
            .await
        {
            warn!(%instrument, error = %e, "Failed to set leverage, opening anyway");
        }

        let price = match retry_read("ticker", &self.retry, || market.fetch_ticker(instrument)).await
        {
            Ok(ticker) => ticker.last_price,
            Err(e) => return ActionStatus::Skipped(format!("ticker unavailable: {}", e)),
        };

        let quantity = match self.sizer.try_size(spec, notional, price) {
            Ok(quantity) => quantity,
            Err(reason) => return ActionStatus::Skipped(reason.to_string()),
        };

        info!(%instrument, %side, %notional, %price, %quantity, "Opening position");

        let order = MarketOrder {
            instrument: instrument.clone(),
            side: side.opening_order(),
            quantity,
            margin_mode: self.margin_mode,
            reduce_only: false,
            position_side: side,
            reference_price: price,
        };

        self.submit(gateway, &order).await
    }

    async fn submit<E>(&self, gateway: &E, order: &MarketOrder) -> ActionStatus
    where
        E: ExecutionGateway + ?Sized,
    {
        let outcome = match gateway.place_market_order(order).await {
            Ok(receipt) => {
                info!(
                    instrument = %order.instrument,
                    order_id = %receipt.order_id,
                    side = %order.side,
                    quantity = %receipt.quantity,
                    avg_price = ?receipt.avg_price,
                    "Order placed"
                );
                OrderOutcome::Placed(receipt)
            }
            Err(e) => {
                let outcome = OrderOutcome::from_error(&e);
                match &outcome {
                    OrderOutcome::Unknown(_) => error!(
                        instrument = %order.instrument,
                        side = %order.side,
                        quantity = %order.quantity,
                        error = %e,
                        "Order outcome unknown, verify on exchange"
                    ),
                    _ => error!(
                        instrument = %order.instrument,
                        side = %order.side,
                        quantity = %order.quantity,
                        error = %e,
                        "Order rejected"
                    ),
                }
                outcome
            }
        };

        ActionStatus::Submitted {
            quantity: order.quantity,
            outcome,
        }
    }
}
