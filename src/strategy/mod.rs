//! Rebalancing strategy.
//!
//! Contains the core logic for:
//! - Momentum scoring of candle series
//! - Cross-sectional selection of long and short legs
//! - Reconciliation of targets against live positions
//! - Order sizing under exchange precision limits
//! - Order execution and cycle scheduling

mod executor;
mod factor;
mod reconciler;
mod scheduler;
mod selector;
mod sizer;

pub use executor::{ActionStatus, ExecutionRecord, ExecutionReport, OrderExecutor, OrderOutcome};
pub use factor::{FactorEngine, FactorError, MomentumScore, ScoreBreakdown, ScoringPolicy};
pub use reconciler::{PositionBook, PositionReconciler, Reconciliation, ReconciliationAction};
pub use scheduler::{CycleContext, CycleReport, RebalanceScheduler, ShutdownSignal};
pub use selector::{Direction, ReverseWindow, Selector, Target, TargetState};
pub use sizer::{OrderSizer, SizingRejection};
