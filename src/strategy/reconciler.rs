//! Target-versus-live position reconciliation.
//!
//! Compares the cycle's target book with the exchange's position snapshot and
//! derives the orders needed to converge:
//! - matching side held: keep
//! - opposite side held: close it, then open the target side
//! - nothing held: open
//! - flat target (including instruments outside the universe): close everything held

use super::selector::{Direction, TargetState};
use crate::exchange::{Instrument, LivePosition, PositionSide};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One order-level step toward the target book.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationAction {
    /// Open exposure on `side` worth `notional` (signed, negative for short)
    Open {
        instrument: Instrument,
        side: PositionSide,
        notional: Decimal,
    },
    /// Close `quantity` contracts held on `side`
    Close {
        instrument: Instrument,
        side: PositionSide,
        quantity: Decimal,
        mark_price: Decimal,
    },
}

impl ReconciliationAction {
    pub fn instrument(&self) -> &Instrument {
        match self {
            ReconciliationAction::Open { instrument, .. } => instrument,
            ReconciliationAction::Close { instrument, .. } => instrument,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, ReconciliationAction::Close { .. })
    }
}

impl fmt::Display for ReconciliationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationAction::Open {
                instrument,
                side,
                notional,
            } => write!(f, "OPEN {} {} notional={}", side, instrument, notional),
            ReconciliationAction::Close {
                instrument,
                side,
                quantity,
                ..
            } => write!(f, "CLOSE {} {} qty={}", side, instrument, quantity),
        }
    }
}

/// Live positions grouped per instrument. A hedge-mode account may hold both sides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionBook {
    entries: BTreeMap<Instrument, BTreeMap<PositionSide, LivePosition>>,
}

impl PositionBook {
    /// Build from a fetch result; zero-quantity entries are dropped and
    /// repeated entries for one side are summed.
    pub fn from_positions(positions: impl IntoIterator<Item = LivePosition>) -> Self {
        let mut entries: BTreeMap<Instrument, BTreeMap<PositionSide, LivePosition>> =
            BTreeMap::new();

        for position in positions {
            if position.contracts <= Decimal::ZERO {
                continue;
            }
            let sides = entries.entry(position.instrument.clone()).or_default();
            match sides.get_mut(&position.side) {
                Some(existing) => existing.contracts += position.contracts,
                None => {
                    sides.insert(position.side, position);
                }
            }
        }

        Self { entries }
    }

    pub fn get(&self, instrument: &Instrument, side: PositionSide) -> Option<&LivePosition> {
        self.entries.get(instrument).and_then(|s| s.get(&side))
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// In execution order; a close always precedes the open on the same instrument
    pub actions: Vec<ReconciliationAction>,
    /// Instruments already held on their target side
    pub kept: Vec<Instrument>,
}

impl Reconciliation {
    pub fn opens(&self) -> usize {
        self.actions.iter().filter(|a| !a.is_close()).count()
    }

    pub fn closes(&self) -> usize {
        self.actions.iter().filter(|a| a.is_close()).count()
    }
}

/// Stateless reconciler.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionReconciler;

impl PositionReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Derive the actions that move `live` to `target`.
    ///
    /// Every instrument in either input is classified, so positions outside the
    /// configured universe are closed as orphans.
    pub fn reconcile(&self, target: &TargetState, live: &PositionBook) -> Reconciliation {
        let instruments: BTreeSet<&Instrument> =
            target.targets.keys().chain(live.instruments()).collect();

        let mut result = Reconciliation::default();

        for instrument in instruments {
            let wanted = target.target_of(instrument);
            let wanted_side = match wanted.direction {
                Direction::Long => Some(PositionSide::Long),
                Direction::Short => Some(PositionSide::Short),
                Direction::Flat => None,
            };

            for side in [PositionSide::Long, PositionSide::Short] {
                if Some(side) == wanted_side {
                    continue;
                }
                if let Some(position) = live.get(instrument, side) {
                    result.actions.push(ReconciliationAction::Close {
                        instrument: instrument.clone(),
                        side,
                        quantity: position.contracts,
                        mark_price: position.mark_price,
                    });
                }
            }

            if let Some(side) = wanted_side {
                if live.get(instrument, side).is_some() {
                    result.kept.push(instrument.clone());
                } else {
                    result.actions.push(ReconciliationAction::Open {
                        instrument: instrument.clone(),
                        side,
                        notional: wanted.notional,
                    });
                }
            }
        }

        result
    }
}
