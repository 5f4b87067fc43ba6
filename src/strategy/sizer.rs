//! Converts a target notional into a contract quantity the exchange will accept.

use crate::exchange::InstrumentSpec;
use crate::utils::decimal::round_to_step;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

/// Why no order quantity could be produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingRejection {
    #[error("non-positive price {0}")]
    NonPositivePrice(Decimal),

    #[error("contract value is zero")]
    ZeroContractValue,

    #[error("quantity {quantity} below minimum {min_amount}")]
    BelowMinAmount {
        quantity: Decimal,
        min_amount: Decimal,
    },

    #[error("notional {notional} below minimum {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },
}

/// Stateless order sizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderSizer;

impl OrderSizer {
    pub fn new() -> Self {
        Self
    }

    /// Quantity in contracts for `|target_notional|` at `mark_price`, or the reason there is none.
    pub fn try_size(
        &self,
        spec: &InstrumentSpec,
        target_notional: Decimal,
        mark_price: Decimal,
    ) -> Result<Decimal, SizingRejection> {
        if mark_price <= Decimal::ZERO {
            return Err(SizingRejection::NonPositivePrice(mark_price));
        }

        let contract_value = spec.contract_multiplier * mark_price;
        if contract_value <= Decimal::ZERO {
            return Err(SizingRejection::ZeroContractValue);
        }

        let raw = target_notional.abs() / contract_value;
        let quantity = round_to_step(raw, spec.amount_step);

        if quantity <= Decimal::ZERO || quantity < spec.min_amount {
            return Err(SizingRejection::BelowMinAmount {
                quantity,
                min_amount: spec.min_amount,
            });
        }

        let notional = quantity * contract_value;
        if spec.min_notional > Decimal::ZERO && notional < spec.min_notional {
            return Err(SizingRejection::BelowMinNotional {
                notional,
                min_notional: spec.min_notional,
            });
        }

        Ok(quantity)
    }

    /// Like `try_size`, logging the rejection and returning `None`.
    pub fn size(
        &self,
        spec: &InstrumentSpec,
        target_notional: Decimal,
        mark_price: Decimal,
    ) -> Option<Decimal> {
        match self.try_size(spec, target_notional, mark_price) {
            Ok(quantity) => Some(quantity),
            Err(reason) => {
                warn!(
                    instrument = %spec.instrument,
                    %target_notional,
                    %mark_price,
                    %reason,
                    "Order size rejected"
                );
                None
            }
        }
    }
}
