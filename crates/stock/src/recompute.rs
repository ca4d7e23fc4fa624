//! Derived-field rules shared by both engines.
//!
//! Every rule rounds its result to the destination field's precision, so
//! applying a rule to a settled row reproduces the stored value. Arithmetic
//! is checked: a result that does not fit a `Decimal` is a validation error
//! and leaves the row untouched.

use rust_decimal::Decimal;

use crate::changes::Recorder;
use crate::config::EngineConfig;
use crate::entry::StockEntryRow;
use crate::error::{EngineError, EngineResult};
use crate::reconciliation::ReconciliationRow;

/// `qty` in the stock UOM.
pub fn transfer_qty(qty: Decimal, conversion_factor: Decimal, config: &EngineConfig) -> EngineResult<Decimal> {
    config
        .precision
        .transfer_qty
        .product(qty, conversion_factor, config.rounding)
        .ok_or_else(|| EngineError::out_of_range("transfer_qty"))
}

pub fn amount(qty: Decimal, rate: Decimal, config: &EngineConfig) -> EngineResult<Decimal> {
    config
        .precision
        .amount
        .product(qty, rate, config.rounding)
        .ok_or_else(|| EngineError::out_of_range("amount"))
}

pub fn amount_difference(
    amount: Decimal,
    current_amount: Decimal,
    config: &EngineConfig,
) -> EngineResult<Decimal> {
    config
        .precision
        .amount
        .difference(amount, current_amount, config.rounding)
        .ok_or_else(|| EngineError::out_of_range("amount_difference"))
}

/// Counted quantity from booked quantity minus a user-entered shrinkage.
pub fn qty_from_delta(current_qty: Decimal, delta: Decimal, config: &EngineConfig) -> EngineResult<Decimal> {
    config
        .precision
        .qty
        .difference(current_qty, delta, config.rounding)
        .ok_or_else(|| EngineError::out_of_range("qty"))
}

/// Document-level total of a per-row charge.
pub fn total<I>(values: I, config: &EngineConfig) -> EngineResult<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    config
        .precision
        .total
        .sum(values, config.rounding)
        .ok_or_else(|| EngineError::out_of_range("total"))
}

/// Base quantity from `qty`, then the amount at the row's current rate.
///
/// Returns whether the base quantity changed.
pub(crate) fn refresh_transfer_qty(
    row: &mut StockEntryRow,
    config: &EngineConfig,
    rec: &mut Recorder<'_>,
) -> EngineResult<bool> {
    let base = transfer_qty(row.qty, row.conversion_factor, config)?;
    let basic_amount = amount(base, row.basic_rate, config)?;
    let changed = rec.set(&mut row.transfer_qty, base, "transfer_qty");
    rec.set(&mut row.basic_amount, basic_amount, "basic_amount");
    Ok(changed)
}

/// Rate from a lookup: written to both rate fields, then the amount follows.
pub(crate) fn apply_rate(
    row: &mut StockEntryRow,
    rate: Decimal,
    config: &EngineConfig,
    rec: &mut Recorder<'_>,
) -> EngineResult<()> {
    let rate = config.round_rate(rate);
    let basic_amount = amount(row.transfer_qty, rate, config)?;
    rec.set(&mut row.basic_rate, rate, "basic_rate");
    rec.set(&mut row.valuation_rate, rate, "valuation_rate");
    rec.set(&mut row.basic_amount, basic_amount, "basic_amount");
    Ok(())
}

pub(crate) fn refresh_reconciliation_amounts(
    row: &mut ReconciliationRow,
    config: &EngineConfig,
    rec: &mut Recorder<'_>,
) -> EngineResult<()> {
    let value = amount(row.qty, row.valuation_rate, config)?;
    let difference = amount_difference(value, row.current_amount, config)?;
    rec.set(&mut row.amount, value, "amount");
    rec.set(&mut row.amount_difference, difference, "amount_difference");
    Ok(())
}
