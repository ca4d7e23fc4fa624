//! Decimal precision of document fields.
//!
//! Every derived value is rounded to its destination field's precision as
//! soon as it is computed, so recomputing from already-rounded inputs yields
//! the same output.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

/// How midpoints are resolved when rounding.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Banker's rounding: 2.345 -> 2.34, 2.355 -> 2.36.
    #[default]
    HalfEven,
    /// Commercial rounding: midpoints move away from zero.
    HalfUp,
}

impl RoundingMode {
    fn strategy(self) -> RoundingStrategy {
        match self {
            RoundingMode::HalfEven => RoundingStrategy::MidpointNearestEven,
            RoundingMode::HalfUp => RoundingStrategy::MidpointAwayFromZero,
        }
    }
}

impl core::str::FromStr for RoundingMode {
    type Err = crate::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "half_even" | "bankers" => Ok(RoundingMode::HalfEven),
            "half_up" | "commercial" => Ok(RoundingMode::HalfUp),
            other => Err(crate::DomainError::validation(format!(
                "unknown rounding mode: {other}"
            ))),
        }
    }
}

/// Number of decimal places a field stores.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Precision(u32);

impl ValueObject for Precision {}

impl Precision {
    /// Largest scale `rust_decimal` can represent.
    pub const MAX: u32 = 28;

    pub fn new(places: u32) -> Self {
        Self(places.min(Self::MAX))
    }

    pub fn places(&self) -> u32 {
        self.0
    }

    /// Round `value` to this precision.
    pub fn round(&self, value: Decimal, mode: RoundingMode) -> Decimal {
        value.round_dp_with_strategy(self.0, mode.strategy())
    }

    /// Multiply two field values and round the product to this precision.
    ///
    /// `None` when the product does not fit a `Decimal`.
    pub fn product(&self, a: Decimal, b: Decimal, mode: RoundingMode) -> Option<Decimal> {
        a.checked_mul(b).map(|v| self.round(v, mode))
    }

    /// `a - b`, rounded; `None` on overflow.
    pub fn difference(&self, a: Decimal, b: Decimal, mode: RoundingMode) -> Option<Decimal> {
        a.checked_sub(b).map(|v| self.round(v, mode))
    }

    /// Sum an iterator of values and round the total to this precision.
    pub fn sum<I>(&self, values: I, mode: RoundingMode) -> Option<Decimal>
    where
        I: IntoIterator<Item = Decimal>,
    {
        values
            .into_iter()
            .try_fold(Decimal::ZERO, Decimal::checked_add)
            .map(|v| self.round(v, mode))
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self(2)
    }
}

/// Numeric fields treat zero as "not filled in".
pub fn is_blank(value: Decimal) -> bool {
    value.is_zero()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn half_even_rounds_midpoints_to_even_digit() {
        let p = Precision::new(2);
        assert_eq!(p.round(dec!(2.345), RoundingMode::HalfEven), dec!(2.34));
        assert_eq!(p.round(dec!(2.355), RoundingMode::HalfEven), dec!(2.36));
    }

    #[test]
    fn half_up_moves_midpoints_away_from_zero() {
        let p = Precision::new(2);
        assert_eq!(p.round(dec!(2.345), RoundingMode::HalfUp), dec!(2.35));
        assert_eq!(p.round(dec!(-2.345), RoundingMode::HalfUp), dec!(-2.35));
    }

    #[test]
    fn product_rounds_after_multiplying() {
        let p = Precision::new(2);
        assert_eq!(p.product(dec!(20), dec!(3.5), RoundingMode::HalfEven), Some(dec!(70.00)));
        assert_eq!(p.product(dec!(3), dec!(0.3333), RoundingMode::HalfEven), Some(dec!(1.00)));
    }

    #[test]
    fn overflowing_arithmetic_yields_none() {
        let p = Precision::new(2);
        let huge = Decimal::MAX;
        assert_eq!(p.product(huge, dec!(2), RoundingMode::HalfEven), None);
        assert_eq!(p.difference(-huge, huge, RoundingMode::HalfEven), None);
        assert_eq!(p.sum([huge, huge], RoundingMode::HalfEven), None);
        assert_eq!(p.sum([dec!(1.005), dec!(2)], RoundingMode::HalfEven), Some(dec!(3.00)));
    }

    #[test]
    fn precision_is_capped() {
        assert_eq!(Precision::new(40).places(), Precision::MAX);
    }

    #[test]
    fn rounding_mode_parses_aliases() {
        assert_eq!("bankers".parse::<RoundingMode>().unwrap(), RoundingMode::HalfEven);
        assert_eq!("HALF_UP".parse::<RoundingMode>().unwrap(), RoundingMode::HalfUp);
        assert!("sideways".parse::<RoundingMode>().is_err());
    }

    #[test]
    fn precision_serializes_as_plain_number() {
        let json = serde_json::to_string(&Precision::new(3)).unwrap();
        assert_eq!(json, "3");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: rounding an already-rounded value is a no-op.
        #[test]
        fn rounding_is_idempotent(mantissa in -10_000_000i64..10_000_000i64, scale in 0u32..6, places in 0u32..5) {
            let value = Decimal::new(mantissa, scale);
            for mode in [RoundingMode::HalfEven, RoundingMode::HalfUp] {
                let p = Precision::new(places);
                let once = p.round(value, mode);
                prop_assert_eq!(p.round(once, mode), once);
            }
        }
    }
}
