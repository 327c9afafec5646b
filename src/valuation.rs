//! src/valuation.rs
//! Decimal money math shared by the processor and the report engine.
//!
//! Every monetary quantity is a `rust_decimal::Decimal` (NUMERIC(19,5) at the
//! store). Arithmetic runs at full precision; rounding happens at exactly two
//! boundaries: 5 dp when a value is written to a log column, 2 dp when a
//! report cell is printed.

use rust_decimal::{Decimal, RoundingStrategy};

/// Net value of a trade in USX: `quantity * price / rate`, unrounded.
///
/// FX rates are quoted foreign/USX, so dividing the foreign value by the
/// rate lands in the base unit.
pub fn trade_value(quantity: i64, price: Decimal, rate: Decimal) -> Decimal {
    Decimal::from(quantity) * price / rate
}

/// Store rounding boundary: 5 dp, midpoint away from zero.
pub fn round5(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(5, RoundingStrategy::MidpointAwayFromZero)
}

/// Report rendering boundary: 2 dp, midpoint away from zero, zero-padded.
pub fn format_money(value: Decimal) -> String {
    format!(
        "{:.2}",
        value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn buy_valuation_rounds_at_the_log_boundary() {
        // 533 * 10000 / 136.14
        let value = trade_value(533, dec("10000"), dec("136.14"));
        assert_eq!(round5(value), dec("39150.87410"));

        let cash_after = round5(dec("1000000") - value);
        assert_eq!(cash_after, dec("960849.12590"));
    }

    #[test]
    fn sell_valuation_rounds_at_the_log_boundary() {
        // 33 * 10090 / 136.14
        let value = trade_value(33, dec("10090"), dec("136.14"));
        assert_eq!(round5(value), dec("2445.79110"));

        let cash_after = round5(dec("960849.12590") + value);
        assert_eq!(cash_after, dec("963294.91700"));
    }

    #[test]
    fn arithmetic_keeps_full_precision_between_boundaries() {
        // Rounding the operands first would land one tick off.
        let value = trade_value(533, dec("10000"), dec("136.14"));
        assert_ne!(value, round5(value));
        assert!((value - round5(value)).abs() < dec("0.000005"));
    }

    #[test]
    fn format_money_pads_and_rounds_away_from_zero() {
        assert_eq!(format_money(dec("100")), "100.00");
        assert_eq!(format_money(dec("960849.12590")), "960849.13");
        assert_eq!(format_money(dec("2.005")), "2.01");
        assert_eq!(format_money(dec("-2.005")), "-2.01");
        assert_eq!(format_money(dec("39150.87410")), "39150.87");
    }

    #[test]
    fn round5_is_half_away_from_zero() {
        assert_eq!(round5(dec("1.000005")), dec("1.00001"));
        assert_eq!(round5(dec("1.000004")), dec("1.00000"));
        assert_eq!(round5(dec("-1.000005")), dec("-1.00001"));
    }
}
