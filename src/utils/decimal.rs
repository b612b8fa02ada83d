//! Decimal arithmetic utilities for share and allocation accounting.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Round down to a number of decimal places (amount precision).
///
/// Ledger amounts are always floored so the vault never promises more than
/// it holds.
pub fn floor_to_scale(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::ToZero)
}

/// Compute `a * b / c` floored to `scale`, returning `None` on overflow or a
/// zero divisor.
pub fn mul_div_floor(a: Decimal, b: Decimal, c: Decimal, scale: u32) -> Option<Decimal> {
    if c == Decimal::ZERO {
        return None;
    }
    let product = a.checked_mul(b)?;
    let quotient = product.checked_div(c)?;
    Some(floor_to_scale(quotient, scale))
}

/// Convert a rate to basis points (1 bp = 0.01%).
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate weighted average of `(value, weight)` pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_scale() {
        assert_eq!(floor_to_scale(dec!(571.428), 0), dec!(571));
        assert_eq!(floor_to_scale(dec!(1.999999), 2), dec!(1.99));
        assert_eq!(floor_to_scale(dec!(5), 6), dec!(5));
    }

    #[test]
    fn test_mul_div_floor() {
        assert_eq!(mul_div_floor(dec!(100), dec!(3), dec!(7), 2), Some(dec!(42.85)));
        assert_eq!(mul_div_floor(dec!(100), dec!(3), Decimal::ZERO, 2), None);
        assert_eq!(mul_div_floor(Decimal::MAX, dec!(2), dec!(1), 0), None);
    }

    #[test]
    fn test_basis_points() {
        assert_eq!(to_basis_points(dec!(0.0001)), dec!(1));
        assert_eq!(to_basis_points(dec!(0.01)), dec!(100));
    }

    #[test]
    fn test_weighted_average() {
        let values = vec![(dec!(0.10), dec!(600)), (dec!(0.05), dec!(400))];
        assert_eq!(weighted_average(&values), dec!(0.08));
        assert_eq!(weighted_average(&[]), Decimal::ZERO);
    }
}
