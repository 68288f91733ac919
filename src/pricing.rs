use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Fixed regional sales tax rate (QC, 15%).
pub const TAX_RATE: Decimal = dec!(0.15);

/// Flat shipping charge applied at order creation; never recomputed later.
pub const SHIPPING_FLAT: Decimal = dec!(10.00);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone)]
pub struct LineAmounts {
    pub quantity: i32,
    pub unit_price: Decimal,
    pub discount: Decimal,
}

impl LineAmounts {
    pub fn subtotal(&self) -> Decimal {
        Decimal::from(self.quantity) * self.unit_price - self.discount
    }
}

/// Derive subtotal, tax, shipping and grand total from order lines.
///
/// Pure function, no side effects. Tax is rounded to 2 decimal places with
/// half-up (midpoint away from zero) rounding; line subtotals are exact
/// decimal arithmetic so no other rounding step exists.
pub fn calculate_totals(lines: &[LineAmounts]) -> OrderTotals {
    let subtotal: Decimal = lines.iter().map(LineAmounts::subtotal).sum();
    let tax = (subtotal * TAX_RATE)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let shipping = SHIPPING_FLAT;
    let total = subtotal + tax + shipping;

    OrderTotals {
        subtotal,
        tax,
        shipping,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(quantity: i32, unit_price: Decimal) -> LineAmounts {
        LineAmounts {
            quantity,
            unit_price,
            discount: Decimal::ZERO,
        }
    }

    #[test]
    fn reference_cart_totals() {
        // 2 x $10.00 + 1 x $25.00
        let totals = calculate_totals(&[line(2, dec!(10.00)), line(1, dec!(25.00))]);
        assert_eq!(totals.subtotal, dec!(45.00));
        assert_eq!(totals.tax, dec!(6.75));
        assert_eq!(totals.shipping, dec!(10.00));
        assert_eq!(totals.total, dec!(61.75));
    }

    #[test]
    fn total_is_sum_of_parts() {
        let totals = calculate_totals(&[line(3, dec!(19.99)), line(1, dec!(4.50))]);
        assert_eq!(totals.total, totals.subtotal + totals.tax + totals.shipping);
    }

    #[test]
    fn tax_midpoint_rounds_away_from_zero() {
        // subtotal 0.10 -> raw tax 0.015 -> 0.02 under half-up
        let totals = calculate_totals(&[line(1, dec!(0.10))]);
        assert_eq!(totals.tax, dec!(0.02));
        assert_eq!(totals.total, dec!(10.12));
    }

    #[test]
    fn discounts_reduce_the_line_subtotal() {
        let totals = calculate_totals(&[LineAmounts {
            quantity: 2,
            unit_price: dec!(30.00),
            discount: dec!(5.00),
        }]);
        assert_eq!(totals.subtotal, dec!(55.00));
        assert_eq!(totals.tax, dec!(8.25));
        assert_eq!(totals.total, dec!(73.25));
    }
}
