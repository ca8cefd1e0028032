// ===============================
// src/validate.rs
// ===============================
//
// Pre-send order validation. Everything here runs before a request is
// built: a rejected leg never touches the network. Rejections carry a
// suggested adjustment so the operator can see what would have passed.

use crate::domain::{OrderBook, Side};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Fat-finger guard: quotes further than this from the mid are refused.
const MAX_DEVIATION: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct TradingLimits {
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub min_quantity: Decimal,
    pub max_quantity: Decimal,
    pub min_notional: Decimal,
    pub max_notional: Decimal,
}

impl Default for TradingLimits {
    fn default() -> Self {
        Self {
            min_price: dec!(0.01),
            max_price: dec!(1000000),
            min_quantity: dec!(0.00001),
            max_quantity: dec!(10000),
            min_notional: dec!(10),
            max_notional: dec!(100000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub reason: String,
    pub suggested_price: Option<Decimal>,
    pub suggested_quantity: Option<Decimal>,
}

impl Rejection {
    fn new(reason: String) -> Self {
        Self { reason, suggested_price: None, suggested_quantity: None }
    }
}

#[derive(Debug, Clone)]
pub struct OrderValidator {
    limits: TradingLimits,
}

impl OrderValidator {
    pub fn new(limits: TradingLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &TradingLimits {
        &self.limits
    }

    /// Validates a single leg against limits and the current mid.
    pub fn validate_order(
        &self,
        price: Decimal,
        quantity: Decimal,
        side: Side,
        mid: Decimal,
    ) -> Result<(), Rejection> {
        if price < self.limits.min_price || price > self.limits.max_price {
            let mut r = Rejection::new(format!(
                "price {price} outside [{}, {}]",
                self.limits.min_price, self.limits.max_price
            ));
            r.suggested_price = Some(price.clamp(self.limits.min_price, self.limits.max_price));
            return Err(r);
        }

        if quantity <= Decimal::ZERO
            || quantity < self.limits.min_quantity
            || quantity > self.limits.max_quantity
        {
            let mut r = Rejection::new(format!(
                "quantity {quantity} outside [{}, {}]",
                self.limits.min_quantity, self.limits.max_quantity
            ));
            r.suggested_quantity =
                Some(quantity.clamp(self.limits.min_quantity, self.limits.max_quantity));
            return Err(r);
        }

        let notional = price * quantity;
        if notional < self.limits.min_notional || notional > self.limits.max_notional {
            let mut r = Rejection::new(format!(
                "notional {notional} outside [{}, {}]",
                self.limits.min_notional, self.limits.max_notional
            ));
            r.suggested_quantity = if notional < self.limits.min_notional {
                Some(self.limits.min_notional / price)
            } else {
                Some(self.limits.max_notional / price)
            };
            return Err(r);
        }

        if mid > Decimal::ZERO {
            let deviation = ((price - mid) / mid).to_f64().unwrap_or(f64::INFINITY).abs();
            if !deviation.is_finite() || deviation > MAX_DEVIATION {
                let band = Decimal::try_from(MAX_DEVIATION).unwrap_or(dec!(0.10));
                let mut r = Rejection::new(format!(
                    "price {price} deviates more than 10% from mid {mid}"
                ));
                // Clamp the suggestion to the edge of the allowed band.
                r.suggested_price = Some(match side {
                    Side::Bid => mid * (Decimal::ONE - band),
                    Side::Ask => mid * (Decimal::ONE + band),
                });
                return Err(r);
            }
        }

        Ok(())
    }

    /// Validates a full quote pair; both legs plus the bid<ask ordering.
    pub fn validate_quote_pair(
        &self,
        bid_price: Decimal,
        ask_price: Decimal,
        quantity: Decimal,
        mid: Decimal,
    ) -> Result<(), Rejection> {
        self.validate_order(bid_price, quantity, Side::Bid, mid)?;
        self.validate_order(ask_price, quantity, Side::Ask, mid)?;

        if bid_price >= ask_price {
            return Err(Rejection::new(format!(
                "quotes are crossed: bid {bid_price} >= ask {ask_price}"
            )));
        }
        Ok(())
    }

    /// Refreshes the price band from the live book so the limits track
    /// the market instead of going stale.
    pub fn update_limits(&mut self, book: &OrderBook) {
        if let Some(mid) = book.mid_price() {
            self.limits.min_price = mid / Decimal::TWO;
            self.limits.max_price = mid * Decimal::TWO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PriceLevel;
    use std::time::Instant;

    fn validator() -> OrderValidator {
        OrderValidator::new(TradingLimits::default())
    }

    #[test]
    fn happy_path_passes() {
        let v = validator();
        assert!(v.validate_order(dec!(50000), dec!(0.001), Side::Bid, dec!(50050)).is_ok());
    }

    #[test]
    fn quantity_bounds_are_inclusive() {
        let v = OrderValidator::new(TradingLimits {
            min_quantity: dec!(0.001),
            max_quantity: dec!(1),
            min_notional: dec!(1),
            max_notional: dec!(1000000),
            ..TradingLimits::default()
        });
        assert!(v.validate_order(dec!(50000), dec!(0.001), Side::Bid, dec!(50000)).is_ok());
        assert!(v.validate_order(dec!(50000), dec!(1), Side::Bid, Decimal::ZERO).is_ok());
        assert!(v.validate_order(dec!(50000), dec!(0.0009), Side::Bid, dec!(50000)).is_err());
    }

    #[test]
    fn notional_minimum_is_inclusive() {
        let v = validator();
        // 10000 * 0.001 = 10 == min_notional
        assert!(v.validate_order(dec!(10000), dec!(0.001), Side::Bid, dec!(10000)).is_ok());
        // just below
        let err = v
            .validate_order(dec!(9000), dec!(0.001), Side::Bid, dec!(9000))
            .unwrap_err();
        assert!(err.reason.contains("notional"));
        assert_eq!(err.suggested_quantity, Some(dec!(10) / dec!(9000)));
    }

    #[test]
    fn deviation_above_ten_percent_rejected_with_clamped_suggestion() {
        let v = validator();
        let mid = dec!(50000);
        let err = v.validate_order(dec!(40000), dec!(0.01), Side::Bid, mid).unwrap_err();
        assert!(err.reason.contains("deviates"));
        assert_eq!(err.suggested_price, Some(dec!(45000.0)));

        let err = v.validate_order(dec!(60000), dec!(0.01), Side::Ask, mid).unwrap_err();
        assert_eq!(err.suggested_price, Some(dec!(55000.0)));
    }

    #[test]
    fn deviation_at_boundary_passes() {
        let v = validator();
        // exactly 10% off mid is allowed; the gate is strictly-greater
        assert!(v.validate_order(dec!(45000), dec!(0.01), Side::Bid, dec!(50000)).is_ok());
    }

    #[test]
    fn price_band_rejection_suggests_clamp() {
        let v = OrderValidator::new(TradingLimits {
            min_price: dec!(100),
            max_price: dec!(200),
            ..TradingLimits::default()
        });
        let err = v.validate_order(dec!(50), dec!(1), Side::Bid, Decimal::ZERO).unwrap_err();
        assert_eq!(err.suggested_price, Some(dec!(100)));
    }

    #[test]
    fn crossed_pair_rejected() {
        let v = validator();
        let err = v
            .validate_quote_pair(dec!(50100), dec!(50000), dec!(0.001), dec!(50050))
            .unwrap_err();
        assert!(err.reason.contains("crossed"));
    }

    #[test]
    fn valid_pair_passes() {
        let v = validator();
        assert!(v
            .validate_quote_pair(dec!(49049.00), dec!(51051.00), dec!(0.001), dec!(50050))
            .is_ok());
    }

    #[test]
    fn update_limits_tracks_mid() {
        let mut v = validator();
        let book = OrderBook {
            bids: vec![PriceLevel::new(dec!(50000), dec!(1))],
            asks: vec![PriceLevel::new(dec!(50100), dec!(1))],
            received_at: Instant::now(),
        };
        v.update_limits(&book);
        assert_eq!(v.limits().min_price, dec!(25025));
        assert_eq!(v.limits().max_price, dec!(100100));
    }
}
