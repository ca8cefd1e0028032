// ===============================
// src/domain.rs
// ===============================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_venue(&self) -> &'static str {
        match self {
            Side::Bid => "BUY",
            Side::Ask => "SELL",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Side::Bid => "BID",
            Side::Ask => "ASK",
        }
    }

    pub fn from_venue(s: &str) -> Option<Side> {
        match s {
            "BUY" => Some(Side::Bid),
            "SELL" => Some(Side::Ask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn from_venue(s: &str) -> OrderStatus {
        match s {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::New,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

/// One depth level. Prices and quantities are exact decimals; the venue
/// never sees a binary float from us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Top-of-book snapshot. Bids descending, asks ascending.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub received_at: Instant,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Arithmetic mean of best bid and best ask; `None` while a side is empty.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            _ => None,
        }
    }

    /// best_bid >= best_ask marks the book unusable for quoting this tick.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b >= a,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_quantity: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(p: &str, q: &str) -> PriceLevel {
        PriceLevel::new(p.parse().unwrap(), q.parse().unwrap())
    }

    #[test]
    fn mid_price_is_exact() {
        let book = OrderBook {
            bids: vec![level("50000.00", "1")],
            asks: vec![level("50100.00", "1")],
            received_at: Instant::now(),
        };
        assert_eq!(book.mid_price(), Some(dec!(50050.00)));
        assert!(!book.is_crossed());
    }

    #[test]
    fn empty_side_has_no_mid() {
        let book = OrderBook {
            bids: vec![],
            asks: vec![level("50100.00", "1")],
            received_at: Instant::now(),
        };
        assert_eq!(book.mid_price(), None);
    }

    #[test]
    fn crossed_book_detected() {
        let book = OrderBook {
            bids: vec![level("50100.00", "1")],
            asks: vec![level("50000.00", "1")],
            received_at: Instant::now(),
        };
        assert!(book.is_crossed());
    }

    #[test]
    fn venue_status_round_trip() {
        assert_eq!(OrderStatus::from_venue("CANCELED"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::from_venue("EXPIRED"), OrderStatus::Expired);
        assert!(OrderStatus::from_venue("PARTIALLY_FILLED").is_open());
        assert!(!OrderStatus::from_venue("FILLED").is_open());
    }
}
