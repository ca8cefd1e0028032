// ===============================
// src/book.rs
// ===============================
//
// Depth-snapshot decoder. The stream repeats a full top-N view every
// 100ms, so each document replaces the book outright. Documents without
// bids/asks members are ignored; empty sides and crossed books are
// dropped before anything downstream can quote off them.

use crate::domain::{OrderBook, PriceLevel};
use crate::metrics;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, warn};

/// Minimum absolute mid move worth publishing downstream.
const PUBLISH_EPSILON: Decimal = dec!(0.00001);

#[derive(Debug, Deserialize)]
struct DepthDocument {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

/// A published price change: the new book, its mid, and the instant the
/// bytes were read from the socket (origin of reaction latency).
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub book: OrderBook,
    pub mid: Decimal,
    pub received_at: Instant,
}

#[derive(Debug, Default)]
pub struct BookDecoder {
    last_published_mid: Option<Decimal>,
}

impl BookDecoder {
    pub fn new() -> Self {
        Self { last_published_mid: None }
    }

    /// Decodes one stream document. Returns a `BookUpdate` only when the
    /// book is usable and the mid moved by more than the publish epsilon.
    pub fn on_message(&mut self, text: &str, received_at: Instant) -> Option<BookUpdate> {
        let doc: DepthDocument = match serde_json::from_str(text) {
            Ok(doc) => doc,
            // Other stream documents (subscription acks etc.) are ignored.
            Err(_) => return None,
        };

        let book = match parse_book(&doc, received_at) {
            Ok(book) => book,
            Err(reason) => {
                metrics::BOOK_REJECTED.with_label_values(&[reason]).inc();
                debug!(reason, "book snapshot rejected");
                return None;
            }
        };
        metrics::BOOK_UPDATES.inc();

        let mid = book.mid_price()?;
        if let Some(last) = self.last_published_mid {
            if (mid - last).abs() <= PUBLISH_EPSILON {
                return None;
            }
        }
        self.last_published_mid = Some(mid);
        metrics::PRICE_CHANGES.inc();

        Some(BookUpdate { book, mid, received_at })
    }
}

fn parse_book(doc: &DepthDocument, received_at: Instant) -> Result<OrderBook, &'static str> {
    let bids = parse_levels(&doc.bids)?;
    let asks = parse_levels(&doc.asks)?;
    if bids.is_empty() || asks.is_empty() {
        return Err("empty_side");
    }

    let mut book = OrderBook { bids, asks, received_at };
    book.bids.sort_by(|a, b| b.price.cmp(&a.price));
    book.asks.sort_by(|a, b| a.price.cmp(&b.price));

    if book.is_crossed() {
        warn!(
            best_bid = %book.best_bid().unwrap_or_default(),
            best_ask = %book.best_ask().unwrap_or_default(),
            "crossed book, unusable this tick"
        );
        return Err("crossed");
    }
    Ok(book)
}

fn parse_levels(raw: &[(String, String)]) -> Result<Vec<PriceLevel>, &'static str> {
    raw.iter()
        .map(|(p, q)| {
            let price: Decimal = p.parse().map_err(|_| "bad_price")?;
            let quantity: Decimal = q.parse().map_err(|_| "bad_quantity")?;
            if price <= Decimal::ZERO || quantity < Decimal::ZERO {
                return Err("bad_price");
            }
            Ok(PriceLevel::new(price, quantity))
        })
        .collect()
}
