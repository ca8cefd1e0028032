// ===============================
// src/manager.rs
// ===============================
//
// Quote engine: keeps one resting bid and one resting ask around the
// published mid. `on_price_change` is the only driver. Gates run first
// (cooldown, hysteresis), then the old pair is cancelled in parallel
// under a per-operation timeout, then both replacement legs are placed
// in parallel. Leg failures are isolated: the surviving leg rests and
// the next tick repairs the pair.
//
// The leg lock is never held across network I/O; legs are copied out,
// the wire work happens, and results are stored back.

use crate::domain::{Order, OrderBook, Side};
use crate::error::Result;
use crate::exchange::Exchange;
use crate::metrics;
use crate::validate::{OrderValidator, Rejection};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct QuoteParams {
    pub symbol: String,
    /// Half-spread fraction s: bid = M(1-s), ask = M(1+s).
    pub spread: f64,
    pub order_size: Decimal,
    pub tick_size: Decimal,
    pub cooldown: Duration,
    /// Minimum relative mid change that justifies a reprice.
    pub hysteresis: f64,
    pub cancel_timeout: Duration,
}

impl QuoteParams {
    pub fn new(symbol: String, spread: f64, order_size: Decimal, tick_size: Decimal) -> Self {
        Self {
            symbol,
            spread,
            order_size,
            tick_size,
            cooldown: Duration::from_millis(100),
            hysteresis: 1e-4,
            cancel_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct QuotePair {
    bid: Option<Order>,
    ask: Option<Order>,
}

impl QuotePair {
    fn is_empty(&self) -> bool {
        self.bid.is_none() && self.ask.is_none()
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_attempted: u64,
    successful_orders: u64,
    failed_orders: u64,
    rejected_by_validation: u64,
    cancels_sent: u64,
    cancel_timeouts: u64,
    reconnects: u64,
    exec: LatencyStats,
    reaction: LatencyStats,
}

#[derive(Debug)]
struct LatencyStats {
    count: u64,
    avg_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self { count: 0, avg_ms: 0.0, min_ms: f64::MAX, max_ms: 0.0 }
    }
}

impl LatencyStats {
    fn record(&mut self, ms: f64) {
        self.avg_ms = (self.avg_ms * self.count as f64 + ms) / (self.count + 1) as f64;
        self.count += 1;
        self.min_ms = self.min_ms.min(ms);
        self.max_ms = self.max_ms.max(ms);
    }
}

/// Read-only view for status prints, the final summary, and tests.
#[derive(Debug, Clone, Copy)]
pub struct QuoteMetrics {
    pub total_attempted: u64,
    pub successful_orders: u64,
    pub failed_orders: u64,
    pub rejected_by_validation: u64,
    pub cancels_sent: u64,
    pub cancel_timeouts: u64,
    pub reconnects: u64,
    pub avg_execution_ms: f64,
    pub min_execution_ms: f64,
    pub max_execution_ms: f64,
    pub avg_reaction_ms: f64,
    pub min_reaction_ms: f64,
    pub max_reaction_ms: f64,
}

pub struct OrderManager {
    exchange: Arc<dyn Exchange>,
    params: QuoteParams,
    validator: Mutex<OrderValidator>,
    legs: Mutex<QuotePair>,
    last_published_mid: Mutex<Option<Decimal>>,
    last_update: Mutex<Option<Instant>>,
    metrics: Mutex<MetricsInner>,
}

impl OrderManager {
    pub fn new(exchange: Arc<dyn Exchange>, params: QuoteParams, validator: OrderValidator) -> Arc<Self> {
        Arc::new(Self {
            exchange,
            params,
            validator: Mutex::new(validator),
            legs: Mutex::new(QuotePair::default()),
            last_published_mid: Mutex::new(None),
            last_update: Mutex::new(None),
            metrics: Mutex::new(MetricsInner::default()),
        })
    }

    /// The sole reprice driver. `book_received_at` is the instant the
    /// book bytes left the socket; it anchors reaction latency.
    pub async fn on_price_change(&self, mid: Decimal, book_received_at: Instant) -> Result<()> {
        if mid <= Decimal::ZERO {
            return Ok(());
        }
        let started = Instant::now();

        // Target prices first, before any network I/O.
        let spread = Decimal::from_f64(self.params.spread).unwrap_or_default();
        let bid_price = round_to_tick(mid * (Decimal::ONE - spread), self.params.tick_size);
        let ask_price = round_to_tick(mid * (Decimal::ONE + spread), self.params.tick_size);

        let have_pair = !self.legs.lock().is_empty();

        // Cooldown gate: no churn while a pair is already resting.
        if have_pair {
            if let Some(last) = *self.last_update.lock() {
                if last.elapsed() < self.params.cooldown {
                    return Ok(());
                }
            }
        }

        // Hysteresis gate: ignore sub-threshold mid moves.
        if have_pair {
            if let Some(last_mid) = *self.last_published_mid.lock() {
                let relative = ((mid - last_mid) / last_mid).to_f64().unwrap_or(0.0).abs();
                if relative < self.params.hysteresis {
                    return Ok(());
                }
            }
        }

        self.cancel_resting_pair().await;
        self.place_pair(mid, bid_price, ask_price).await;

        *self.last_published_mid.lock() = Some(mid);
        *self.last_update.lock() = Some(Instant::now());

        let exec_ms = started.elapsed().as_secs_f64() * 1e3;
        let reaction_ms = book_received_at.elapsed().as_secs_f64() * 1e3;
        {
            let mut m = self.metrics.lock();
            m.exec.record(exec_ms);
            m.reaction.record(reaction_ms);
        }
        metrics::EXECUTION_LATENCY_MS.observe(exec_ms);
        metrics::REACTION_LATENCY_MS.observe(reaction_ms);
        Ok(())
    }

    /// Cancels whatever rests, in parallel, each wait bounded by the
    /// cancel timeout. A timeout detaches the wait without aborting the
    /// venue-side cancel; the spawned task runs to completion.
    async fn cancel_resting_pair(&self) {
        let pair = {
            let mut legs = self.legs.lock();
            std::mem::take(&mut *legs)
        };
        if pair.is_empty() {
            return;
        }

        let mut waits = Vec::with_capacity(2);
        for order in [pair.bid, pair.ask].into_iter().flatten() {
            let exchange = Arc::clone(&self.exchange);
            let symbol = self.params.symbol.clone();
            self.metrics.lock().cancels_sent += 1;
            waits.push((
                order.side,
                tokio::spawn(async move { exchange.cancel_order(&symbol, &order.order_id).await }),
            ));
        }

        for (side, wait) in waits {
            match timeout(self.params.cancel_timeout, wait).await {
                Ok(Ok(Ok(_))) => {
                    metrics::CANCELS.with_label_values(&["ok"]).inc();
                }
                Ok(Ok(Err(e))) => {
                    metrics::CANCELS.with_label_values(&["failed"]).inc();
                    warn!(side = side.tag(), error = %e, "cancel failed");
                }
                Ok(Err(join_err)) => {
                    metrics::CANCELS.with_label_values(&["failed"]).inc();
                    warn!(side = side.tag(), error = %join_err, "cancel task died");
                }
                Err(_) => {
                    self.metrics.lock().cancel_timeouts += 1;
                    metrics::CANCELS.with_label_values(&["timeout"]).inc();
                    warn!(side = side.tag(), timeout_ms = self.params.cancel_timeout.as_millis() as u64, "cancel wait timed out");
                }
            }
        }
    }

    /// Validates and places both legs in parallel. Each leg is validated
    /// on its own and skipped independently; a crossed pair kills both.
    /// A rejection or venue failure leaves that slot empty.
    async fn place_pair(&self, mid: Decimal, bid_price: Decimal, ask_price: Decimal) {
        let quantity = self.params.order_size;

        let (mut bid_check, mut ask_check) = {
            let validator = self.validator.lock();
            (
                validator.validate_order(bid_price, quantity, Side::Bid, mid),
                validator.validate_order(ask_price, quantity, Side::Ask, mid),
            )
        };

        // bid < ask must hold before either leg goes out.
        if bid_check.is_ok() && ask_check.is_ok() && bid_price >= ask_price {
            let crossed = Rejection {
                reason: format!("quotes are crossed: bid {bid_price} >= ask {ask_price}"),
                suggested_price: None,
                suggested_quantity: None,
            };
            bid_check = Err(crossed.clone());
            ask_check = Err(crossed);
        }

        let bid_task = match bid_check {
            Ok(()) => Some(self.spawn_place(Side::Bid, bid_price, quantity)),
            Err(rejection) => {
                self.reject_leg(Side::Bid, &rejection);
                None
            }
        };
        let ask_task = match ask_check {
            Ok(()) => Some(self.spawn_place(Side::Ask, ask_price, quantity)),
            Err(rejection) => {
                self.reject_leg(Side::Ask, &rejection);
                None
            }
        };

        let (bid_result, ask_result) = match (bid_task, ask_task) {
            (Some(b), Some(a)) => tokio::join!(b, a),
            (Some(b), None) => (b.await, None),
            (None, Some(a)) => (None, a.await),
            (None, None) => (None, None),
        };

        let mut legs = self.legs.lock();
        legs.bid = bid_result;
        legs.ask = ask_result;
    }

    async fn spawn_place(&self, side: Side, price: Decimal, quantity: Decimal) -> Option<Order> {
        self.metrics.lock().total_attempted += 1;

        let exchange = Arc::clone(&self.exchange);
        let symbol = self.params.symbol.clone();
        let client_order_id = generate_client_order_id(side);

        let task = tokio::spawn(async move {
            exchange
                .place_limit_order(&symbol, side, price, quantity, &client_order_id)
                .await
        });

        match task.await {
            Ok(Ok(order)) => {
                self.metrics.lock().successful_orders += 1;
                metrics::ORDERS_PLACED.with_label_values(&[side.tag()]).inc();
                info!(
                    side = side.tag(),
                    order_id = %order.order_id,
                    price = %order.price,
                    quantity = %order.quantity,
                    "order resting"
                );
                Some(order)
            }
            Ok(Err(e)) => {
                self.metrics.lock().failed_orders += 1;
                metrics::ORDERS_FAILED.with_label_values(&[side.tag()]).inc();
                warn!(side = side.tag(), price = %price, error = %e, "place failed");
                None
            }
            Err(join_err) => {
                self.metrics.lock().failed_orders += 1;
                metrics::ORDERS_FAILED.with_label_values(&[side.tag()]).inc();
                warn!(side = side.tag(), error = %join_err, "place task died");
                None
            }
        }
    }

    fn reject_leg(&self, side: Side, rejection: &Rejection) {
        let mut m = self.metrics.lock();
        m.total_attempted += 1;
        m.rejected_by_validation += 1;
        drop(m);
        metrics::ORDERS_REJECTED.inc();
        warn!(
            side = side.tag(),
            reason = %rejection.reason,
            suggested_price = ?rejection.suggested_price,
            suggested_quantity = ?rejection.suggested_quantity,
            "leg rejected before send"
        );
    }

    /// Shutdown path: cancel whatever legs exist in parallel, ignore
    /// individual failures, clear the pair.
    pub async fn cancel_all(&self) {
        self.cancel_resting_pair().await;
    }

    /// Live book feedback for the validator's dynamic price band.
    pub fn update_limits(&self, book: &OrderBook) {
        self.validator.lock().update_limits(book);
    }

    pub fn record_reconnect(&self) {
        self.metrics.lock().reconnects += 1;
    }

    pub fn active_quotes(&self) -> (Option<Order>, Option<Order>) {
        let legs = self.legs.lock();
        (legs.bid.clone(), legs.ask.clone())
    }

    pub fn metrics(&self) -> QuoteMetrics {
        let m = self.metrics.lock();
        QuoteMetrics {
            total_attempted: m.total_attempted,
            successful_orders: m.successful_orders,
            failed_orders: m.failed_orders,
            rejected_by_validation: m.rejected_by_validation,
            cancels_sent: m.cancels_sent,
            cancel_timeouts: m.cancel_timeouts,
            reconnects: m.reconnects,
            avg_execution_ms: m.exec.avg_ms,
            min_execution_ms: if m.exec.count == 0 { 0.0 } else { m.exec.min_ms },
            max_execution_ms: m.exec.max_ms,
            avg_reaction_ms: m.reaction.avg_ms,
            min_reaction_ms: if m.reaction.count == 0 { 0.0 } else { m.reaction.min_ms },
            max_reaction_ms: m.reaction.max_ms,
        }
    }
}

/// Snaps a raw price onto the venue tick grid.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).round() * tick
}

/// `MM_<SIDE>_<epoch_ns>_<rand6>`; unique per session per side.
pub fn generate_client_order_id(side: Side) -> String {
    let epoch_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let suffix: u32 = rand::thread_rng().gen_range(100_000..=999_999);
    format!("MM_{}_{}_{}", side.tag(), epoch_ns, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn tick_rounding_snaps_to_grid() {
        assert_eq!(round_to_tick(dec!(49049.004), dec!(0.01)), dec!(49049.00));
        assert_eq!(round_to_tick(dec!(49049.006), dec!(0.01)), dec!(49049.01));
        assert_eq!(round_to_tick(dec!(50050), dec!(0.01)), dec!(50050));
        // degenerate tick leaves the price alone
        assert_eq!(round_to_tick(dec!(1.23), Decimal::ZERO), dec!(1.23));
    }

    #[test]
    fn scenario_prices_match_reference() {
        // s = 0.02, tick = 0.01, M = 50050 -> 49049.00 / 51051.00
        let spread = Decimal::from_f64(0.02).unwrap();
        let mid = dec!(50050);
        let bid = round_to_tick(mid * (Decimal::ONE - spread), dec!(0.01));
        let ask = round_to_tick(mid * (Decimal::ONE + spread), dec!(0.01));
        assert_eq!(bid, dec!(49049.00));
        assert_eq!(ask, dec!(51051.00));
    }

    #[test]
    fn client_order_ids_have_shape_and_are_unique() {
        let a = generate_client_order_id(Side::Bid);
        let b = generate_client_order_id(Side::Ask);
        assert!(a.starts_with("MM_BID_"));
        assert!(b.starts_with("MM_ASK_"));
        assert_ne!(a, b);

        let parts: Vec<&str> = a.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3].len(), 6);
        assert!(parts[2].parse::<i128>().is_ok());

        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_client_order_id(Side::Bid)));
        }
    }

    #[test]
    fn latency_stats_track_min_max_avg() {
        let mut stats = LatencyStats::default();
        stats.record(10.0);
        stats.record(20.0);
        stats.record(30.0);
        assert_eq!(stats.count, 3);
        assert!((stats.avg_ms - 20.0).abs() < 1e-9);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
    }
}
