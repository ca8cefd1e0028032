// ===============================
// src/supervisor.rs
// ===============================
//
// Owns the pieces and their lifecycle: builds the adapter through the
// factory, pumps stream events through the book decoder, pokes the
// worker on every published price change, and tears everything down in
// order on shutdown. The worker waits with a short timeout so the
// periodic status line still prints when the market goes quiet.

use crate::book::BookDecoder;
use crate::config::Config;
use crate::domain::OrderBook;
use crate::error::Result;
use crate::exchange::{Exchange, ExchangeConfig, ExchangeFactory};
use crate::manager::{OrderManager, QuoteParams};
use crate::ratelimit::OrderRateLimiters;
use crate::validate::{OrderValidator, TradingLimits};
use crate::ws::{spawn_stream, StreamConfig, StreamEvent};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

const WORKER_POLL: Duration = Duration::from_millis(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_CANCEL_BUDGET: Duration = Duration::from_secs(2);

/// Latest decoded book plus the not-yet-consumed price change.
/// Single writer (the ingest task), many readers.
#[derive(Default)]
struct SharedBook {
    latest: RwLock<Option<OrderBook>>,
    pending: Mutex<Option<(Decimal, Instant)>>,
    changed: Notify,
}

pub struct Supervisor {
    config: Config,
    exchange: Arc<dyn Exchange>,
    manager: Arc<OrderManager>,
    limiters: Arc<OrderRateLimiters>,
    book: Arc<SharedBook>,
    running: Arc<AtomicBool>,
}

impl Supervisor {
    /// Builds and initializes every component. Failures here are fatal
    /// and map to exit code 1.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let limiters = Arc::new(OrderRateLimiters::new(config.max_orders_per_second as usize));

        let factory = ExchangeFactory::with_builtin();
        let exchange = factory.create(ExchangeConfig::from_config(&config), Arc::clone(&limiters))?;
        exchange.initialize().await?;

        // Venue rules win over the configured fallbacks.
        let tick_size = exchange.tick_size(&config.symbol);
        let limits = match exchange.symbol_rules(&config.symbol) {
            Some(rules) => TradingLimits {
                min_quantity: rules.min_quantity,
                max_quantity: rules.max_quantity,
                min_notional: rules.min_notional,
                max_notional: rules.max_notional,
                ..TradingLimits::default()
            },
            None => {
                warn!(symbol = %config.symbol, "no venue rules for symbol, using defaults");
                TradingLimits::default()
            }
        };

        let mut params = QuoteParams::new(
            config.symbol.clone(),
            config.spread,
            config.order_size,
            tick_size,
        );
        params.cooldown = config.order_update_cooldown;

        let manager = OrderManager::new(
            Arc::clone(&exchange),
            params,
            OrderValidator::new(limits),
        );

        info!(
            exchange = exchange.name(),
            symbol = %config.symbol,
            tick = %tick_size,
            spread = config.spread,
            order_size = %config.order_size,
            ws_trading = config.use_websocket_trading,
            "supervisor initialized"
        );

        Ok(Arc::new(Self {
            config,
            exchange,
            manager,
            limiters,
            book: Arc::new(SharedBook::default()),
            running: Arc::new(AtomicBool::new(true)),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flags the worker down and wakes it. Safe from any task.
    pub fn begin_shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.book.changed.notify_waiters();
    }

    /// Runs until shutdown, then unwinds: cancel the pair (bounded),
    /// stop the stream, disconnect trading (failing its pendings), and
    /// print the final summary.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let stream_url = self.exchange.stream_url(&self.config.symbol, self.config.book_depth)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel::<StreamEvent>();
        let stream = spawn_stream(
            StreamConfig {
                url: stream_url,
                subscriptions: Vec::new(),
                ping_interval: Duration::from_secs(15),
                idle_timeout: Duration::from_secs(30),
                reconnect_delay: self.config.reconnect_delay,
                max_reconnect_attempts: self.config.max_reconnect_attempts,
                channel: "market_data",
            },
            events_tx,
        );

        let ingest = tokio::spawn(Self::ingest_loop(
            Arc::clone(self),
            events_rx,
        ));

        // Trading transport death is as fatal as losing market data.
        if let Some(mut fatal_rx) = self.exchange.trading_fatal() {
            let sup = Arc::clone(self);
            tokio::spawn(async move {
                while fatal_rx.changed().await.is_ok() {
                    if *fatal_rx.borrow() {
                        error!("trading transport is gone for good");
                        sup.begin_shutdown();
                        return;
                    }
                }
            });
        }

        // Worker: wait for a price-change nudge (short timeout so the
        // status line prints even in a quiet market).
        let mut last_status = Instant::now();
        while self.is_running() {
            tokio::select! {
                _ = self.book.changed.notified() => {}
                _ = sleep(WORKER_POLL) => {}
            }
            if !self.is_running() {
                break;
            }

            let pending = self.book.pending.lock().take();
            if let Some((mid, received_at)) = pending {
                if let Err(e) = self.manager.on_price_change(mid, received_at).await {
                    warn!(error = %e, "reprice failed");
                }
            }

            if last_status.elapsed() >= STATUS_INTERVAL {
                self.print_status();
                last_status = Instant::now();
            }
        }

        info!("shutting down");
        if timeout(SHUTDOWN_CANCEL_BUDGET, self.manager.cancel_all()).await.is_err() {
            warn!("cancel_all did not finish within the shutdown budget");
        }
        stream.shutdown();
        self.exchange.disconnect().await;
        stream.join().await;
        let _ = ingest.await;

        self.print_final_summary();
        Ok(())
    }

    /// Pumps stream events into the decoder and publishes price changes.
    async fn ingest_loop(
        sup: Arc<Supervisor>,
        mut events: mpsc::UnboundedReceiver<StreamEvent>,
    ) {
        let mut decoder = BookDecoder::new();
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Message { text, received_at } => {
                    if let Some(update) = decoder.on_message(&text, received_at) {
                        sup.manager.update_limits(&update.book);
                        *sup.book.latest.write() = Some(update.book);
                        *sup.book.pending.lock() = Some((update.mid, update.received_at));
                        sup.book.changed.notify_one();
                    }
                }
                StreamEvent::Status(true) => {
                    info!(exchange = sup.exchange.name(), "market data connected");
                }
                StreamEvent::Status(false) => {
                    warn!(exchange = sup.exchange.name(), "market data disconnected");
                    sup.manager.record_reconnect();
                }
                StreamEvent::Fatal(e) => {
                    error!(error = %e, "market data stream is gone for good");
                    sup.begin_shutdown();
                    break;
                }
            }
        }
    }

    fn print_status(&self) {
        let mid = self
            .book
            .latest
            .read()
            .as_ref()
            .and_then(|b| b.mid_price())
            .unwrap_or_default();
        let (bid, ask) = self.manager.active_quotes();
        let m = self.manager.metrics();

        info!(
            mid = %mid,
            active_bid = bid.map(|o| o.price.to_string()).unwrap_or_else(|| "-".into()),
            active_ask = ask.map(|o| o.price.to_string()).unwrap_or_else(|| "-".into()),
            attempted = m.total_attempted,
            ok = m.successful_orders,
            failed = m.failed_orders,
            rejected = m.rejected_by_validation,
            avg_exec_ms = format!("{:.3}", m.avg_execution_ms),
            avg_reaction_ms = format!("{:.3}", m.avg_reaction_ms),
            "status"
        );
        self.limiters.log_status();
    }

    fn print_final_summary(&self) {
        let m = self.manager.metrics();
        info!(
            attempted = m.total_attempted,
            ok = m.successful_orders,
            failed = m.failed_orders,
            rejected = m.rejected_by_validation,
            cancels = m.cancels_sent,
            cancel_timeouts = m.cancel_timeouts,
            reconnects = m.reconnects,
            avg_exec_ms = format!("{:.3}", m.avg_execution_ms),
            min_exec_ms = format!("{:.3}", m.min_execution_ms),
            max_exec_ms = format!("{:.3}", m.max_execution_ms),
            avg_reaction_ms = format!("{:.3}", m.avg_reaction_ms),
            min_reaction_ms = format!("{:.3}", m.min_reaction_ms),
            max_reaction_ms = format!("{:.3}", m.max_reaction_ms),
            "final statistics"
        );
    }
}
