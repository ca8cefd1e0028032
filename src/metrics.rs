// ===============================
// src/metrics.rs
// ===============================

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static BOOK_UPDATES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("book_updates_total", "order book snapshots decoded").unwrap());

pub static BOOK_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("book_rejected_total", "snapshots dropped before publication"),
        &["reason"],
    )
    .unwrap()
});

pub static PRICE_CHANGES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("price_changes_total", "mid moves published to the quote engine").unwrap()
});

// -------- Quote engine --------
pub static ORDERS_PLACED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_placed_total", "accepted placements"), &["side"]).unwrap()
});

pub static ORDERS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_failed_total", "failed placements"), &["side"]).unwrap()
});

pub static ORDERS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "orders_rejected_total",
        "legs rejected by pre-send validation (no network call)",
    )
    .unwrap()
});

pub static CANCELS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cancels_total", "cancel outcomes"),
        &["outcome"], // ok | failed | timeout
    )
    .unwrap()
});

pub static EXECUTION_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "execution_latency_ms",
            "reprice decision to issuance complete (ms)",
        )
        .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
    )
    .unwrap()
});

pub static REACTION_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "reaction_latency_ms",
            "book bytes received to issuance complete (ms)",
        )
        .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
    )
    .unwrap()
});

// -------- Transport health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("ws_connected", "1 while the stream is connected"),
        &["channel"], // market_data | trading
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ws_reconnects_total", "reconnect attempts"), &["channel"])
        .unwrap()
});

pub static REQUEST_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("request_timeouts_total", "trading requests that timed out").unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(BOOK_UPDATES.clone())),
        REGISTRY.register(Box::new(BOOK_REJECTED.clone())),
        REGISTRY.register(Box::new(PRICE_CHANGES.clone())),
        REGISTRY.register(Box::new(ORDERS_PLACED.clone())),
        REGISTRY.register(Box::new(ORDERS_FAILED.clone())),
        REGISTRY.register(Box::new(ORDERS_REJECTED.clone())),
        REGISTRY.register(Box::new(CANCELS.clone())),
        REGISTRY.register(Box::new(EXECUTION_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(REACTION_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(REQUEST_TIMEOUTS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, error = %e, "metrics bind failed");
                return;
            }
        };
        tracing::info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(error = %e, "metrics accept error"),
            }
        }
    });
}
