// ===============================
// src/trading_ws.rs
// ===============================
//
// Persistent authenticated trading stream. Requests carry a uuid id and
// a signed params object; responses are matched back to the waiting
// caller through a single-shot slot per request. The pending table and
// its closed flag live under one mutex, so the disconnect sweep and new
// registrations cannot interleave: once the session is closed every
// registration fails until the stream is re-established.

use crate::auth;
use crate::error::{Error, Result};
use crate::metrics;
use crate::ws::{self, WsEvent, WsWriter};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Pending-request correlation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingRequest {
    method: String,
    sent_at: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

#[derive(Debug, Default)]
struct CorrelatorInner {
    closed: bool,
    pending: HashMap<String, PendingRequest>,
}

/// Request/response correlation table. No I/O happens under its lock.
#[derive(Debug, Default)]
pub struct Correlator {
    inner: Mutex<CorrelatorInner>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter. Fails with `SessionClosed` once the sweep ran.
    pub fn register(&self, id: &str, method: &str) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(
            id.to_string(),
            PendingRequest { method: method.to_string(), sent_at: Instant::now(), slot: tx },
        );
        Ok(rx)
    }

    /// Completes a request exactly once; returns the elapsed round trip
    /// if the id was known.
    pub fn complete(&self, id: &str, result: Result<Value>) -> Option<Duration> {
        let entry = self.inner.lock().pending.remove(id)?;
        let elapsed = entry.sent_at.elapsed();
        let _ = entry.slot.send(result);
        Some(elapsed)
    }

    /// Drops a waiter (send failure or caller timeout).
    pub fn evict(&self, id: &str) {
        self.inner.lock().pending.remove(id);
    }

    /// Fails every outstanding waiter and rejects future registrations.
    pub fn close_session(&self) {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending.drain().map(|(_, p)| p).collect()
        };
        for p in drained {
            debug!(method = %p.method, "failing pending request on session close");
            let _ = p.slot.send(Err(Error::SessionClosed));
        }
    }

    /// Accepts registrations again after a reconnect.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

// ---------------------------------------------------------------------------
// Trading client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WsTradingConfig {
    pub url: Url,
    pub api_key: String,
    pub api_secret: String,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl WsTradingConfig {
    pub fn new(url: Url, api_key: String, api_secret: String) -> Self {
        Self {
            url,
            api_key,
            api_secret,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

pub struct WsTradingClient {
    cfg: WsTradingConfig,
    correlator: Correlator,
    writer: AsyncMutex<Option<WsWriter>>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
    fatal: watch::Sender<bool>,
}

impl WsTradingClient {
    pub fn new(cfg: WsTradingConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let (fatal, _) = watch::channel(false);
        Arc::new(Self {
            cfg,
            correlator: Correlator::new(),
            writer: AsyncMutex::new(None),
            connected: AtomicBool::new(false),
            shutdown,
            fatal,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flips to true when the reconnect budget is exhausted and the
    /// session task has stopped for good.
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal.subscribe()
    }

    /// Establishes the session and spawns the reader/reconnect task.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (reader, writer) = ws::connect(&self.cfg.url).await?;
        *self.writer.lock().await = Some(writer);
        self.correlator.reopen();
        self.connected.store(true, Ordering::Release);
        metrics::WS_CONNECTED.with_label_values(&["trading"]).set(1);
        info!(url = %self.cfg.url, "trading stream connected");

        let client = Arc::clone(self);
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            client.session_loop(reader, shutdown_rx).await;
        });
        Ok(())
    }

    /// Tears the session down and fails every pending request.
    pub async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        self.connected.store(false, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send_close().await;
        }
        self.correlator.close_session();
        metrics::WS_CONNECTED.with_label_values(&["trading"]).set(0);
        info!("trading stream disconnected");
    }

    /// Reader loop plus reconnect policy. Each disconnect sweeps the
    /// pending table before any reconnect attempt is made.
    async fn session_loop(
        self: Arc<Self>,
        mut reader: ws::WsReader,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempts: u32 = 0;
        loop {
            let session_end = loop {
                tokio::select! {
                    event = reader.next_event() => match event {
                        Ok(WsEvent::Text(text)) => self.handle_message(&text),
                        Ok(WsEvent::Binary(bytes)) => {
                            if let Ok(text) = String::from_utf8(bytes) {
                                self.handle_message(&text);
                            }
                        }
                        Ok(WsEvent::Ping(payload)) => {
                            let mut writer = self.writer.lock().await;
                            if let Some(w) = writer.as_mut() {
                                if w.send_pong(&payload).await.is_err() {
                                    break "pong failed";
                                }
                            }
                        }
                        Ok(WsEvent::Pong) => {}
                        Ok(WsEvent::Close) => break "closed by server",
                        Err(e) => {
                            warn!(error = %e, "trading stream read error");
                            break "read error";
                        }
                    },
                    _ = shutdown.changed() => return,
                }
            };

            // Session down: reject new work, fail all waiters.
            self.connected.store(false, Ordering::Release);
            self.writer.lock().await.take();
            self.correlator.close_session();
            metrics::WS_CONNECTED.with_label_values(&["trading"]).set(0);
            warn!(reason = session_end, "trading session ended");

            loop {
                if *shutdown.borrow() {
                    return;
                }
                attempts = attempts.saturating_add(1);
                metrics::WS_RECONNECTS.with_label_values(&["trading"]).inc();
                if attempts > self.cfg.max_reconnect_attempts {
                    error!(attempts, "trading reconnect attempts exhausted");
                    let _ = self.fatal.send(true);
                    return;
                }

                tokio::select! {
                    _ = sleep(self.cfg.reconnect_delay) => {}
                    _ = shutdown.changed() => return,
                }

                match ws::connect(&self.cfg.url).await {
                    Ok((new_reader, new_writer)) => {
                        *self.writer.lock().await = Some(new_writer);
                        self.correlator.reopen();
                        self.connected.store(true, Ordering::Release);
                        metrics::WS_CONNECTED.with_label_values(&["trading"]).set(1);
                        info!(attempts, "trading stream reconnected");
                        attempts = 0;
                        reader = new_reader;
                        break;
                    }
                    Err(e) => {
                        warn!(attempts, error = %e, "trading reconnect failed");
                    }
                }
            }
        }
    }

    fn handle_message(&self, text: &str) {
        let doc: Value = match serde_json::from_str(text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "unparseable trading message");
                return;
            }
        };
        let Some(id) = doc.get("id").and_then(|v| v.as_str()).map(str::to_string) else {
            // Unsolicited documents (events, pings) are not correlated.
            return;
        };

        let outcome = if let Some(err) = doc.get("error") {
            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let msg = err
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown venue error")
                .to_string();
            Err(crate::error::venue_error(code, msg))
        } else {
            Ok(doc.get("result").cloned().unwrap_or(Value::Null))
        };

        if self.correlator.complete(&id, outcome).is_none() {
            debug!(%id, "response without waiter (timed out or swept)");
        }
    }

    /// Builds the signed params object. The signature covers the
    /// alphabetically ordered `k=v` concatenation of every param except
    /// the signature itself, using the exact strings serialized on the
    /// wire.
    fn signed_params(&self, params: &[(&str, String)]) -> Map<String, Value> {
        let timestamp = auth::timestamp_ms();

        let mut for_signature: Vec<(&str, String)> = params.to_vec();
        for_signature.push(("apiKey", self.cfg.api_key.clone()));
        for_signature.push(("timestamp", timestamp.to_string()));
        for_signature.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let qs = auth::build_query_string(&for_signature);
        let signature = auth::sign_query(&self.cfg.api_secret, &qs);

        let mut map = Map::with_capacity(params.len() + 3);
        for (k, v) in params {
            map.insert((*k).to_string(), Value::String(v.clone()));
        }
        map.insert("apiKey".to_string(), Value::String(self.cfg.api_key.clone()));
        map.insert("timestamp".to_string(), Value::Number(timestamp.into()));
        map.insert("signature".to_string(), Value::String(signature));
        map
    }

    /// Sends one request and waits for the correlated response.
    pub async fn request(&self, method: &str, params: &[(&str, String)]) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::Transport("trading stream not connected".into()));
        }

        let id = Uuid::new_v4().to_string();
        let request = json!({
            "id": id,
            "method": method,
            "params": Value::Object(self.signed_params(params)),
        });
        let payload = serde_json::to_string(&request)?;

        // Insert happens-before send.
        let rx = self.correlator.register(&id, method)?;

        {
            let mut writer = self.writer.lock().await;
            let Some(w) = writer.as_mut() else {
                self.correlator.evict(&id);
                return Err(Error::Transport("trading stream not connected".into()));
            };
            if let Err(e) = w.send_text(&payload).await {
                self.correlator.evict(&id);
                return Err(e);
            }
        }

        match timeout(self.cfg.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Slot dropped: the close sweep consumed the entry.
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => {
                // Venue state unknown; the entry is evicted and the next
                // tick reconciles.
                self.correlator.evict(&id);
                metrics::REQUEST_TIMEOUTS.inc();
                warn!(method, "request timed out");
                Err(Error::RequestTimeout { method: method.to_string() })
            }
        }
    }

    // ---- operations -------------------------------------------------------

    pub async fn order_place(&self, params: &[(&str, String)]) -> Result<Value> {
        self.request("order.place", params).await
    }

    pub async fn order_cancel(&self, params: &[(&str, String)]) -> Result<Value> {
        self.request("order.cancel", params).await
    }

    pub async fn cancel_all(&self, params: &[(&str, String)]) -> Result<Value> {
        self.request("openOrders.cancelAll", params).await
    }

    pub async fn order_status(&self, params: &[(&str, String)]) -> Result<Value> {
        self.request("order.status", params).await
    }

    pub async fn open_orders(&self, params: &[(&str, String)]) -> Result<Value> {
        self.request("openOrders.status", params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_waiter_once() {
        let c = Correlator::new();
        let rx = c.register("r1", "order.place").unwrap();
        assert_eq!(c.outstanding(), 1);

        assert!(c.complete("r1", Ok(json!({"orderId": 1}))).is_some());
        assert_eq!(c.outstanding(), 0);
        // second completion finds nothing
        assert!(c.complete("r1", Ok(Value::Null)).is_none());

        let value = rx.await.unwrap().unwrap();
        assert_eq!(value["orderId"], 1);
    }

    #[tokio::test]
    async fn close_session_fails_all_waiters_and_rejects_new() {
        let c = Correlator::new();
        let rx1 = c.register("a", "order.place").unwrap();
        let rx2 = c.register("b", "order.cancel").unwrap();

        c.close_session();
        assert!(matches!(rx1.await.unwrap(), Err(Error::SessionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(Error::SessionClosed)));
        assert_eq!(c.outstanding(), 0);

        // new inserts after close are rejected
        assert!(matches!(c.register("c", "order.place"), Err(Error::SessionClosed)));

        // reopen admits registrations again
        c.reopen();
        assert!(c.register("d", "order.place").is_ok());
    }

    #[tokio::test]
    async fn evicted_waiter_never_completes() {
        let c = Correlator::new();
        let rx = c.register("gone", "order.place").unwrap();
        c.evict("gone");
        assert!(c.complete("gone", Ok(Value::Null)).is_none());
        assert!(rx.await.is_err());
    }

    #[test]
    fn signed_params_cover_everything_but_signature() {
        let cfg = WsTradingConfig::new(
            Url::parse("wss://ws-api.example.com/ws-api/v3").unwrap(),
            "k".into(),
            "s".into(),
        );
        let client = WsTradingClient::new(cfg);
        let params = vec![
            ("symbol", "BTCUSDT".to_string()),
            ("side", "BUY".to_string()),
            ("price", "12.34".to_string()),
        ];
        let map = client.signed_params(&params);

        assert_eq!(map["apiKey"], "k");
        assert!(map["timestamp"].is_number());
        let sig = map["signature"].as_str().unwrap().to_string();
        assert_eq!(sig.len(), 64);

        // Recompute over the sorted qs excluding the signature field.
        let ts = map["timestamp"].to_string();
        let mut pairs = vec![
            ("apiKey", "k".to_string()),
            ("price", "12.34".to_string()),
            ("side", "BUY".to_string()),
            ("symbol", "BTCUSDT".to_string()),
            ("timestamp", ts),
        ];
        pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
        let expected = auth::sign_query("s", &auth::build_query_string(&pairs));
        assert_eq!(sig, expected);
    }

    #[test]
    fn venue_error_extraction() {
        let cfg = WsTradingConfig::new(
            Url::parse("wss://ws-api.example.com/ws-api/v3").unwrap(),
            "k".into(),
            "s".into(),
        );
        let client = WsTradingClient::new(cfg);
        let rx = client.correlator.register("x", "order.place").unwrap();
        client.handle_message(r#"{"id":"x","error":{"code":-2010,"msg":"insufficient balance"}}"#);

        let outcome = rx.blocking_recv().unwrap();
        match outcome {
            Err(Error::Venue { code, msg }) => {
                assert_eq!(code, -2010);
                assert_eq!(msg, "insufficient balance");
            }
            other => panic!("expected venue error, got {other:?}"),
        }
    }
}
