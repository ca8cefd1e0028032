// ===============================
// src/exchange.rs
// ===============================
//
// Venue-neutral adapter surface and the factory that maps configured
// venue names onto concrete adapters. The factory folds known aliases to
// canonical names; asking for anything unregistered is a fatal
// initialization error.

use crate::config::Config;
use crate::domain::{Order, Side};
use crate::error::{Error, Result};
use crate::ratelimit::OrderRateLimiters;
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

/// Venue-scoped connection/credential configuration handed to adapters.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub venue: String,
    pub api_key: String,
    pub api_secret: String,
    pub rest_url: String,
    pub ws_url: String,
    pub ws_trading_url: String,
    pub use_websocket_trading: bool,
    pub use_testnet: bool,
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub max_requests_per_second: u32,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ExchangeConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            venue: cfg.exchange.clone(),
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            rest_url: cfg.rest_url.clone(),
            ws_url: cfg.ws_url.clone(),
            ws_trading_url: cfg.ws_trading_url.clone(),
            use_websocket_trading: cfg.use_websocket_trading,
            use_testnet: cfg.use_testnet,
            price_precision: cfg.price_precision,
            quantity_precision: cfg.quantity_precision,
            max_requests_per_second: cfg.max_requests_per_second,
            request_timeout: Duration::from_secs(5),
            reconnect_delay: cfg.reconnect_delay,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
        }
    }
}

/// Per-symbol trading rules from the venue's exchange-info document.
#[derive(Debug, Clone)]
pub struct SymbolRules {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_quantity: Decimal,
    pub max_quantity: Decimal,
    pub min_notional: Decimal,
    pub max_notional: Decimal,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

/// Uniform operation surface over one venue.
///
/// `modify_order` is NOT atomic: it is a cancel followed by a place, the
/// two may be issued concurrently, and a cancel failure with a place
/// success still counts as a successful modify (logged as a warning).
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetches venue metadata and brings the trading session up.
    async fn initialize(&self) -> Result<()>;
    async fn disconnect(&self);
    fn is_trading_connected(&self) -> bool;

    /// Flips to true when the trading transport has given up
    /// reconnecting; `None` for transports that cannot die this way.
    fn trading_fatal(&self) -> Option<watch::Receiver<bool>> {
        None
    }

    /// Venue-specific market-data stream URL for one symbol.
    fn stream_url(&self, symbol: &str, depth: u32) -> Result<Url>;

    fn symbol_rules(&self, symbol: &str) -> Option<SymbolRules>;
    fn tick_size(&self, symbol: &str) -> Decimal;
    fn format_price(&self, symbol: &str, price: Decimal) -> String;
    fn format_quantity(&self, symbol: &str, quantity: Decimal) -> String;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<Order>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    async fn modify_order(
        &self,
        symbol: &str,
        order_id: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order>;

    async fn query_order(&self, symbol: &str, order_id: &str) -> Result<Order>;
    async fn open_orders(&self, symbol: &str) -> Result<Vec<Order>>;
}

type ExchangeCtor = fn(ExchangeConfig, Arc<OrderRateLimiters>) -> Result<Arc<dyn Exchange>>;

pub struct ExchangeFactory {
    registry: HashMap<&'static str, ExchangeCtor>,
}

impl ExchangeFactory {
    pub fn with_builtin() -> Self {
        let mut registry: HashMap<&'static str, ExchangeCtor> = HashMap::new();
        registry.insert("binance", |cfg, limiters| {
            Ok(crate::binance::BinanceExchange::create(cfg, limiters)?)
        });
        Self { registry }
    }

    pub fn create(
        &self,
        cfg: ExchangeConfig,
        limiters: Arc<OrderRateLimiters>,
    ) -> Result<Arc<dyn Exchange>> {
        let name = normalize_venue_name(&cfg.venue);
        let ctor = self.registry.get(name.as_str()).ok_or_else(|| {
            Error::Config(format!(
                "exchange '{}' not supported (supported: {})",
                cfg.venue,
                self.supported().join(", ")
            ))
        })?;
        ctor(cfg, limiters)
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.registry.contains_key(normalize_venue_name(name).as_str())
    }

    pub fn supported(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.registry.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Folds venue-name variants onto canonical registry keys.
pub fn normalize_venue_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "binance.com" | "binance.us" | "binance-spot" => "binance".to_string(),
        "okex" => "okx".to_string(),
        "coinbasepro" | "coinbase pro" => "coinbase".to_string(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_fold_to_canonical_names() {
        assert_eq!(normalize_venue_name("Binance.COM"), "binance");
        assert_eq!(normalize_venue_name("binance.us"), "binance");
        assert_eq!(normalize_venue_name("OKEx"), "okx");
        assert_eq!(normalize_venue_name("  kraken "), "kraken");
    }

    #[test]
    fn factory_knows_binance() {
        let f = ExchangeFactory::with_builtin();
        assert!(f.is_supported("binance"));
        assert!(f.is_supported("BINANCE.com"));
        assert!(!f.is_supported("krakenx"));
        assert_eq!(f.supported(), vec!["binance"]);
    }

    #[test]
    fn unknown_venue_is_fatal() {
        let f = ExchangeFactory::with_builtin();
        let cfg = ExchangeConfig {
            venue: "krakenx".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
            rest_url: "https://example.com".into(),
            ws_url: "wss://example.com/ws".into(),
            ws_trading_url: String::new(),
            use_websocket_trading: false,
            use_testnet: true,
            price_precision: 2,
            quantity_precision: 5,
            max_requests_per_second: 10,
            request_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_attempts: 3,
        };
        let limiters = Arc::new(OrderRateLimiters::new(10));
        assert!(matches!(f.create(cfg, limiters), Err(Error::Config(_))));
    }
}
