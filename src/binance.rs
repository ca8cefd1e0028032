// ===============================
// src/binance.rs
// ===============================
//
// Binance Spot adapter: symbol mapping, exchange-info rules cache,
// price/quantity formatting, and the two trading backends behind one
// surface. Every signed call goes through the placement/cancellation
// buckets and the inter-request pacer before it touches the wire.

use crate::domain::{Order, OrderStatus, Side};
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangeConfig, SymbolRules};
use crate::ratelimit::{OrderRateLimiters, RequestPacer};
use crate::rest::RestClient;
use crate::trading_ws::{WsTradingClient, WsTradingConfig};
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Both trading variants expose the same operation set; the adapter is
/// indifferent to which one is wired in.
enum TradingBackend {
    Stream(Arc<WsTradingClient>),
    Http(RestClient),
}

impl TradingBackend {
    async fn order_place(&self, params: &[(&str, String)]) -> Result<Value> {
        match self {
            TradingBackend::Stream(c) => c.order_place(params).await,
            TradingBackend::Http(c) => c.order_place(params).await,
        }
    }

    async fn order_cancel(&self, params: &[(&str, String)]) -> Result<Value> {
        match self {
            TradingBackend::Stream(c) => c.order_cancel(params).await,
            TradingBackend::Http(c) => c.order_cancel(params).await,
        }
    }

    async fn cancel_all(&self, params: &[(&str, String)]) -> Result<Value> {
        match self {
            TradingBackend::Stream(c) => c.cancel_all(params).await,
            TradingBackend::Http(c) => c.cancel_all(params).await,
        }
    }

    async fn order_status(&self, params: &[(&str, String)]) -> Result<Value> {
        match self {
            TradingBackend::Stream(c) => c.order_status(params).await,
            TradingBackend::Http(c) => c.order_status(params).await,
        }
    }

    async fn open_orders(&self, params: &[(&str, String)]) -> Result<Value> {
        match self {
            TradingBackend::Stream(c) => c.open_orders(params).await,
            TradingBackend::Http(c) => c.open_orders(params).await,
        }
    }
}

pub struct BinanceExchange {
    cfg: ExchangeConfig,
    rest: RestClient,
    trading: TradingBackend,
    pacer: RequestPacer,
    limiters: Arc<OrderRateLimiters>,
    rules: RwLock<HashMap<String, SymbolRules>>,
}

impl BinanceExchange {
    pub fn create(
        cfg: ExchangeConfig,
        limiters: Arc<OrderRateLimiters>,
    ) -> Result<Arc<dyn Exchange>> {
        let rest = RestClient::new(&cfg.rest_url, &cfg.api_key, &cfg.api_secret)?;

        let trading = if cfg.use_websocket_trading {
            let url = Url::parse(&cfg.ws_trading_url)?;
            let mut ws_cfg = WsTradingConfig::new(url, cfg.api_key.clone(), cfg.api_secret.clone());
            ws_cfg.request_timeout = cfg.request_timeout;
            ws_cfg.reconnect_delay = cfg.reconnect_delay;
            ws_cfg.max_reconnect_attempts = cfg.max_reconnect_attempts;
            TradingBackend::Stream(WsTradingClient::new(ws_cfg))
        } else {
            TradingBackend::Http(rest.clone())
        };

        let pacer = RequestPacer::new(cfg.max_requests_per_second);
        Ok(Arc::new(Self {
            cfg,
            rest,
            trading,
            pacer,
            limiters,
            rules: RwLock::new(HashMap::new()),
        }))
    }

    /// `BTC/USDT` -> `BTCUSDT`
    pub fn to_venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_ascii_uppercase()
    }

    /// Stream topics are lower-case: `btcusdt@depth20@100ms`.
    fn stream_topic(symbol: &str, depth: u32) -> String {
        format!("{}@depth{}@100ms", Self::to_venue_symbol(symbol).to_ascii_lowercase(), depth)
    }

    /// Spacing plus the right bucket, applied before every signed call.
    async fn admit(&self, cancel: bool) {
        let bucket = if cancel { &self.limiters.cancel } else { &self.limiters.place };
        bucket.wait_if_needed().await;
        bucket.record_request();
        self.pacer.pace().await;
    }

    fn rules_for(&self, symbol: &str) -> Option<SymbolRules> {
        self.rules.read().get(&Self::to_venue_symbol(symbol)).cloned()
    }
}

#[async_trait]
impl Exchange for BinanceExchange {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn initialize(&self) -> Result<()> {
        let info = self.rest.exchange_info().await?;
        let parsed = parse_exchange_info(&info, self.cfg.price_precision, self.cfg.quantity_precision);
        let count = parsed.len();
        *self.rules.write() = parsed;
        info!(symbols = count, testnet = self.cfg.use_testnet, "exchange info cached");

        if let TradingBackend::Stream(client) = &self.trading {
            client.connect().await?;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if let TradingBackend::Stream(client) = &self.trading {
            client.disconnect().await;
        }
    }

    fn is_trading_connected(&self) -> bool {
        match &self.trading {
            TradingBackend::Stream(client) => client.is_connected(),
            TradingBackend::Http(_) => true,
        }
    }

    fn trading_fatal(&self) -> Option<tokio::sync::watch::Receiver<bool>> {
        match &self.trading {
            TradingBackend::Stream(client) => Some(client.fatal_signal()),
            TradingBackend::Http(_) => None,
        }
    }

    fn stream_url(&self, symbol: &str, depth: u32) -> Result<Url> {
        let base = self.cfg.ws_url.trim_end_matches('/');
        let base = base.strip_suffix("/ws").unwrap_or(base);
        let url = format!("{}/ws/{}", base, Self::stream_topic(symbol, depth));
        Ok(Url::parse(&url)?)
    }

    fn symbol_rules(&self, symbol: &str) -> Option<SymbolRules> {
        self.rules_for(symbol)
    }

    fn tick_size(&self, symbol: &str) -> Decimal {
        self.rules_for(symbol).map(|r| r.tick_size).unwrap_or_else(|| {
            pow10_neg(self.cfg.price_precision)
        })
    }

    fn format_price(&self, symbol: &str, price: Decimal) -> String {
        let precision = self
            .rules_for(symbol)
            .map(|r| r.price_precision)
            .unwrap_or(self.cfg.price_precision);
        format_decimal(price, precision)
    }

    fn format_quantity(&self, symbol: &str, quantity: Decimal) -> String {
        let precision = self
            .rules_for(symbol)
            .map(|r| r.quantity_precision)
            .unwrap_or(self.cfg.quantity_precision);
        format_decimal(quantity, precision)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<Order> {
        let venue_symbol = Self::to_venue_symbol(symbol);
        let params = vec![
            ("symbol", venue_symbol),
            ("side", side.as_venue().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", self.format_quantity(symbol, quantity)),
            ("price", self.format_price(symbol, price)),
            ("newClientOrderId", client_order_id.to_string()),
        ];

        self.admit(false).await;
        let response = self.trading.order_place(&params).await?;
        parse_order_response(&response)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<bool> {
        let params = vec![
            ("symbol", Self::to_venue_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];

        self.admit(true).await;
        let response = self.trading.order_cancel(&params).await?;
        let status = response.get("status").and_then(|s| s.as_str()).unwrap_or_default();
        Ok(status == "CANCELED")
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let params = vec![("symbol", Self::to_venue_symbol(symbol))];
        self.admit(true).await;
        self.trading.cancel_all(&params).await?;
        Ok(())
    }

    /// Cancel-then-place issued concurrently. Not atomic: a place success
    /// with a cancel failure is reported as success with a warning, and
    /// the side must be given explicitly by the caller.
    async fn modify_order(
        &self,
        symbol: &str,
        order_id: &str,
        side: Side,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order> {
        let client_order_id = crate::manager::generate_client_order_id(side);
        let (cancel_result, place_result) = tokio::join!(
            self.cancel_order(symbol, order_id),
            self.place_limit_order(symbol, side, price, quantity, &client_order_id),
        );

        if let Err(e) = &cancel_result {
            warn!(order_id, error = %e, "modify: cancel leg failed; replacement may rest alongside the old order");
        }
        place_result
    }

    async fn query_order(&self, symbol: &str, order_id: &str) -> Result<Order> {
        let params = vec![
            ("symbol", Self::to_venue_symbol(symbol)),
            ("orderId", order_id.to_string()),
        ];
        self.pacer.pace().await;
        let response = self.trading.order_status(&params).await?;
        parse_order_response(&response)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let params = vec![("symbol", Self::to_venue_symbol(symbol))];
        self.pacer.pace().await;
        let response = self.trading.open_orders(&params).await?;
        let Some(entries) = response.as_array() else {
            return Err(Error::Protocol("open orders response is not an array".into()));
        };
        entries.iter().map(parse_order_response).collect()
    }
}

/// Rounds half-to-even at the venue precision and renders with the full
/// declared scale (`0.001` at precision 5 -> `"0.00100"`).
fn format_decimal(value: Decimal, precision: u32) -> String {
    let mut rounded = value.round_dp_with_strategy(precision, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(precision);
    rounded.to_string()
}

fn pow10_neg(precision: u32) -> Decimal {
    Decimal::new(1, precision)
}

/// Decimal places carried by a filter value, e.g. `0.01000000` -> 2.
fn filter_precision(value: Decimal) -> u32 {
    value.normalize().scale()
}

fn filter_decimal(filter: &Value, key: &str) -> Option<Decimal> {
    filter.get(key)?.as_str()?.parse().ok()
}

/// Extracts per-symbol trading rules from the exchange-info document.
pub fn parse_exchange_info(
    info: &Value,
    default_price_precision: u32,
    default_quantity_precision: u32,
) -> HashMap<String, SymbolRules> {
    let mut out = HashMap::new();
    let Some(symbols) = info.get("symbols").and_then(|s| s.as_array()) else {
        return out;
    };

    for symbol in symbols {
        let Some(name) = symbol.get("symbol").and_then(|s| s.as_str()) else {
            continue;
        };
        let mut rules = SymbolRules {
            tick_size: pow10_neg(default_price_precision),
            step_size: pow10_neg(default_quantity_precision),
            min_quantity: dec!(0.00001),
            max_quantity: dec!(10000),
            min_notional: dec!(10),
            max_notional: dec!(100000),
            price_precision: default_price_precision,
            quantity_precision: default_quantity_precision,
        };

        let Some(filters) = symbol.get("filters").and_then(|f| f.as_array()) else {
            out.insert(name.to_string(), rules);
            continue;
        };
        for filter in filters {
            match filter.get("filterType").and_then(|t| t.as_str()) {
                Some("PRICE_FILTER") => {
                    if let Some(tick) = filter_decimal(filter, "tickSize") {
                        rules.tick_size = tick;
                        rules.price_precision = filter_precision(tick);
                    }
                }
                Some("LOT_SIZE") => {
                    if let Some(step) = filter_decimal(filter, "stepSize") {
                        rules.step_size = step;
                        rules.quantity_precision = filter_precision(step);
                    }
                    if let Some(min) = filter_decimal(filter, "minQty") {
                        rules.min_quantity = min;
                    }
                    if let Some(max) = filter_decimal(filter, "maxQty") {
                        rules.max_quantity = max;
                    }
                }
                Some("NOTIONAL") | Some("MIN_NOTIONAL") => {
                    if let Some(min) = filter_decimal(filter, "minNotional") {
                        rules.min_notional = min;
                    }
                    if let Some(max) = filter_decimal(filter, "maxNotional") {
                        rules.max_notional = max;
                    }
                }
                _ => {}
            }
        }
        out.insert(name.to_string(), rules);
    }
    out
}

/// Maps a venue order document into the domain type.
pub fn parse_order_response(response: &Value) -> Result<Order> {
    if let (Some(code), Some(msg)) =
        (response.get("code").and_then(|c| c.as_i64()), response.get("msg").and_then(|m| m.as_str()))
    {
        return Err(crate::error::venue_error(code, msg.to_string()));
    }

    let order_id = match response.get("orderId") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => return Err(Error::Protocol("order response without orderId".into())),
    };

    let decimal_field = |key: &str| -> Decimal {
        response
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(Decimal::ZERO)
    };

    let now = Utc::now();
    Ok(Order {
        order_id,
        client_order_id: response
            .get("clientOrderId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        symbol: response.get("symbol").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        side: response
            .get("side")
            .and_then(|v| v.as_str())
            .and_then(Side::from_venue)
            .unwrap_or(Side::Bid),
        price: decimal_field("price"),
        quantity: decimal_field("origQty"),
        executed_quantity: decimal_field("executedQty"),
        status: response
            .get("status")
            .and_then(|v| v.as_str())
            .map(OrderStatus::from_venue)
            .unwrap_or(OrderStatus::New),
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn symbol_conversion() {
        assert_eq!(BinanceExchange::to_venue_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(BinanceExchange::to_venue_symbol("btcusdt"), "BTCUSDT");
        assert_eq!(BinanceExchange::stream_topic("BTC/USDT", 20), "btcusdt@depth20@100ms");
    }

    #[test]
    fn decimal_formatting_rounds_half_to_even() {
        assert_eq!(format_decimal(dec!(0.125), 2), "0.12");
        assert_eq!(format_decimal(dec!(0.135), 2), "0.14");
        assert_eq!(format_decimal(dec!(0.001), 5), "0.00100");
        assert_eq!(format_decimal(dec!(49049), 2), "49049.00");
    }

    #[test]
    fn filter_precision_from_trailing_zeros() {
        assert_eq!(filter_precision(dec!(0.01000000)), 2);
        assert_eq!(filter_precision(dec!(0.00001000)), 5);
        assert_eq!(filter_precision(dec!(1.00000000)), 0);
    }

    #[test]
    fn exchange_info_rules_parsed() {
        let info = json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01000000",
                     "maxPrice": "1000000.00000000", "tickSize": "0.01000000"},
                    {"filterType": "LOT_SIZE", "minQty": "0.00001000",
                     "maxQty": "9000.00000000", "stepSize": "0.00001000"},
                    {"filterType": "NOTIONAL", "minNotional": "5.00000000",
                     "maxNotional": "9000000.00000000"}
                ]
            }]
        });
        let rules = parse_exchange_info(&info, 2, 5);
        let btc = rules.get("BTCUSDT").unwrap();
        assert_eq!(btc.tick_size, dec!(0.01));
        assert_eq!(btc.price_precision, 2);
        assert_eq!(btc.step_size, dec!(0.00001));
        assert_eq!(btc.quantity_precision, 5);
        assert_eq!(btc.min_quantity, dec!(0.00001));
        assert_eq!(btc.max_quantity, dec!(9000));
        assert_eq!(btc.min_notional, dec!(5));
        assert_eq!(btc.max_notional, dec!(9000000));
    }

    #[test]
    fn order_response_parsed() {
        let response = json!({
            "orderId": 28,
            "clientOrderId": "MM_BID_1700000000000000000_123456",
            "symbol": "BTCUSDT",
            "side": "BUY",
            "price": "49049.00",
            "origQty": "0.00100",
            "executedQty": "0.00000",
            "status": "NEW"
        });
        let order = parse_order_response(&response).unwrap();
        assert_eq!(order.order_id, "28");
        assert_eq!(order.side, Side::Bid);
        assert_eq!(order.price, dec!(49049.00));
        assert_eq!(order.quantity, dec!(0.001));
        assert_eq!(order.status, OrderStatus::New);
    }

    #[test]
    fn venue_error_response_surfaces() {
        let response = json!({"code": -2010, "msg": "Account has insufficient balance"});
        assert!(matches!(
            parse_order_response(&response),
            Err(Error::Venue { code: -2010, .. })
        ));
    }

    #[test]
    fn stream_url_built_from_base() {
        let cfg = ExchangeConfig {
            venue: "binance".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
            rest_url: "https://testnet.binance.vision".into(),
            ws_url: "wss://stream.testnet.binance.vision/ws".into(),
            ws_trading_url: String::new(),
            use_websocket_trading: false,
            use_testnet: true,
            price_precision: 2,
            quantity_precision: 5,
            max_requests_per_second: 10,
            request_timeout: std::time::Duration::from_secs(5),
            reconnect_delay: std::time::Duration::from_millis(100),
            max_reconnect_attempts: 3,
        };
        let limiters = Arc::new(OrderRateLimiters::new(10));
        let exchange = BinanceExchange::create(cfg, limiters).unwrap();
        let url = exchange.stream_url("BTCUSDT", 20).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://stream.testnet.binance.vision/ws/btcusdt@depth20@100ms"
        );
    }
}
