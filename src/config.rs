// ===============================
// src/config.rs
// ===============================
//
// Configuration is a KEY=value document loaded via dotenvy plus
// environment overrides. Variables already present in the environment
// win over the file, so credentials can always be injected from the
// shell. `validate()` is the startup gate: anything it rejects exits
// with code 1 before a socket is opened.

use crate::error::{Error, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub ws_url: String,
    pub rest_url: String,
    pub ws_trading_url: String,
}

/// Endpoint sets per venue; `testnet` flips to the sandbox variant.
fn endpoints_for(exchange: &str, testnet: bool) -> Endpoints {
    match (exchange, testnet) {
        ("binance", false) => Endpoints {
            ws_url: "wss://stream.binance.com:9443/ws".into(),
            rest_url: "https://api.binance.com".into(),
            ws_trading_url: "wss://ws-api.binance.com:443/ws-api/v3".into(),
        },
        ("binance", true) => Endpoints {
            ws_url: "wss://stream.testnet.binance.vision/ws".into(),
            rest_url: "https://testnet.binance.vision".into(),
            ws_trading_url: "wss://ws-api.testnet.binance.vision/ws-api/v3".into(),
        },
        // Unknown venues fail later in the factory; endpoints stay empty.
        _ => Endpoints {
            ws_url: String::new(),
            rest_url: String::new(),
            ws_trading_url: String::new(),
        },
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Venue selection
    pub exchange: String,
    pub use_testnet: bool,

    // Symbol
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub book_depth: u32,

    // Strategy parameters
    pub spread: f64,
    pub order_size: Decimal,
    pub price_precision: u32,
    pub quantity_precision: u32,

    // Timing
    pub order_update_cooldown: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,

    // Rate limiting
    pub max_orders_per_second: u32,
    pub max_requests_per_second: u32,

    // Trading transport selection
    pub use_websocket_trading: bool,

    // Credentials
    pub api_key: String,
    pub api_secret: String,

    // Endpoints (derived from exchange/testnet unless overridden)
    pub ws_url: String,
    pub rest_url: String,
    pub ws_trading_url: String,

    // Observability
    pub metrics_port: u16,
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn var_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn var_bool(key: &str, default: bool) -> bool {
    match var(key).as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

impl Config {
    /// Loads the config document (if any), overlays the process
    /// environment, resolves endpoints, and validates.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        if let Some(path) = path {
            // Existing env vars take precedence over file entries.
            dotenvy::from_path(path)
                .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        } else {
            let _ = dotenvy::dotenv();
        }

        let exchange = var("EXCHANGE").unwrap_or_else(|| "binance".to_string());
        let use_testnet = var_bool("TESTNET", false);
        let endpoints = endpoints_for(&exchange.to_ascii_lowercase(), use_testnet);

        let cfg = Config {
            exchange,
            use_testnet,
            symbol: var("SYMBOL").unwrap_or_else(|| "BTCUSDT".to_string()),
            base_asset: var("BASE_ASSET").unwrap_or_else(|| "BTC".to_string()),
            quote_asset: var("QUOTE_ASSET").unwrap_or_else(|| "USDT".to_string()),
            book_depth: var_parsed("BOOK_DEPTH", 20),
            spread: var_parsed("SPREAD", 0.02),
            order_size: var("ORDER_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(dec!(0.001)),
            price_precision: var_parsed("PRICE_PRECISION", 2),
            quantity_precision: var_parsed("QUANTITY_PRECISION", 5),
            order_update_cooldown: Duration::from_millis(var_parsed(
                "ORDER_UPDATE_COOLDOWN_MS",
                100,
            )),
            reconnect_delay: Duration::from_millis(var_parsed("RECONNECT_DELAY_MS", 5000)),
            max_reconnect_attempts: var_parsed("MAX_RECONNECT_ATTEMPTS", 10),
            max_orders_per_second: var_parsed("MAX_ORDERS_PER_SECOND", 10),
            max_requests_per_second: var_parsed("MAX_REQUESTS_PER_SECOND", 10),
            use_websocket_trading: var_bool("USE_WEBSOCKET_TRADING", false),
            api_key: var("BINANCE_API_KEY").or_else(|| var("API_KEY")).unwrap_or_default(),
            api_secret: var("BINANCE_API_SECRET")
                .or_else(|| var("API_SECRET"))
                .unwrap_or_default(),
            ws_url: var("WS_URL").unwrap_or(endpoints.ws_url),
            rest_url: var("REST_URL").unwrap_or(endpoints.rest_url),
            ws_trading_url: var("WS_TRADING_URL").unwrap_or(endpoints.ws_trading_url),
            metrics_port: var_parsed("METRICS_PORT", 9898),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(Error::Config("API credentials are not configured".into()));
        }
        if self.symbol.is_empty() {
            return Err(Error::Config("trading symbol is not configured".into()));
        }
        if self.order_size <= Decimal::ZERO {
            return Err(Error::Config(format!("invalid order size: {}", self.order_size)));
        }
        if !self.spread.is_finite() || self.spread <= 0.0 || self.spread > 0.1 {
            return Err(Error::Config(format!(
                "invalid spread {} (must be within (0, 0.1])",
                self.spread
            )));
        }
        if self.ws_url.is_empty() || self.rest_url.is_empty() {
            return Err(Error::Config(format!(
                "no endpoints known for exchange '{}'",
                self.exchange
            )));
        }
        if self.use_websocket_trading && self.ws_trading_url.is_empty() {
            return Err(Error::Config("websocket trading enabled but no trading url".into()));
        }
        Ok(())
    }

    pub fn masked_key(&self) -> String {
        mask_secret(&self.api_key)
    }
}

/// Shows the first and last four characters only, for startup logs.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 8 {
        return "*".repeat(secret.len());
    }
    format!("{}{}{}", &secret[..4], "*".repeat(secret.len() - 8), &secret[secret.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            exchange: "binance".into(),
            use_testnet: true,
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            book_depth: 20,
            spread: 0.02,
            order_size: dec!(0.001),
            price_precision: 2,
            quantity_precision: 5,
            order_update_cooldown: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(5000),
            max_reconnect_attempts: 10,
            max_orders_per_second: 10,
            max_requests_per_second: 10,
            use_websocket_trading: false,
            api_key: "key".into(),
            api_secret: "secret".into(),
            ws_url: "wss://stream.testnet.binance.vision/ws".into(),
            rest_url: "https://testnet.binance.vision".into(),
            ws_trading_url: "wss://ws-api.testnet.binance.vision/ws-api/v3".into(),
            metrics_port: 9898,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn missing_credentials_rejected() {
        let mut cfg = valid_config();
        cfg.api_secret.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn spread_bounds_enforced() {
        let mut cfg = valid_config();
        cfg.spread = 0.0;
        assert!(cfg.validate().is_err());
        cfg.spread = 0.11;
        assert!(cfg.validate().is_err());
        cfg.spread = f64::NAN;
        assert!(cfg.validate().is_err());
        cfg.spread = 0.1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn non_positive_order_size_rejected() {
        let mut cfg = valid_config();
        cfg.order_size = Decimal::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn testnet_endpoints_selected() {
        let e = endpoints_for("binance", true);
        assert!(e.rest_url.contains("testnet"));
        let e = endpoints_for("binance", false);
        assert_eq!(e.rest_url, "https://api.binance.com");
    }

    #[test]
    fn unknown_exchange_has_no_endpoints() {
        let e = endpoints_for("krakenx", false);
        assert!(e.ws_url.is_empty());
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret("abcd1234efgh"), "abcd****efgh");
        assert_eq!(mask_secret("short"), "*****");
    }
}
