// ===============================
// src/rest.rs
// ===============================
//
// Signed HTTP trading transport. One pooled client with persistent
// connections (HTTP/2 via ALPN where the venue offers it), TCP nodelay,
// and short connect/total timeouts; parallelism across operations comes
// from issuing requests on cloned handles in parallel tasks. Signed
// parameters travel in the query string with an empty body on POST.

use crate::auth;
use crate::error::{Error, Result};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl RestClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self> {
        let http = Client::builder()
            .tcp_nodelay(true)
            .tcp_keepalive(TCP_KEEPALIVE)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    /// Unsigned market-data endpoint.
    pub async fn public(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value> {
        let mut url = format!("{}{}", self.base_url, endpoint);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&auth::build_query_string(params));
        }
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;
        check_venue_error(status, &body)?;
        Ok(body)
    }

    /// Signed endpoint. A millisecond timestamp is appended, the query
    /// string is signed, and the parameters ride in the URL (empty body
    /// for POST).
    pub async fn signed(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Value> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("timestamp", auth::timestamp_ms().to_string()));
        let query = auth::signed_query(&self.api_secret, &all);
        let url = format!("{}{}?{}", self.base_url, endpoint, query);

        debug!(%endpoint, "signed request");
        let request = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/json");

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body: Value =
            serde_json::from_str(&text).unwrap_or(Value::String(text));
        check_venue_error(status, &body)?;
        Ok(body)
    }

    // ---- operations (same contract as the trading stream) -----------------

    pub async fn order_place(&self, params: &[(&str, String)]) -> Result<Value> {
        self.signed(Method::POST, "/api/v3/order", params).await
    }

    pub async fn order_cancel(&self, params: &[(&str, String)]) -> Result<Value> {
        self.signed(Method::DELETE, "/api/v3/order", params).await
    }

    pub async fn cancel_all(&self, params: &[(&str, String)]) -> Result<Value> {
        self.signed(Method::DELETE, "/api/v3/openOrders", params).await
    }

    pub async fn order_status(&self, params: &[(&str, String)]) -> Result<Value> {
        self.signed(Method::GET, "/api/v3/order", params).await
    }

    pub async fn open_orders(&self, params: &[(&str, String)]) -> Result<Value> {
        self.signed(Method::GET, "/api/v3/openOrders", params).await
    }

    pub async fn exchange_info(&self) -> Result<Value> {
        self.public("/api/v3/exchangeInfo", &[]).await
    }

    pub async fn depth(&self, symbol: &str, limit: u32) -> Result<Value> {
        self.public(
            "/api/v3/depth",
            &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<Value> {
        self.public("/api/v3/ticker/price", &[("symbol", symbol.to_string())]).await
    }
}

/// A venue error is either an HTTP failure status or a `{code, msg}`
/// document (the venue reports both ways).
fn check_venue_error(status: StatusCode, body: &Value) -> Result<()> {
    let code = body.get("code").and_then(|c| c.as_i64());
    let msg = body.get("msg").and_then(|m| m.as_str());

    if let (Some(code), Some(msg)) = (code, msg) {
        warn!(code, msg, "venue rejected request");
        return Err(crate::error::venue_error(code, msg.to_string()));
    }
    if !status.is_success() {
        return Err(Error::Venue {
            code: status.as_u16() as i64,
            msg: format!("http status {status}"),
        });
    }
    Ok(())
}
