// =============================================================================
// Exchange REST API Client - HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the engine and the exchange.
//
// In Demo mode `place_order` never reaches the network: a synthetic fill is
// returned. Market data (price, klines, server time) is always live.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::gateway::{OrderAck, OrderRequest, PriceGateway};
use crate::types::{AccountMode, OrderType};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// One OHLCV candle from the klines endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Spot REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct ExchangeClient {
    secret: String,
    base_url: String,
    account_mode: AccountMode,
    client: reqwest::Client,
}

impl ExchangeClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key`  - sent as a header, never in query params.
    /// * `secret`   - used exclusively for HMAC signing.
    /// * `base_url` - e.g. `https://api.mexc.com`.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        account_mode: AccountMode,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, %account_mode, "ExchangeClient initialised");

        Ok(Self {
            secret: secret.into(),
            base_url,
            account_mode,
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Append timestamp, recvWindow and signature to `params`.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Send a request and decode the JSON body, turning non-2xx into errors.
    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<serde_json::Value> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("{what} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/price (public).
    #[instrument(skip(self), name = "exchange::ticker_price")]
    pub async fn ticker_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let body = self
            .send_json(self.client.get(&url), "GET /api/v3/ticker/price")
            .await?;

        let price = parse_str_f64(&body["price"]).context("ticker response missing 'price'")?;
        if !(price > 0.0) {
            anyhow::bail!("exchange returned non-positive price {price} for {symbol}");
        }
        Ok(price)
    }

    /// GET /api/v3/time (public).
    #[instrument(skip(self), name = "exchange::get_server_time")]
    pub async fn get_server_time(&self) -> Result<i64> {
        let url = format!("{}/api/v3/time", self.base_url);
        let body = self.send_json(self.client.get(&url), "GET /api/v3/time").await?;
        body["serverTime"]
            .as_i64()
            .context("time response missing 'serverTime'")
    }

    /// GET /api/v3/klines (public).
    #[instrument(skip(self), name = "exchange::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let body = self
            .send_json(self.client.get(&url), "GET /api/v3/klines")
            .await?;

        let klines = parse_klines(&body)?;
        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order (signed) - submit a new order.
    #[instrument(skip(self, order), name = "exchange::submit_order", fields(symbol = %order.symbol, side = %order.side))]
    pub async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        if self.account_mode == AccountMode::Demo {
            let order_id = format!("sim-{}", Uuid::new_v4());
            info!(
                symbol = %order.symbol,
                side = %order.side,
                order_type = %order.order_type,
                quantity = order.quantity,
                price = ?order.price,
                order_id = %order_id,
                "demo fill (order not sent)"
            );
            return Ok(OrderAck {
                order_id,
                simulated: true,
            });
        }

        let params = order_params(order)?;
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            quantity = order.quantity,
            "placing order"
        );

        let body = self
            .send_json(self.client.post(&url), "POST /api/v3/order")
            .await?;

        let order_id = parse_order_id(&body).context("order response missing 'orderId'")?;
        debug!(symbol = %order.symbol, order_id = %order_id, "order placed successfully");
        Ok(OrderAck {
            order_id,
            simulated: false,
        })
    }
}

#[async_trait]
impl PriceGateway for ExchangeClient {
    async fn price(&self, symbol: &str) -> Result<f64> {
        self.ticker_price(symbol).await
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        self.submit_order(order).await
    }

    async fn server_time(&self) -> Result<i64> {
        self.get_server_time().await
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("account_mode", &self.account_mode)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Internal helpers
// -----------------------------------------------------------------------------

/// Build the unsigned query string for an order.
fn order_params(order: &OrderRequest) -> Result<String> {
    let mut params = format!(
        "symbol={}&side={}&type={}&quantity={}",
        order.symbol, order.side, order.order_type, order.quantity
    );
    if order.order_type == OrderType::Limit {
        let price = order.price.context("limit order requires a price")?;
        params.push_str(&format!("&price={price}&timeInForce=GTC"));
    }
    Ok(params)
}

/// Exchanges disagree on whether `orderId` is a number or a string.
fn parse_order_id(body: &serde_json::Value) -> Option<String> {
    match &body["orderId"] {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse the array-of-arrays klines payload.
///
/// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume, [6] closeTime.
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Kline>> {
    let raw = body.as_array().context("klines response is not an array")?;
    let mut klines = Vec::with_capacity(raw.len());

    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;
        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }
        klines.push(Kline {
            open_time: arr[0].as_i64().unwrap_or(0),
            open: parse_str_f64(&arr[1])?,
            high: parse_str_f64(&arr[2])?,
            low: parse_str_f64(&arr[3])?,
            close: parse_str_f64(&arr[4])?,
            volume: parse_str_f64(&arr[5])?,
            close_time: arr[6].as_i64().unwrap_or(0),
        });
    }
    Ok(klines)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;

    fn client(mode: AccountMode) -> ExchangeClient {
        ExchangeClient::new("key", "key", "http://127.0.0.1:9", mode).unwrap()
    }

    #[test]
    fn sign_matches_known_hmac_vector() {
        let c = client(AccountMode::Live);
        assert_eq!(
            c.sign("The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signed_query_appends_signature_last() {
        let c = client(AccountMode::Live);
        let qs = c.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("&recvWindow=5000&signature="));
    }

    #[test]
    fn limit_params_include_price_and_tif() {
        let order = OrderRequest::limit("BTCUSDT", OrderSide::Buy, 0.5, 100.0);
        let params = order_params(&order).unwrap();
        assert_eq!(
            params,
            "symbol=BTCUSDT&side=BUY&type=LIMIT&quantity=0.5&price=100&timeInForce=GTC"
        );
    }

    #[test]
    fn market_params_have_no_price() {
        let order = OrderRequest::market("ETHUSDT", OrderSide::Sell, 2.0);
        let params = order_params(&order).unwrap();
        assert_eq!(params, "symbol=ETHUSDT&side=SELL&type=MARKET&quantity=2");
    }

    #[test]
    fn order_id_accepts_string_or_number() {
        let s = serde_json::json!({ "orderId": "C02__123" });
        let n = serde_json::json!({ "orderId": 987654 });
        let missing = serde_json::json!({ "code": -1 });
        assert_eq!(parse_order_id(&s).as_deref(), Some("C02__123"));
        assert_eq!(parse_order_id(&n).as_deref(), Some("987654"));
        assert_eq!(parse_order_id(&missing), None);
    }

    #[test]
    fn klines_parse_and_skip_short_rows() {
        let body = serde_json::json!([
            [1000, "1.0", "2.0", "0.5", "1.5", "10.0", 1999, "15.0"],
            [2000, "1.5"],
        ]);
        let klines = parse_klines(&body).unwrap();
        assert_eq!(klines.len(), 1);
        assert!((klines[0].close - 1.5).abs() < f64::EPSILON);
        assert!((klines[0].volume - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn demo_mode_simulates_orders_without_network() {
        let c = client(AccountMode::Demo);
        let ack = c
            .place_order(&OrderRequest::market("BTCUSDT", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        assert!(ack.simulated);
        assert!(ack.order_id.starts_with("sim-"));
    }
}
