// =============================================================================
// REST exchange client — HMAC-SHA256 signed requests
// =============================================================================
//
// Production implementation of `ExchangeCapability` over a USD-M futures
// style REST API. The secret key is never logged or serialized. Signed
// requests carry the API key header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against the venue.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::types::OrderSide;

use super::{
    AssetBalance, Candle, ClosedPnl, ExchangeCapability, ExchangePosition, Order, OrderParams,
    Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

#[derive(Clone)]
pub struct RestExchangeClient {
    /// API key travels only as a default request header.
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestExchangeClient {
    /// # Arguments
    /// * `api_key` — sent as a header, never in query params.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret,
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
        }
    }

    /// Point the client at a different venue or a test server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    /// Full query string for a signed request (timestamp + recvWindow +
    /// signature appended).
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

    /// Market symbols arrive as `BASE/QUOTE`; the wire format concatenates.
    fn wire_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    async fn get_json(&self, url: &str, what: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {what} request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;
        if !status.is_success() {
            anyhow::bail!("exchange GET {what} returned {status}: {body}");
        }
        Ok(body)
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

    fn opt_f64(val: &serde_json::Value) -> Option<f64> {
        Self::parse_str_f64(val).ok().filter(|v| v.is_finite())
    }

    fn parse_order(body: serde_json::Value) -> Order {
        let id = body
            .get("orderId")
            .map(|v| match v.as_u64() {
                Some(n) => n.to_string(),
                None => v.as_str().unwrap_or_default().to_string(),
            })
            .filter(|s| !s.is_empty());
        Order {
            id,
            client_order_id: body
                .get("clientOrderId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            status: body
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            filled: body
                .get("executedQty")
                .and_then(Self::opt_f64)
                .unwrap_or(0.0),
            average: body.get("avgPrice").and_then(Self::opt_f64).filter(|p| *p > 0.0),
            price: body.get("price").and_then(Self::opt_f64).filter(|p| *p > 0.0),
            raw: body,
        }
    }

    fn parse_position(body: &serde_json::Value) -> Option<ExchangePosition> {
        let size = body.get("positionAmt").and_then(Self::opt_f64)?;
        if size == 0.0 {
            return None;
        }
        let side = if size > 0.0 { "long" } else { "short" };
        Some(ExchangePosition {
            size: size.abs(),
            entry_price: body.get("entryPrice").and_then(Self::opt_f64).filter(|p| *p > 0.0),
            mark_price: body.get("markPrice").and_then(Self::opt_f64).filter(|p| *p > 0.0),
            unrealized_pnl: body
                .get("unRealizedProfit")
                .and_then(Self::opt_f64)
                .unwrap_or(0.0),
            side: Some(side.to_string()),
            margin_mode: body
                .get("marginType")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            account: None,
            position_id: body
                .get("positionSide")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            position_key: body
                .get("symbol")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            raw: body.clone(),
        })
    }
}

#[async_trait]
impl ExchangeCapability for RestExchangeClient {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let url = format!(
            "{}/fapi/v1/ticker/price?symbol={}",
            self.base_url,
            Self::wire_symbol(symbol)
        );
        let body = self.get_json(&url, "ticker").await?;
        let price = body
            .get("price")
            .map(Self::parse_str_f64)
            .transpose()?
            .context("ticker response missing 'price'")?;
        Ok(Ticker { last: price, close: price })
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            Self::wire_symbol(symbol),
            timeframe,
            limit
        );
        let body = self.get_json(&url, "klines").await?;
        let raw = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let ts = Utc
                .timestamp_millis_opt(open_time)
                .single()
                .context("kline open time out of range")?;
            candles.push(Candle {
                ts,
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
            });
        }
        debug!(symbol, timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, AssetBalance>> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/balance?{}", self.base_url, qs);
        let body = self.get_json(&url, "balance").await?;
        let entries = body.as_array().context("balance response is not an array")?;

        let mut balances = HashMap::new();
        for entry in entries {
            let asset = entry
                .get("asset")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if asset.is_empty() {
                continue;
            }
            let total = entry.get("balance").and_then(Self::opt_f64).unwrap_or(0.0);
            let free = entry
                .get("availableBalance")
                .and_then(Self::opt_f64)
                .unwrap_or(total);
            balances.insert(asset.to_string(), AssetBalance { free, total });
        }
        Ok(balances)
    }

    async fn create_order(
        &self,
        symbol: &str,
        order_type: &str,
        side: OrderSide,
        qty: f64,
        params: OrderParams,
    ) -> Result<Order> {
        let side_wire = match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let mut query = format!(
            "symbol={}&side={}&type={}&quantity={}",
            Self::wire_symbol(symbol),
            side_wire,
            order_type.to_uppercase(),
            qty
        );
        if let Some(coid) = &params.client_order_id {
            query.push_str(&format!("&newClientOrderId={coid}"));
        }
        if params.reduce_only {
            query.push_str("&reduceOnly=true");
        }

        let qs = self.signed_query(&query);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side = %side, order_type, qty, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST order request failed")?;
        let status = resp.status();
        let body: serde_json::Value =
            resp.json().await.context("failed to parse order response")?;
        if !status.is_success() {
            anyhow::bail!("exchange POST order returned {status}: {body}");
        }
        Ok(Self::parse_order(body))
    }

    async fn fetch_order_by_id(&self, symbol: &str, order_id: &str) -> Result<Order> {
        // Numeric ids are exchange order ids; everything else is treated as a
        // client order id.
        let key = if order_id.chars().all(|c| c.is_ascii_digit()) {
            format!("orderId={order_id}")
        } else {
            format!("origClientOrderId={order_id}")
        };
        let qs = self.signed_query(&format!("symbol={}&{}", Self::wire_symbol(symbol), key));
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
        let body = self.get_json(&url, "order").await?;
        Ok(Self::parse_order(body))
    }

    async fn fetch_position_for_symbol(&self, symbol: &str) -> Result<Option<ExchangePosition>> {
        let wire = Self::wire_symbol(symbol);

        // List accessor first; some venues only answer one of the two.
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);
        match self.get_json(&url, "positions").await {
            Ok(body) => {
                if let Some(entries) = body.as_array() {
                    for entry in entries {
                        if entry.get("symbol").and_then(|v| v.as_str()) == Some(wire.as_str()) {
                            if let Some(pos) = Self::parse_position(entry) {
                                return Ok(Some(pos));
                            }
                        }
                    }
                    return Ok(None);
                }
            }
            Err(err) => {
                warn!(symbol, error = %err, "position list fetch failed; trying single accessor");
            }
        }

        // Single accessor fallback.
        let qs = self.signed_query(&format!("symbol={wire}"));
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);
        let body = self.get_json(&url, "position").await?;
        let entry = if body.is_array() {
            body.as_array()
                .and_then(|arr| arr.first().cloned())
                .unwrap_or(serde_json::Value::Null)
        } else {
            body
        };
        if entry.is_null() {
            return Ok(None);
        }
        Ok(Self::parse_position(&entry))
    }

    async fn fetch_closed_pnl_since(&self, symbol: &str, since_ms: i64) -> Result<ClosedPnl> {
        let wire = Self::wire_symbol(symbol);

        // Order history first, own trades as fallback — mirrors what the
        // venue actually keeps queryable after a position closes.
        let mut closed: Vec<serde_json::Value> = Vec::new();
        let qs = self.signed_query(&format!("symbol={wire}&startTime={since_ms}&limit=50"));
        let url = format!("{}/fapi/v1/allOrders?{}", self.base_url, qs);
        if let Ok(body) = self.get_json(&url, "allOrders").await {
            if let Some(orders) = body.as_array() {
                closed = orders
                    .iter()
                    .filter(|o| {
                        matches!(
                            o.get("status").and_then(|v| v.as_str()),
                            Some("FILLED") | Some("CANCELED") | Some("EXPIRED")
                        )
                    })
                    .cloned()
                    .collect();
            }
        }
        if closed.is_empty() {
            let qs = self.signed_query(&format!("symbol={wire}&startTime={since_ms}&limit=50"));
            let url = format!("{}/fapi/v1/userTrades?{}", self.base_url, qs);
            if let Ok(body) = self.get_json(&url, "userTrades").await {
                if let Some(trades) = body.as_array() {
                    closed = trades.clone();
                }
            }
        }

        let latest = match closed.last() {
            Some(entry) => entry.clone(),
            None => return Ok(ClosedPnl::default()),
        };

        let timestamp = latest
            .get("updateTime")
            .or_else(|| latest.get("time"))
            .and_then(|v| v.as_i64());
        let exit_time = timestamp.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        let exit_price = latest
            .get("avgPrice")
            .and_then(Self::opt_f64)
            .filter(|p| *p > 0.0)
            .or_else(|| latest.get("price").and_then(Self::opt_f64).filter(|p| *p > 0.0));

        Ok(ClosedPnl {
            confirmed_closed: true,
            exit_price,
            exit_time,
            payload: Some(latest),
        })
    }
}

impl std::fmt::Debug for RestExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestExchangeClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_symbol_strips_separator() {
        assert_eq!(RestExchangeClient::wire_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(RestExchangeClient::wire_symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn sign_is_stable_hex() {
        let client = RestExchangeClient::new("key", "secret");
        let sig = client.sign("symbol=BTCUSDT&quantity=1");
        assert_eq!(sig, client.sign("symbol=BTCUSDT&quantity=1"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn parse_order_handles_string_and_number_fields() {
        let order = RestExchangeClient::parse_order(json!({
            "orderId": 12345,
            "clientOrderId": "bot-1-abcdef0123",
            "status": "FILLED",
            "executedQty": "0.5",
            "avgPrice": "102.0",
            "price": "0",
        }));
        assert_eq!(order.id.as_deref(), Some("12345"));
        assert_eq!(order.client_order_id.as_deref(), Some("bot-1-abcdef0123"));
        assert_eq!(order.filled, 0.5);
        assert_eq!(order.fill_price(), Some(102.0));
    }

    #[test]
    fn parse_position_flat_size_is_none() {
        let flat = json!({ "symbol": "BTCUSDT", "positionAmt": "0", "entryPrice": "0" });
        assert!(RestExchangeClient::parse_position(&flat).is_none());

        let short = json!({
            "symbol": "BTCUSDT",
            "positionAmt": "-0.25",
            "entryPrice": "30000",
            "unRealizedProfit": "12.5",
            "marginType": "cross",
        });
        let pos = RestExchangeClient::parse_position(&short).unwrap();
        assert_eq!(pos.size, 0.25);
        assert_eq!(pos.side.as_deref(), Some("short"));
        assert_eq!(pos.entry_price, Some(30000.0));
        assert_eq!(pos.unrealized_pnl, 12.5);
    }
}
