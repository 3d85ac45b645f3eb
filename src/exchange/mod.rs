// =============================================================================
// Exchange capability — abstract surface over the exchange of record
// =============================================================================
//
// The core trades through this trait only. Production wraps the REST client
// in `rest.rs`; tests substitute mocks. Rate-limit and transport errors are
// surfaced untouched — classification happens in the error taxonomy and the
// health reporter, not here.
// =============================================================================

pub mod rest;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::OrderSide;

pub use rest::RestExchangeClient;

/// One OHLCV bar. `ts` is the bar's open time in UTC; bars are ordered oldest
/// first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Ticker snapshot; `last` falls back to `close` when the venue omits one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ticker {
    pub last: f64,
    pub close: f64,
}

impl Ticker {
    pub fn price(&self) -> f64 {
        if self.last > 0.0 {
            self.last
        } else {
            self.close
        }
    }
}

/// Per-asset balance snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetBalance {
    pub free: f64,
    pub total: f64,
}

/// Extra parameters attached to an order submission.
#[derive(Debug, Clone, Default)]
pub struct OrderParams {
    pub client_order_id: Option<String>,
    pub reduce_only: bool,
}

/// An order as acknowledged by the exchange.
#[derive(Debug, Clone, Default)]
pub struct Order {
    pub id: Option<String>,
    pub client_order_id: Option<String>,
    pub status: String,
    pub filled: f64,
    /// Average fill price when reported, else the order price.
    pub average: Option<f64>,
    pub price: Option<f64>,
    pub raw: Value,
}

impl Order {
    pub fn fill_price(&self) -> Option<f64> {
        self.average.or(self.price)
    }
}

/// Live position snapshot for one symbol.
#[derive(Debug, Clone, Default)]
pub struct ExchangePosition {
    pub size: f64,
    pub entry_price: Option<f64>,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub side: Option<String>,
    pub margin_mode: Option<String>,
    pub account: Option<String>,
    pub position_id: Option<String>,
    pub position_key: Option<String>,
    pub raw: Value,
}

/// Result of scanning closed fills/PnL records since a timestamp.
#[derive(Debug, Clone, Default)]
pub struct ClosedPnl {
    pub confirmed_closed: bool,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub payload: Option<Value>,
}

#[async_trait]
pub trait ExchangeCapability: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    /// Ordered (oldest-first) OHLCV bars.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>>;

    async fn fetch_balance(&self) -> Result<HashMap<String, AssetBalance>>;

    async fn create_order(
        &self,
        symbol: &str,
        order_type: &str,
        side: OrderSide,
        qty: f64,
        params: OrderParams,
    ) -> Result<Order>;

    async fn fetch_order_by_id(&self, symbol: &str, order_id: &str) -> Result<Order>;

    /// `None` when the venue reports no open position for the symbol.
    /// Implementations must try the positions list before the single-position
    /// accessor; some venues only answer one of the two.
    async fn fetch_position_for_symbol(&self, symbol: &str) -> Result<Option<ExchangePosition>>;

    async fn fetch_closed_pnl_since(&self, symbol: &str, since_ms: i64) -> Result<ClosedPnl>;
}

/// Free balance of `currency`, zero when the asset is absent.
pub fn quote_balance(balances: &HashMap<String, AssetBalance>, currency: &str) -> f64 {
    balances.get(currency).map(|b| b.free).unwrap_or(0.0)
}
