// =============================================================================
// Test fixtures — mock exchange, persistence, health sink, stub strategy
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::config::StrategyConfig;
use crate::exchange::{
    AssetBalance, Candle, ClosedPnl, ExchangeCapability, ExchangePosition, Order, OrderParams,
    Ticker,
};
use crate::frame::{Frame, Row};
use crate::health::HealthSink;
use crate::persistence::{ControlRefresh, PersistenceContract};
use crate::strategy::Strategy;
use crate::types::{BotContext, EncryptedCredentials, OrderSide, TradeMode};

/// A paper-mode context over BTC/USDT with default configs.
pub fn test_context() -> BotContext {
    BotContext {
        id: "bot-1".to_string(),
        user_id: "user-1".to_string(),
        name: "alpha".to_string(),
        strategy_key: "trend".to_string(),
        mode: TradeMode::Paper,
        dry_run: false,
        subscription_status: "active".to_string(),
        exchange_id: "binanceusdm".to_string(),
        market_symbol: "BTC/USDT".to_string(),
        credentials: EncryptedCredentials::default(),
        strategy_config: StrategyConfig::default(),
        risk_config: Default::default(),
        execution_config: Default::default(),
        control_config: Default::default(),
        runtime_provider: None,
        runtime_region: None,
        runtime_machine_id: None,
    }
}

/// Hourly-spaced candles with a fixed origin; high/low bracket the close so
/// ATR warmups produce positive values.
pub fn candles_from_closes(closes: &[f64], step_secs: i64) -> Vec<Candle> {
    let origin = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Candle {
            ts: origin + chrono::Duration::seconds(i as i64 * step_secs),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        })
        .collect()
}

// =============================================================================
// FakeSink
// =============================================================================

#[derive(Default)]
pub struct FakeSink {
    calls: Mutex<Vec<(String, Value)>>,
    fail_next: AtomicBool,
}

impl FakeSink {
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn last_patch(&self) -> Option<Map<String, Value>> {
        self.calls
            .lock()
            .last()
            .and_then(|(_, patch)| patch.as_object().cloned())
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthSink for FakeSink {
    async fn upsert_bot_health_evidence(&self, bot_id: &str, patch: Value) -> (bool, f64) {
        self.calls.lock().push((bot_id.to_string(), patch));
        if self.fail_next.swap(false, Ordering::SeqCst) {
            (false, 0.0)
        } else {
            (true, 1.0)
        }
    }
}

// =============================================================================
// MockExchange
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecordedOrder {
    pub symbol: String,
    pub order_type: String,
    pub side: OrderSide,
    pub qty: f64,
    pub params: OrderParams,
}

pub struct MockExchange {
    ticker: Mutex<f64>,
    candles: Mutex<Vec<Candle>>,
    balances: Mutex<HashMap<String, AssetBalance>>,
    orders: Mutex<Vec<RecordedOrder>>,
    fail_create: Mutex<Option<String>>,
    fail_ohlcv: Mutex<Option<String>>,
    fail_order_lookup: AtomicBool,
    position: Mutex<Option<ExchangePosition>>,
    closed_pnl: Mutex<ClosedPnl>,
}

impl MockExchange {
    pub fn new(ticker: f64) -> Self {
        Self {
            ticker: Mutex::new(ticker),
            candles: Mutex::new(Vec::new()),
            balances: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            fail_create: Mutex::new(None),
            fail_ohlcv: Mutex::new(None),
            fail_order_lookup: AtomicBool::new(false),
            position: Mutex::new(None),
            closed_pnl: Mutex::new(ClosedPnl::default()),
        }
    }

    pub fn set_ticker(&self, price: f64) {
        *self.ticker.lock() = price;
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        *self.candles.lock() = candles;
    }

    pub fn set_balance(&self, asset: &str, free: f64, total: f64) {
        self.balances
            .lock()
            .insert(asset.to_string(), AssetBalance { free, total });
    }

    pub fn created_orders(&self) -> Vec<RecordedOrder> {
        self.orders.lock().clone()
    }

    pub fn fail_create_order(&self, message: &str) {
        *self.fail_create.lock() = Some(message.to_string());
    }

    pub fn fail_ohlcv(&self, message: &str) {
        *self.fail_ohlcv.lock() = Some(message.to_string());
    }

    pub fn fail_order_lookup(&self) {
        self.fail_order_lookup.store(true, Ordering::SeqCst);
    }

    pub fn set_position(&self, position: Option<ExchangePosition>) {
        *self.position.lock() = position;
    }

    pub fn set_closed_pnl(&self, closed: ClosedPnl) {
        *self.closed_pnl.lock() = closed;
    }
}

#[async_trait]
impl ExchangeCapability for MockExchange {
    async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker> {
        let price = *self.ticker.lock();
        Ok(Ticker { last: price, close: price })
    }

    async fn fetch_ohlcv(&self, _symbol: &str, _timeframe: &str, _limit: u32) -> Result<Vec<Candle>> {
        if let Some(message) = self.fail_ohlcv.lock().clone() {
            anyhow::bail!(message);
        }
        Ok(self.candles.lock().clone())
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, AssetBalance>> {
        Ok(self.balances.lock().clone())
    }

    async fn create_order(
        &self,
        symbol: &str,
        order_type: &str,
        side: OrderSide,
        qty: f64,
        params: OrderParams,
    ) -> Result<Order> {
        if let Some(message) = self.fail_create.lock().clone() {
            anyhow::bail!(message);
        }
        let price = *self.ticker.lock();
        let mut orders = self.orders.lock();
        orders.push(RecordedOrder {
            symbol: symbol.to_string(),
            order_type: order_type.to_string(),
            side,
            qty,
            params: params.clone(),
        });
        let id = orders.len().to_string();
        Ok(Order {
            id: Some(id.clone()),
            client_order_id: params.client_order_id,
            status: "FILLED".to_string(),
            filled: qty,
            average: Some(price),
            price: Some(price),
            raw: serde_json::json!({ "orderId": id }),
        })
    }

    async fn fetch_order_by_id(&self, _symbol: &str, order_id: &str) -> Result<Order> {
        if self.fail_order_lookup.load(Ordering::SeqCst) {
            anyhow::bail!("order {order_id} not found");
        }
        Ok(Order {
            id: Some(order_id.to_string()),
            status: "FILLED".to_string(),
            ..Default::default()
        })
    }

    async fn fetch_position_for_symbol(&self, _symbol: &str) -> Result<Option<ExchangePosition>> {
        Ok(self.position.lock().clone())
    }

    async fn fetch_closed_pnl_since(&self, _symbol: &str, _since_ms: i64) -> Result<ClosedPnl> {
        Ok(self.closed_pnl.lock().clone())
    }
}

// =============================================================================
// MockPersistence
// =============================================================================

#[derive(Default)]
pub struct MockPersistence {
    context_row: Mutex<Value>,
    position_upserts: Mutex<Vec<Value>>,
    trade_upserts: Mutex<Vec<(Option<String>, Value)>>,
    heartbeats: Mutex<Vec<Value>>,
    notified: Mutex<Vec<(String, Value)>>,
    open_position: Mutex<Option<Value>>,
    open_reads: AtomicUsize,
    refresh_queue: Mutex<VecDeque<ControlRefresh>>,
    fail_notify: AtomicBool,
    insert_counter: AtomicUsize,
}

impl MockPersistence {
    pub fn set_context(&self, row: Value) {
        *self.context_row.lock() = row;
    }

    pub fn set_open_position(&self, row: Option<Value>) {
        *self.open_position.lock() = row;
    }

    pub fn open_position_reads(&self) -> usize {
        self.open_reads.load(Ordering::SeqCst)
    }

    pub fn queue_refresh(&self, refresh: ControlRefresh) {
        self.refresh_queue.lock().push_back(refresh);
    }

    pub fn fail_notify(&self) {
        self.fail_notify.store(true, Ordering::SeqCst);
    }

    pub fn position_upserts(&self) -> Vec<Value> {
        self.position_upserts.lock().clone()
    }

    pub fn trade_upserts(&self) -> Vec<(Option<String>, Value)> {
        self.trade_upserts.lock().clone()
    }

    pub fn heartbeats(&self) -> Vec<Value> {
        self.heartbeats.lock().clone()
    }

    pub fn notifications(&self, channel: &str) -> Vec<Value> {
        self.notified
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl PersistenceContract for MockPersistence {
    async fn get_context(&self, _bot_id: &str) -> Result<Value> {
        Ok(self.context_row.lock().clone())
    }

    async fn refresh_controls(&self, _bot_id: &str) -> Result<ControlRefresh> {
        Ok(self
            .refresh_queue
            .lock()
            .pop_front()
            .unwrap_or_default())
    }

    async fn heartbeat(&self, _bot_id: &str, payload: Value) -> Result<()> {
        self.heartbeats.lock().push(payload);
        Ok(())
    }

    async fn get_open_position(&self, _bot_id: &str) -> Result<Option<Value>> {
        self.open_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.open_position.lock().clone())
    }

    async fn upsert_position(&self, _bot_id: &str, payload: Value) -> Result<Option<String>> {
        let is_update = payload.get("id").map(|v| !v.is_null()).unwrap_or(false);
        self.position_upserts.lock().push(payload);
        if is_update {
            Ok(None)
        } else {
            let n = self.insert_counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(format!("pos-{n}")))
        }
    }

    async fn upsert_trade(
        &self,
        _bot_id: &str,
        exchange_order_id: Option<&str>,
        payload: Value,
    ) -> Result<()> {
        self.trade_upserts
            .lock()
            .push((exchange_order_id.map(str::to_string), payload));
        Ok(())
    }

    async fn notify(&self, _bot_id: &str, channel: &str, payload: Value) -> Result<()> {
        if self.fail_notify.load(Ordering::SeqCst) {
            anyhow::bail!("db timeout");
        }
        self.notified.lock().push((channel.to_string(), payload));
        Ok(())
    }
}

// =============================================================================
// StubStrategy
// =============================================================================

pub struct StubStrategy {
    long: bool,
    short: bool,
    atr: f64,
}

impl StubStrategy {
    pub fn long_only(atr: f64) -> Self {
        Self { long: true, short: false, atr }
    }

    pub fn short_only(atr: f64) -> Self {
        Self { long: false, short: true, atr }
    }

    pub fn no_signal(atr: f64) -> Self {
        Self { long: false, short: false, atr }
    }
}

impl Strategy for StubStrategy {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn prepare(&self, mut frame: Frame, _cfg: &StrategyConfig) -> Result<Frame> {
        let atr = vec![self.atr; frame.len()];
        frame.set_column("atr", atr);
        Ok(frame)
    }

    fn long_signal(&self, _row: &Row<'_>, _cfg: &StrategyConfig) -> Result<bool> {
        Ok(self.long)
    }

    fn short_signal(&self, _row: &Row<'_>, _cfg: &StrategyConfig) -> Result<bool> {
        Ok(self.short)
    }
}
