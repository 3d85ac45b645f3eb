// =============================================================================
// Exchange-sync service — drift detection against the exchange of record
// =============================================================================
//
// Runs once at startup and then on a timeframe-derived cadence. The local
// open-position row is the claim; the exchange is the authority. Identity
// failures and unconfirmed disappearances are fatal: the loop must not keep
// trading on top of a position it cannot prove it holds.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::exchange::{ExchangeCapability, ExchangePosition};
use crate::persistence::PersistenceContract;
use crate::timeframes::timeframe_to_seconds;
use crate::types::BotContext;

const REQUIRED_FIELDS: [&str; 5] = [
    "symbol",
    "entry_exchange_order_id",
    "entry_client_order_id",
    "position_side",
    "direction",
];

pub struct ExchangeSyncService {
    bot_id: String,
    exchange_id: String,
    margin_mode: Option<String>,
    exchange: Arc<dyn ExchangeCapability>,
    db: Arc<dyn PersistenceContract>,
    interval: Duration,
    next_sync_at: Option<Instant>,
}

impl ExchangeSyncService {
    pub fn new(
        ctx: &BotContext,
        exchange: Arc<dyn ExchangeCapability>,
        db: Arc<dyn PersistenceContract>,
    ) -> Self {
        Self {
            bot_id: ctx.id.clone(),
            exchange_id: ctx.exchange_id.clone(),
            margin_mode: ctx.execution_config.margin_mode.clone(),
            exchange,
            db,
            interval: Self::compute_interval(&ctx.execution_config.timeframe),
            next_sync_at: None,
        }
    }

    /// `min(2 x timeframe, 600 s)`, floored at 300 s.
    fn compute_interval(timeframe: &str) -> Duration {
        let tf_sec = timeframe_to_seconds(timeframe);
        let secs = (tf_sec * 2.0).min(600.0).max(300.0);
        Duration::from_secs_f64(secs)
    }

    pub async fn startup_sync(&mut self) -> Result<()> {
        self.run_sync().await
    }

    /// Cadenced entry point for the loop. A skipped call is `Ok`.
    pub async fn maybe_sync(&mut self) -> Result<()> {
        let now = Instant::now();
        if let Some(next) = self.next_sync_at {
            if now < next {
                return Ok(());
            }
        }
        self.next_sync_at = Some(now + self.interval);
        self.run_sync().await
    }

    async fn run_sync(&self) -> Result<()> {
        let Some(row) = self.db.get_open_position(&self.bot_id).await? else {
            return Ok(());
        };
        self.sync_open_position(row).await
    }

    async fn sync_open_position(&self, row: Value) -> Result<()> {
        let missing: Vec<&'static str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| str_field(&row, field).is_none())
            .collect();
        let position_id = str_field(&row, "id");

        if !missing.is_empty() {
            self.mark_status(position_id.as_deref(), "mismatch").await;
            return Err(SyncError::MissingIdentity(missing).into());
        }

        let symbol = str_field(&row, "symbol").unwrap_or_default();
        let entry_order_id = str_field(&row, "entry_exchange_order_id").unwrap_or_default();

        if let Err(err) = self.exchange.fetch_order_by_id(&symbol, &entry_order_id).await {
            self.mark_status(position_id.as_deref(), "mismatch").await;
            return Err(SyncError::EntryOrderLookup(format!("{err:#}")).into());
        }

        match self.exchange.fetch_position_for_symbol(&symbol).await? {
            Some(live) => {
                let updates = self.build_live_updates(&live, &row);
                self.db.upsert_position(&self.bot_id, updates).await?;
                info!(symbol = %symbol, qty = live.size, "exchange sync refreshed open position");
                Ok(())
            }
            None => self.confirm_closure(&row, &symbol, position_id.as_deref()).await,
        }
    }

    /// The exchange shows no position: either it closed it (confirm through
    /// the closed-PnL trail and mirror the closure locally) or the position
    /// is simply missing, which nobody can repair automatically.
    async fn confirm_closure(
        &self,
        row: &Value,
        symbol: &str,
        position_id: Option<&str>,
    ) -> Result<()> {
        let since_ms = str_field(row, "entry_time")
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.timestamp_millis())
            .unwrap_or(0);

        let closed = self.exchange.fetch_closed_pnl_since(symbol, since_ms).await?;
        if !closed.confirmed_closed {
            self.mark_status(position_id, "missing").await;
            return Err(SyncError::MissingNotConfirmed.into());
        }

        let qty = f64_field(row, "qty").unwrap_or(0.0);
        let entry_price = f64_field(row, "entry_price").unwrap_or(0.0);
        let sign = match str_field(row, "direction").as_deref() {
            Some("short") => -1.0,
            _ => 1.0,
        };
        let exit_price = closed.exit_price.unwrap_or(0.0);
        let realized = (exit_price - entry_price) * qty * sign;
        let exit_time = closed.exit_time.unwrap_or_else(Utc::now);

        self.db
            .upsert_position(
                &self.bot_id,
                json!({
                    "id": position_id,
                    "status": "closed",
                    "exit_price": closed.exit_price,
                    "exit_time": exit_time.to_rfc3339(),
                    "realized_pnl": realized,
                    "exit_exchange_order_id": closed.payload.as_ref().and_then(|p| p.get("orderId").cloned()),
                    "exit_client_order_id": closed.payload.as_ref().and_then(|p| p.get("clientOrderId").cloned()),
                    "exit_payload": closed.payload,
                    "exchange_sync_status": "ok",
                    "last_exchange_sync_at": exit_time.to_rfc3339(),
                }),
            )
            .await?;
        warn!(symbol, realized_pnl = realized, "closed missing position reported by exchange");
        Ok(())
    }

    fn build_live_updates(&self, live: &ExchangePosition, row: &Value) -> Value {
        let qty = if live.size > 0.0 {
            live.size
        } else {
            f64_field(row, "qty").unwrap_or(0.0)
        };
        json!({
            "id": str_field(row, "id"),
            "qty": qty,
            "entry_price": live.entry_price.or_else(|| f64_field(row, "entry_price")),
            "mark_price": live.mark_price,
            "unrealized_pnl": live.unrealized_pnl,
            "symbol": str_field(row, "symbol"),
            "exchange": self.exchange_id,
            "position_side": live.side.clone().or_else(|| str_field(row, "position_side")),
            "margin_mode": live.margin_mode.clone().or_else(|| self.margin_mode.clone()),
            "exchange_account_ref": live.account,
            "exchange_position_id": live.position_id,
            "exchange_position_key": live.position_key,
            "payload": live.raw,
            "exchange_sync_status": "ok",
            "last_exchange_sync_at": Utc::now().to_rfc3339(),
        })
    }

    /// Best-effort status mark; the sync error it accompanies matters more.
    async fn mark_status(&self, position_id: Option<&str>, status: &str) {
        let payload = json!({
            "id": position_id,
            "exchange_sync_status": status,
            "last_exchange_sync_at": Utc::now().to_rfc3339(),
        });
        if let Err(err) = self.db.upsert_position(&self.bot_id, payload).await {
            warn!(status, error = %err, "failed to persist exchange sync status");
        }
    }
}

fn str_field(row: &Value, field: &str) -> Option<String> {
    match row.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn f64_field(row: &Value, field: &str) -> Option<f64> {
    match row.get(field) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}
