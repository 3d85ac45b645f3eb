// =============================================================================
// Journal — event, trade, position, and state writes through persistence
// =============================================================================
//
// Event and notification writes are best-effort: a failed insert becomes a
// log line and a db_error health record, never an aborted tick. Position and
// trade writes propagate — losing a journal row for a real fill is a loop
// error worth counting.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::exchange::Order;
use crate::health::HealthReporter;
use crate::persistence::PersistenceContract;
use crate::state::PositionState;
use crate::types::{BotContext, Direction};

/// Best-effort event row (channel `events`).
pub async fn write_event(
    db: &dyn PersistenceContract,
    reporter: &HealthReporter,
    ctx: &BotContext,
    event_type: &str,
    message: &str,
) {
    let payload = json!({
        "user_id": ctx.user_id,
        "event_type": event_type,
        "message": message,
    });
    match db.notify(&ctx.id, "events", payload).await {
        Ok(()) => reporter.record_db_ok(),
        Err(err) => {
            warn!(event_type, error = %err, "event write failed");
            reporter.record_db_error().await;
        }
    }
}

/// Best-effort user notification (channel `notifications`).
pub async fn notify_user(
    db: &dyn PersistenceContract,
    ctx: &BotContext,
    event_key: &str,
    title: &str,
    body: &str,
    severity: &str,
) {
    let payload = json!({
        "user_id": ctx.user_id,
        "event_key": event_key,
        "title": title,
        "body": body,
        "severity": severity,
    });
    if let Err(err) = db.notify(&ctx.id, "notifications", payload).await {
        warn!(event_key, error = %err, "notification write failed");
    }
}

/// Best-effort support email enqueue (channel `email`).
pub async fn queue_support_email(
    db: &dyn PersistenceContract,
    ctx: &BotContext,
    event_key: &str,
    template: &str,
    payload: Value,
) {
    let body = json!({
        "user_id": ctx.user_id,
        "event_key": event_key,
        "email_template": template,
        "support_email": std::env::var("SUPPORT_EMAIL").ok(),
        "payload": payload,
    });
    if let Err(err) = db.notify(&ctx.id, "email", body).await {
        warn!(event_key, error = %err, "email enqueue failed");
    }
}

/// Persist the position-state snapshot on the heartbeat RPC.
pub async fn persist_state(
    db: &dyn PersistenceContract,
    reporter: &HealthReporter,
    ctx: &BotContext,
    state: &PositionState,
) -> Result<()> {
    let mut payload = serde_json::to_value(state).context("state snapshot serialization")?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("user_id".to_string(), Value::String(ctx.user_id.clone()));
        obj.insert("heartbeat_at".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    match db.heartbeat(&ctx.id, payload).await {
        Ok(()) => {
            reporter.record_db_ok();
            Ok(())
        }
        Err(err) => {
            reporter.record_db_error().await;
            Err(err)
        }
    }
}

/// Journal a new entry: open position row plus the entry trade row.
/// Returns the position row id.
#[allow(clippy::too_many_arguments)]
pub async fn on_entry(
    db: &dyn PersistenceContract,
    reporter: &HealthReporter,
    ctx: &BotContext,
    direction: Direction,
    entry_price: f64,
    entry_time: DateTime<Utc>,
    qty: f64,
    entry_exchange_order_id: Option<&str>,
    entry_client_order_id: &str,
    order_payload: Option<&Order>,
) -> Result<String> {
    let position_id = db
        .upsert_position(
            &ctx.id,
            json!({
                "user_id": ctx.user_id,
                "symbol": ctx.market_symbol,
                "exchange": ctx.exchange_id,
                "direction": direction.as_str(),
                "position_side": direction.as_str(),
                "entry_price": entry_price,
                "entry_time": entry_time.to_rfc3339(),
                "qty": qty,
                "status": "open",
                "margin_mode": ctx.execution_config.margin_mode,
                "entry_exchange_order_id": entry_exchange_order_id,
                "entry_client_order_id": entry_client_order_id,
                "entry_payload": order_payload.map(|o| o.raw.clone()),
            }),
        )
        .await?
        .context("position insert returned no id")?;

    db.upsert_trade(
        &ctx.id,
        entry_exchange_order_id,
        json!({
            "user_id": ctx.user_id,
            "position_id": position_id,
            "side": direction.open_side().as_str(),
            "price": entry_price,
            "qty": qty,
            "fee": Value::Null,
            "pnl": Value::Null,
            "client_order_id": entry_client_order_id,
            "executed_at": entry_time.to_rfc3339(),
        }),
    )
    .await?;

    reporter.record_db_ok();
    Ok(position_id)
}

/// Journal a scale-in fill against the existing position row.
#[allow(clippy::too_many_arguments)]
pub async fn on_pyramid(
    db: &dyn PersistenceContract,
    ctx: &BotContext,
    position_id: &str,
    direction: Direction,
    price: f64,
    qty: f64,
    exchange_order_id: Option<&str>,
    client_order_id: &str,
    executed_at: DateTime<Utc>,
) -> Result<()> {
    db.upsert_trade(
        &ctx.id,
        exchange_order_id,
        json!({
            "user_id": ctx.user_id,
            "position_id": position_id,
            "side": direction.open_side().as_str(),
            "price": price,
            "qty": qty,
            "fee": Value::Null,
            "pnl": Value::Null,
            "client_order_id": client_order_id,
            "executed_at": executed_at.to_rfc3339(),
        }),
    )
    .await
}

/// Journal an exit: close the position row and write the closing trade row.
#[allow(clippy::too_many_arguments)]
pub async fn on_exit(
    db: &dyn PersistenceContract,
    reporter: &HealthReporter,
    ctx: &BotContext,
    position_id: &str,
    direction: Direction,
    exit_price: f64,
    exit_time: DateTime<Utc>,
    qty: f64,
    realized_pnl: f64,
    reason: &str,
    exit_exchange_order_id: Option<&str>,
    exit_client_order_id: &str,
    order_payload: Option<&Order>,
) -> Result<()> {
    db.upsert_position(
        &ctx.id,
        json!({
            "id": position_id,
            "status": "closed",
            "exit_price": exit_price,
            "exit_time": exit_time.to_rfc3339(),
            "realized_pnl": realized_pnl,
            "close_reason": reason,
            "exit_exchange_order_id": exit_exchange_order_id,
            "exit_client_order_id": exit_client_order_id,
            "exit_payload": order_payload.map(|o| o.raw.clone()),
        }),
    )
    .await?;

    db.upsert_trade(
        &ctx.id,
        exit_exchange_order_id,
        json!({
            "user_id": ctx.user_id,
            "position_id": position_id,
            "side": direction.close_side().as_str(),
            "price": exit_price,
            "qty": qty,
            "fee": Value::Null,
            "pnl": realized_pnl,
            "client_order_id": exit_client_order_id,
            "executed_at": exit_time.to_rfc3339(),
        }),
    )
    .await?;

    write_event(
        db,
        reporter,
        ctx,
        "trade",
        &format!("EXIT {direction} {reason} price={exit_price:.6} pnl={realized_pnl:.4}"),
    )
    .await;
    Ok(())
}
