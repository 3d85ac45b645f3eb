// =============================================================================
// Order submitter — slippage guard, client-order-id minting, submit + log
// =============================================================================
//
// Every submission mints a deterministic client order id so retries and
// journal rows stay idempotent. Live orders are refused when the venue price
// has drifted more than the configured budget away from the price the
// decision was made at.
// =============================================================================

use anyhow::Result;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ReasonCode;
use crate::exchange::{ExchangeCapability, Order, OrderParams};
use crate::health::HealthReporter;
use crate::ids::generate_client_order_id;
use crate::types::{BotContext, OrderSide};

/// What a submission produced. Dry runs carry no exchange order.
#[derive(Debug, Clone)]
pub struct OrderSubmission {
    pub order: Option<Order>,
    pub client_order_id: String,
}

/// Price drift in basis points relative to `expected`.
pub fn slippage_bps(live: f64, expected: f64) -> f64 {
    if expected <= 0.0 {
        return 0.0;
    }
    (live - expected).abs() / expected * 10_000.0
}

/// Submit a market order (or simulate one when dry-running).
///
/// Returns `None` for non-positive quantities. Failures are recorded as
/// order rejects with a classified reason and re-raised — the caller decides
/// whether the tick survives.
#[allow(clippy::too_many_arguments)]
pub async fn send_order(
    ctx: &BotContext,
    exchange: &dyn ExchangeCapability,
    reporter: &HealthReporter,
    side: OrderSide,
    qty: f64,
    expected_price: f64,
    purpose: Option<&str>,
    reduce_only: bool,
) -> Result<Option<OrderSubmission>> {
    if qty <= 0.0 {
        return Ok(None);
    }

    let client_order_id = generate_client_order_id(&ctx.id, purpose);
    reporter.record_order_submit().await;

    if ctx.is_dry_run() {
        info!(
            symbol = %ctx.market_symbol,
            side = %side,
            qty,
            client_order_id = %client_order_id,
            "dry run order"
        );
        return Ok(Some(OrderSubmission {
            order: None,
            client_order_id,
        }));
    }

    match submit_live(
        ctx,
        exchange,
        reporter,
        side,
        qty,
        expected_price,
        &client_order_id,
        reduce_only,
    )
    .await
    {
        Ok(order) => {
            info!(
                symbol = %ctx.market_symbol,
                side = %side,
                qty,
                client_order_id = %client_order_id,
                exchange_order_id = order.id.as_deref().unwrap_or(""),
                status = %order.status,
                "live order placed"
            );
            Ok(Some(OrderSubmission {
                order: Some(order),
                client_order_id,
            }))
        }
        Err(err) => {
            let reason = ReasonCode::classify_error(&err);
            warn!(
                symbol = %ctx.market_symbol,
                side = %side,
                reason = %reason,
                error = %err,
                "order submission failed"
            );
            reporter.record_order_reject(reason.as_str()).await;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn submit_live(
    ctx: &BotContext,
    exchange: &dyn ExchangeCapability,
    reporter: &HealthReporter,
    side: OrderSide,
    qty: f64,
    expected_price: f64,
    client_order_id: &str,
    reduce_only: bool,
) -> Result<Order> {
    let ticker = exchange.fetch_ticker(&ctx.market_symbol).await?;
    let live = if ticker.price() > 0.0 {
        ticker.price()
    } else {
        expected_price
    };

    let max_slippage = ctx.execution_config.max_slippage_bps as f64;
    let slip = slippage_bps(live, expected_price);
    if slip > max_slippage {
        anyhow::bail!(
            "slippage guard: live={live} expected={expected_price} slip={slip:.1}bps > {max_slippage}bps"
        );
    }

    info!(
        symbol = %ctx.market_symbol,
        side = %side,
        qty,
        slip_bps = format!("{slip:.1}"),
        "submitting market order"
    );

    let started = Instant::now();
    let order = exchange
        .create_order(
            &ctx.market_symbol,
            &ctx.execution_config.order_type,
            side,
            qty,
            OrderParams {
                client_order_id: Some(client_order_id.to_string()),
                reduce_only,
            },
        )
        .await?;

    let latency_ms = started.elapsed().as_millis() as i64;
    reporter.record_order_ack(latency_ms).await;
    Ok(order)
}
