// =============================================================================
// Bootstrap — context hydration, connectivity probe, subsystem start
// =============================================================================
//
// Boot order: hydrate context -> resolve + clamp configs -> health reporter
// -> exchange client + startup sync -> startup gate -> connectivity probe ->
// liveness check -> loop. Every step fails with a message a user can act on;
// failures after the gate also land in the health evidence as auth failures.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::{normalize_configs, resolve_configs, PollingTier};
use crate::crypto;
use crate::error::{is_rate_limit_text, ReasonCode};
use crate::exchange::{ExchangeCapability, RestExchangeClient};
use crate::health::reporter::{spawn_flush_loop, spawn_position_sync_watcher};
use crate::health::{HealthReporter, HealthSink};
use crate::healthcheck;
use crate::monitoring;
use crate::persistence::{PersistenceContract, RuntimeRpcClient};
use crate::state::PositionState;
use crate::strategy::get_strategy;
use crate::sync::ExchangeSyncService;
use crate::trading::{journal, PositionManager};
use crate::types::{BotContext, Direction, EncryptedCredentials, TradeMode};
use crate::runtime::gates::startup_gate;
use crate::runtime::trading_loop::TradingLoop;

/// Entry point for the process. `Ok` is a clean stop (exit 0); `Err` is an
/// unrecoverable bootstrap failure (exit non-zero, supervisor restarts).
pub async fn start(bot_id: &str) -> Result<()> {
    monitoring::init();

    let rpc = Arc::new(RuntimeRpcClient::from_env()?);
    let db: Arc<dyn PersistenceContract> = rpc.clone();
    let sink: Arc<dyn HealthSink> = rpc;

    match run(bot_id, db.clone(), sink).await {
        Ok(()) => Ok(()),
        Err(err) => {
            report_startup_failure(db.as_ref(), bot_id, &err).await;
            Err(err)
        }
    }
}

async fn run(
    bot_id: &str,
    db: Arc<dyn PersistenceContract>,
    sink: Arc<dyn HealthSink>,
) -> Result<()> {
    // 1. Context row + config resolution.
    let row = db.get_context(bot_id).await?;
    let mut ctx = parse_context(&row)?;
    info!(bot = %ctx.name, strategy = %ctx.strategy_key, "context loaded");

    let tier = resolve_tier(&ctx);

    // 2. Health reporter and its flush loop.
    let reporter = Arc::new(HealthReporter::new(ctx.id.clone(), sink, tier));
    spawn_flush_loop(reporter.clone());

    let strategy = get_strategy(&ctx.strategy_key)?;

    // 3. Credentials + exchange client.
    let exchange: Arc<dyn ExchangeCapability> = Arc::new(build_exchange_client(&ctx.credentials)?);

    // 4. Exchange sync: hydrate local state, then verify against the venue.
    let state = hydrate_state(db.get_open_position(&ctx.id).await?);
    let mut sync = ExchangeSyncService::new(&ctx, exchange.clone(), db.clone());
    sync.startup_sync()
        .await
        .context("startup exchange sync failed")?;

    journal::persist_state(db.as_ref(), &reporter, &ctx, &state).await?;
    journal::write_event(db.as_ref(), &reporter, &ctx, "status", "starting").await;

    // 5. Startup gate.
    if !ctx.subscription_active() {
        journal::write_event(
            db.as_ref(),
            &reporter,
            &ctx,
            "inactive_subscription_exit",
            "Subscription not active",
        )
        .await;
        warn!("subscription inactive; exiting");
        return Ok(());
    }
    if let Err(reason) = startup_gate(&ctx) {
        journal::write_event(
            db.as_ref(),
            &reporter,
            &ctx,
            "kill_switch_exit",
            &format!("Startup blocked: {reason}"),
        )
        .await;
        journal::notify_user(
            db.as_ref(),
            &ctx,
            "startup_blocked",
            "Bot startup blocked",
            reason,
            "warning",
        )
        .await;
        warn!(reason, "startup blocked");
        return Ok(());
    }

    // 6. Connectivity probe.
    if let Err(err) = assert_connectivity(&ctx, exchange.as_ref(), &reporter).await {
        reporter
            .mark_auth_fail(ReasonCode::classify_error(&err).as_str())
            .await;
        return Err(err);
    }
    reporter.mark_auth_ok();
    journal::write_event(
        db.as_ref(),
        &reporter,
        &ctx,
        "connectivity_ok",
        &format!("{} {}", ctx.exchange_id, ctx.market_symbol),
    )
    .await;
    journal::notify_user(
        db.as_ref(),
        &ctx,
        "connectivity_ok",
        "Exchange connectivity verified",
        &format!("{} {}", ctx.exchange_id, ctx.market_symbol),
        "info",
    )
    .await;

    // 7. External liveness check.
    let hc_ping_url = healthcheck::ensure(
        &ctx.id,
        &format!("bot-{}", ctx.name),
        ctx.execution_config.poll_interval,
    )
    .await;

    // 8. Background position-sync watcher.
    let manager = PositionManager::new(exchange.clone(), db.clone(), reporter.clone(), state);
    let handle = manager.handle();
    spawn_position_sync_watcher(
        reporter.clone(),
        exchange,
        ctx.base_currency().to_string(),
        move || {
            let snap = handle.snapshot();
            (snap.in_position, snap.qty)
        },
    );

    // 9. Go.
    journal::write_event(
        db.as_ref(),
        &reporter,
        &ctx,
        "started",
        &format!("strategy={} tf={}", ctx.strategy_key, ctx.execution_config.timeframe),
    )
    .await;
    journal::write_event(db.as_ref(), &reporter, &ctx, "status", "running").await;

    let mut trading_loop = TradingLoop::new(
        db.clone(),
        reporter,
        manager,
        sync,
        strategy,
        tier,
        hc_ping_url,
    );
    let exit = trading_loop.run(&mut ctx).await?;
    info!(exit = ?exit, "trading loop stopped");
    Ok(())
}

// -----------------------------------------------------------------------------
// Context hydration
// -----------------------------------------------------------------------------

/// Build the typed context from the joined context row, resolving the four
/// config bundles through the layered merge and the safety clamps.
pub fn parse_context(row: &Value) -> Result<BotContext> {
    let definition = row.get("strategy_definition").cloned().unwrap_or(Value::Null);
    let defaults = definition.get("defaults").cloned().unwrap_or(Value::Null);
    let profile = row
        .get("strategy_profile_overrides")
        .cloned()
        .unwrap_or(Value::Null);
    let user = row.get("user_overrides").cloned().unwrap_or(Value::Null);
    let persisted = json!({
        "strategy_config": row.get("strategy_config").cloned().unwrap_or(Value::Null),
        "risk_config": row.get("risk_config").cloned().unwrap_or(Value::Null),
        "execution_config": row.get("execution_config").cloned().unwrap_or(Value::Null),
        "control_config": row.get("control_config").cloned().unwrap_or(Value::Null),
    });

    let (strategy_cfg, risk_cfg, exec_cfg, control_cfg) =
        resolve_configs(&defaults, &profile, &user, &persisted)?;

    let mut ctx = BotContext {
        id: required_str(row, "id")?,
        user_id: required_str(row, "user_id")?,
        name: required_str(row, "name")?,
        strategy_key: str_or(row, "strategy_key")
            .or_else(|| str_or(row, "strategy"))
            .context("context row missing strategy key")?,
        mode: TradeMode::parse(&str_or(row, "mode").unwrap_or_default()),
        dry_run: row.get("dry_run").and_then(Value::as_bool).unwrap_or(false),
        subscription_status: str_or(row, "subscription_status").unwrap_or_default(),
        exchange_id: required_str(row, "exchange_ccxt_id")?,
        market_symbol: required_str(row, "market_symbol")?,
        credentials: EncryptedCredentials {
            api_key: str_or(row, "api_key_encrypted").unwrap_or_default(),
            api_secret: str_or(row, "api_secret_encrypted").unwrap_or_default(),
            api_password: str_or(row, "api_password_encrypted"),
            api_uid: str_or(row, "api_uid_encrypted"),
        },
        strategy_config: strategy_cfg,
        risk_config: risk_cfg,
        execution_config: exec_cfg,
        control_config: control_cfg,
        runtime_provider: str_or(row, "runtime_provider")
            .or_else(|| std::env::var("RUNTIME_PROVIDER").ok()),
        runtime_region: str_or(row, "runtime_region"),
        runtime_machine_id: str_or(row, "runtime_machine_id"),
    };

    // Dry-run bots always behave as paper trading, whatever mode is stored.
    if ctx.dry_run {
        ctx.mode = TradeMode::Paper;
    }

    let tier = resolve_tier(&ctx);
    let normalized = normalize_configs(
        ctx.strategy_config.clone(),
        ctx.risk_config.clone(),
        ctx.execution_config.clone(),
        ctx.control_config.clone(),
        tier,
    );
    for clamp in &normalized.clamps {
        info!(clamp = %clamp, "config clamped");
    }
    ctx.strategy_config = normalized.strategy;
    ctx.risk_config = normalized.risk;
    ctx.execution_config = normalized.execution;
    ctx.control_config = normalized.control;

    Ok(ctx)
}

/// `POLLING_TIER` env beats the configured tier.
fn resolve_tier(ctx: &BotContext) -> PollingTier {
    std::env::var("POLLING_TIER")
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| PollingTier::parse(&raw))
        .or_else(|| {
            ctx.execution_config
                .polling_tier
                .as_deref()
                .map(PollingTier::parse)
        })
        .unwrap_or_default()
}

/// Seed the in-memory state from the persisted open row, if one exists.
pub fn hydrate_state(open_row: Option<Value>) -> PositionState {
    let Some(row) = open_row else {
        return PositionState::default();
    };

    let entry_price = row
        .get("entry_price")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let qty = row.get("qty").and_then(Value::as_f64).unwrap_or(0.0);
    let direction = row
        .get("direction")
        .and_then(Value::as_str)
        .and_then(Direction::parse);

    if entry_price <= 0.0 || qty <= 0.0 || direction.is_none() {
        warn!("open position row is incomplete; starting flat");
        return PositionState::default();
    }

    PositionState {
        in_position: true,
        position_id: row
            .get("id")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        direction,
        entry_price,
        entry_time: row
            .get("entry_time")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&chrono::Utc)),
        qty,
        base_notional: entry_price * qty,
        peak_price: entry_price,
        low_price: entry_price,
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// Connectivity probe
// -----------------------------------------------------------------------------

fn build_exchange_client(credentials: &EncryptedCredentials) -> Result<RestExchangeClient> {
    let api_key = crypto::decrypt(Some(&credentials.api_key))
        .context("Could not decrypt API credentials. Check BOT_ENC_KEY and stored keys.")?;
    let api_secret = crypto::decrypt(Some(&credentials.api_secret))
        .context("Could not decrypt API credentials. Check BOT_ENC_KEY and stored keys.")?;

    let (Some(api_key), Some(api_secret)) = (api_key, api_secret) else {
        anyhow::bail!("Missing API key/secret after decrypt. Please re-enter your exchange keys.");
    };

    // Some venues carry a passphrase/uid; decrypt them so a corrupt token
    // fails the probe even when the venue ignores them.
    crypto::decrypt(credentials.api_password.as_deref())
        .context("Could not decrypt API passphrase. Check BOT_ENC_KEY and stored keys.")?;
    crypto::decrypt(credentials.api_uid.as_deref())
        .context("Could not decrypt API uid. Check BOT_ENC_KEY and stored keys.")?;

    let client = RestExchangeClient::new(api_key, api_secret);
    Ok(match std::env::var("EXCHANGE_API_BASE") {
        Ok(base) if !base.trim().is_empty() => client.with_base_url(base),
        _ => client,
    })
}

/// Verify ticker, market data, and balance access before entering the loop.
async fn assert_connectivity(
    ctx: &BotContext,
    exchange: &dyn ExchangeCapability,
    reporter: &HealthReporter,
) -> Result<()> {
    info!(symbol = %ctx.market_symbol, "connectivity check: ticker");
    if let Err(err) = exchange.fetch_ticker(&ctx.market_symbol).await {
        maybe_record_rate_limit(reporter, &err);
        return Err(err.context(format!(
            "Could not fetch ticker for {}. Verify the symbol is correct and supported.",
            ctx.market_symbol
        )));
    }

    info!(
        symbol = %ctx.market_symbol,
        timeframe = %ctx.execution_config.timeframe,
        "connectivity check: market data"
    );
    if let Err(err) = exchange
        .fetch_ohlcv(&ctx.market_symbol, &ctx.execution_config.timeframe, 5)
        .await
    {
        maybe_record_rate_limit(reporter, &err);
        return Err(err.context(format!(
            "Could not fetch market data for {} on timeframe {}.",
            ctx.market_symbol, ctx.execution_config.timeframe
        )));
    }

    info!(quote = %ctx.quote_currency(), "connectivity check: balance");
    if let Err(err) = exchange.fetch_balance().await {
        maybe_record_rate_limit(reporter, &err);
        return Err(err.context(
            "Could not fetch account balance. Verify API key permissions (trading/reading balances).",
        ));
    }

    Ok(())
}

fn maybe_record_rate_limit(reporter: &HealthReporter, err: &anyhow::Error) {
    if is_rate_limit_text(&format!("{err:#}")) {
        reporter.record_rate_limit_hit();
    }
}

// -----------------------------------------------------------------------------
// Startup failure reporting
// -----------------------------------------------------------------------------

async fn report_startup_failure(db: &dyn PersistenceContract, bot_id: &str, err: &anyhow::Error) {
    let friendly = "Startup failed: could not establish connectivity with exchange. \
                    Review your API keys and market settings.";
    error!(error = %format!("{err:#}"), "{friendly}");
    monitoring::ship_error(bot_id, &format!("{err:#}"));

    let event = json!({ "event_type": "error", "message": friendly });
    if let Err(write_err) = db.notify(bot_id, "events", event).await {
        warn!(error = %write_err, "failed to write startup failure event");
    }
    let notification = json!({
        "event_key": "startup_failed",
        "title": "Bot failed to start",
        "body": format!("{err:#}"),
        "severity": "critical",
    });
    if let Err(write_err) = db.notify(bot_id, "notifications", notification).await {
        warn!(error = %write_err, "failed to queue startup failure notification");
    }
    let email = json!({
        "event_key": "startup_failed",
        "email_template": "bot_startup_failure",
        "support_email": std::env::var("SUPPORT_EMAIL").ok(),
        "payload": { "message": friendly, "error": format!("{err:#}") },
    });
    if let Err(write_err) = db.notify(bot_id, "email", email).await {
        warn!(error = %write_err, "failed to queue startup failure email");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn context_row() -> Value {
        json!({
            "id": "bot-1",
            "user_id": "user-1",
            "name": "alpha",
            "strategy_key": "trend",
            "mode": "live",
            "dry_run": false,
            "subscription_status": "active",
            "exchange_ccxt_id": "binanceusdm",
            "market_symbol": "BTC/USDT",
            "api_key_encrypted": "enc-key",
            "api_secret_encrypted": "enc-secret",
            "strategy_definition": {
                "defaults": { "risk": { "leverage": 2.0 }, "execution": { "timeframe": "4h" } }
            },
            "user_overrides": { "risk": { "leverage": 99.0 } },
            "execution_config": { "poll_interval": 120 },
        })
    }

    #[test]
    fn parse_context_resolves_and_clamps() {
        let ctx = parse_context(&context_row()).unwrap();
        assert_eq!(ctx.id, "bot-1");
        assert_eq!(ctx.strategy_key, "trend");
        assert_eq!(ctx.mode, TradeMode::Live);
        assert_eq!(ctx.execution_config.timeframe, "4h");
        assert_eq!(ctx.execution_config.poll_interval, 120);
        // User override of 99x leverage is clamped to the hard maximum.
        assert_eq!(ctx.risk_config.leverage, crate::config::MAX_LEVERAGE);
    }

    #[test]
    fn dry_run_coerces_mode_to_paper() {
        let mut row = context_row();
        row["dry_run"] = json!(true);
        let ctx = parse_context(&row).unwrap();
        assert_eq!(ctx.mode, TradeMode::Paper);
        assert!(ctx.is_dry_run());
    }

    #[test]
    fn parse_context_requires_identity_fields() {
        let mut row = context_row();
        row.as_object_mut().unwrap().remove("market_symbol");
        assert!(parse_context(&row).is_err());
    }

    #[test]
    fn hydrate_state_from_open_row() {
        let state = hydrate_state(Some(json!({
            "id": "pos-7",
            "direction": "long",
            "entry_price": 100.0,
            "entry_time": "2024-03-01T00:00:00+00:00",
            "qty": 0.5,
        })));
        assert!(state.in_position);
        assert_eq!(state.position_id, "pos-7");
        assert_eq!(state.direction, Some(Direction::Long));
        assert_eq!(state.qty, 0.5);
        assert_eq!(state.base_notional, 50.0);
        assert!(state.entry_time.is_some());
    }

    #[test]
    fn hydrate_state_rejects_incomplete_rows() {
        let state = hydrate_state(Some(json!({ "id": "pos-7", "qty": 0.5 })));
        assert!(!state.in_position);
        assert!(hydrate_state(None).in_position == false);
    }
}

fn required_str(row: &Value, field: &str) -> Result<String> {
    str_or(row, field).with_context(|| format!("context row missing {field}"))
}

fn str_or(row: &Value, field: &str) -> Option<String> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}
