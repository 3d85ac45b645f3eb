// =============================================================================
// Main trading loop — bounded state machine over warmup, entry, management
// =============================================================================
//
// One tick: exchange sync if due, control refresh if due, pause evaluation,
// the state-specific action, heartbeat, then a jittered drift-free sleep.
// Errors inside the tick count toward a consecutive-error budget; exchange
// sync failures are fatal immediately.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{
    normalize_configs, PollingTier, CONTROL_REFRESH_POLLS, CONTROL_REFRESH_SECONDS,
    ERROR_BACKOFF_SECONDS, MAX_CONSECUTIVE_ERRORS,
};
use crate::error::{is_rate_limit_text, SyncError};
use crate::health::HealthReporter;
use crate::healthcheck;
use crate::persistence::PersistenceContract;
use crate::scheduler::JitterScheduler;
use crate::strategy::Strategy;
use crate::sync::ExchangeSyncService;
use crate::trading::{journal, PositionManager};
use crate::types::BotContext;
use crate::runtime::gates::pause_reason;

/// Loop states. `Halt` is terminal; `Cooldown` is a single-tick skip between
/// an exit and the next entry search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Init,
    Idle,
    WaitingForEntry,
    InPosition,
    Cooldown,
    Halt,
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Idle => "idle",
            Self::WaitingForEntry => "waiting_for_entry",
            Self::InPosition => "in_position",
            Self::Cooldown => "cooldown",
            Self::Halt => "halt",
        };
        f.write_str(name)
    }
}

/// Why the loop returned. All of these are clean stops for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    TooManyErrors,
    SubscriptionInactive,
    SyncFatal,
}

enum TickOutcome {
    Continue,
    Exit(LoopExit),
}

pub struct TradingLoop {
    db: Arc<dyn PersistenceContract>,
    reporter: Arc<HealthReporter>,
    manager: PositionManager,
    sync: ExchangeSyncService,
    strategy: Box<dyn Strategy>,
    tier: PollingTier,
    hc_ping_url: Option<String>,

    state: BotState,
    consec_errors: u32,
    ticks_since_refresh: u32,
    last_refresh_at: Option<Instant>,
}

impl TradingLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn PersistenceContract>,
        reporter: Arc<HealthReporter>,
        manager: PositionManager,
        sync: ExchangeSyncService,
        strategy: Box<dyn Strategy>,
        tier: PollingTier,
        hc_ping_url: Option<String>,
    ) -> Self {
        Self {
            db,
            reporter,
            manager,
            sync,
            strategy,
            tier,
            hc_ping_url,
            state: BotState::Init,
            consec_errors: 0,
            ticks_since_refresh: 0,
            last_refresh_at: None,
        }
    }

    pub fn manager(&self) -> &PositionManager {
        &self.manager
    }

    pub async fn run(&mut self, ctx: &mut BotContext) -> Result<LoopExit> {
        let poll = ctx.execution_config.poll_interval;
        let mut scheduler =
            JitterScheduler::new(poll, 10, Some(self.tier.min_poll_seconds()));
        scheduler.startup_stagger().await;

        info!(
            bot = %ctx.name,
            strategy = self.strategy.name(),
            symbol = %ctx.market_symbol,
            timeframe = %ctx.execution_config.timeframe,
            poll,
            "entering trading loop"
        );

        let mut last_state: Option<BotState> = None;
        loop {
            let started_at = Instant::now();

            match self.tick(ctx).await {
                Ok(TickOutcome::Exit(exit)) => return Ok(exit),
                Ok(TickOutcome::Continue) => {
                    self.consec_errors = 0;
                }
                Err(err) => {
                    if err.downcast_ref::<SyncError>().is_some() {
                        error!(error = %err, "exchange sync failure; halting");
                        journal::write_event(
                            self.db.as_ref(),
                            &self.reporter,
                            ctx,
                            "stopped",
                            &format!("exchange sync failure: {err:#}"),
                        )
                        .await;
                        self.reporter.flush_now("loop_error").await;
                        healthcheck::fail_ping(self.hc_ping_url.as_deref(), &format!("{err:#}"))
                            .await;
                        self.state = BotState::Halt;
                        return Ok(LoopExit::SyncFatal);
                    }
                    if let Some(exit) = self.handle_tick_error(ctx, err).await {
                        return Ok(exit);
                    }
                    tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_SECONDS)).await;
                }
            }

            if last_state != Some(self.state) {
                info!(
                    from = %last_state.map(|s| s.to_string()).unwrap_or_else(|| "none".into()),
                    to = %self.state,
                    "state transition"
                );
                last_state = Some(self.state);
            }

            // Hot-reload cadence: the refreshed execution config feeds the
            // scheduler every cycle.
            let poll = ctx.execution_config.poll_interval;
            let interval = scheduler.next_interval(
                Some(poll),
                None,
                Some(self.tier.min_poll_seconds()),
            );
            debug!(state = %self.state, interval, base = poll, "tick finished");
            scheduler.sleep_for(interval, started_at).await;
        }
    }

    // -------------------------------------------------------------------------
    // One tick
    // -------------------------------------------------------------------------

    async fn tick(&mut self, ctx: &mut BotContext) -> Result<TickOutcome> {
        self.ticks_since_refresh += 1;

        // Drift detection runs before any trading decision.
        self.sync.maybe_sync().await?;

        if self.control_refresh_due() {
            if self.refresh_controls(ctx).await && !ctx.subscription_active() {
                journal::write_event(
                    self.db.as_ref(),
                    &self.reporter,
                    ctx,
                    "stopped_payment",
                    "subscription no longer active",
                )
                .await;
                warn!("subscription lapsed; exiting");
                self.state = BotState::Halt;
                return Ok(TickOutcome::Exit(LoopExit::SubscriptionInactive));
            }
        }

        // Pause evaluation.
        let pause = pause_reason(ctx);
        if let Some(reason) = pause {
            if self.state != BotState::Idle {
                journal::write_event(self.db.as_ref(), &self.reporter, ctx, "paused", reason)
                    .await;
                warn!(reason, "entering idle");
            }
            self.state = BotState::Idle;
        }

        match self.state {
            BotState::Halt => {
                error!("halting loop");
                return Ok(TickOutcome::Exit(LoopExit::TooManyErrors));
            }
            BotState::Init => {
                journal::write_event(
                    self.db.as_ref(),
                    &self.reporter,
                    ctx,
                    "started",
                    &format!(
                        "strategy={} tf={}",
                        self.strategy.name(),
                        ctx.execution_config.timeframe
                    ),
                )
                .await;
                self.state = if pause.is_some() {
                    BotState::Idle
                } else {
                    self.position_state()
                };
            }
            BotState::Idle => {
                if self.manager.state().in_position {
                    debug!("idle: managing open position only");
                    self.manager
                        .manage_open_position(ctx, self.strategy.as_ref())
                        .await?;
                }
                if pause.is_none() {
                    self.state = self.position_state();
                }
            }
            BotState::WaitingForEntry => {
                debug!("waiting for entry: evaluating entries on new candles only");
                self.manager
                    .try_open_position(ctx, self.strategy.as_ref())
                    .await?;
                if self.manager.state().in_position {
                    self.state = BotState::InPosition;
                }
            }
            BotState::InPosition => {
                debug!("in position: managing exits");
                self.manager
                    .manage_open_position(ctx, self.strategy.as_ref())
                    .await?;
                if !self.manager.state().in_position {
                    self.state = BotState::Cooldown;
                }
            }
            BotState::Cooldown => {
                debug!("cooldown: waiting one tick before re-entry");
                self.state = BotState::WaitingForEntry;
            }
        }

        journal::persist_state(self.db.as_ref(), &self.reporter, ctx, self.manager.state())
            .await?;
        healthcheck::ping(self.hc_ping_url.as_deref()).await;

        Ok(TickOutcome::Continue)
    }

    fn position_state(&self) -> BotState {
        if self.manager.state().in_position {
            BotState::InPosition
        } else {
            BotState::WaitingForEntry
        }
    }

    fn control_refresh_due(&self) -> bool {
        match self.last_refresh_at {
            None => true,
            Some(at) => {
                at.elapsed() >= Duration::from_secs(CONTROL_REFRESH_SECONDS)
                    || self.ticks_since_refresh >= CONTROL_REFRESH_POLLS
            }
        }
    }

    /// Pull fresh control and execution config; re-normalize so clamps hold
    /// over hot reloads. Returns whether the refresh succeeded.
    async fn refresh_controls(&mut self, ctx: &mut BotContext) -> bool {
        self.last_refresh_at = Some(Instant::now());
        self.ticks_since_refresh = 0;

        let refresh = match self.db.refresh_controls(&ctx.id).await {
            Ok(refresh) => refresh,
            Err(err) => {
                warn!(error = %err, "control refresh failed");
                return false;
            }
        };

        if let Some(status) = refresh.subscription_status {
            ctx.subscription_status = status;
        }

        let control = refresh
            .control_config
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| ctx.control_config.clone());
        let execution = refresh
            .execution_config
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| ctx.execution_config.clone());

        let normalized = normalize_configs(
            ctx.strategy_config.clone(),
            ctx.risk_config.clone(),
            execution,
            control,
            self.tier,
        );
        for clamp in &normalized.clamps {
            journal::write_event(self.db.as_ref(), &self.reporter, ctx, "config_clamped", clamp)
                .await;
        }

        // Tier follows the refreshed config unless the environment pins it.
        if std::env::var("POLLING_TIER").is_err() {
            if let Some(raw) = &normalized.execution.polling_tier {
                let tier = PollingTier::parse(raw);
                if tier != self.tier {
                    info!(tier = %tier, "polling tier updated");
                    self.tier = tier;
                    self.reporter.set_tier(tier);
                }
            }
        }

        ctx.strategy_config = normalized.strategy;
        ctx.risk_config = normalized.risk;
        ctx.execution_config = normalized.execution;
        ctx.control_config = normalized.control;
        true
    }

    // -------------------------------------------------------------------------
    // Error path
    // -------------------------------------------------------------------------

    async fn handle_tick_error(
        &mut self,
        ctx: &mut BotContext,
        err: anyhow::Error,
    ) -> Option<LoopExit> {
        self.consec_errors += 1;
        let text = format!("{err:#}");
        error!(error = %text, consecutive = self.consec_errors, "tick failed");

        journal::write_event(self.db.as_ref(), &self.reporter, ctx, "error", &text).await;
        if is_rate_limit_text(&text) {
            self.reporter.record_rate_limit_hit();
        }
        self.reporter.flush_now("loop_error").await;
        journal::notify_user(self.db.as_ref(), ctx, "error", "Bot error", &text, "critical").await;

        if self.consec_errors >= MAX_CONSECUTIVE_ERRORS {
            journal::write_event(
                self.db.as_ref(),
                &self.reporter,
                ctx,
                "stopped",
                "Too many consecutive errors",
            )
            .await;
            journal::notify_user(
                self.db.as_ref(),
                ctx,
                "bot_stopped",
                "Bot stopped",
                "Too many consecutive errors",
                "critical",
            )
            .await;
            healthcheck::fail_ping(self.hc_ping_url.as_deref(), &text).await;
            error!("too many consecutive errors; exiting");
            self.state = BotState::Halt;
            return Some(LoopExit::TooManyErrors);
        }

        // Transient error: re-enter the position-appropriate state next tick.
        self.state = self.position_state();
        None
    }
}
