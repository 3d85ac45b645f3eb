// =============================================================================
// Position manager — manage-open and try-open entry points
// =============================================================================
//
// Both entry points run only on the loop task; background readers observe the
// state through the published snapshot handle. One decision per closed bar:
// `try_open_position` refuses to re-evaluate a candle it has already seen.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{looks_like_stream_error, ReasonCode};
use crate::exchange::ExchangeCapability;
use crate::frame::Frame;
use crate::health::HealthReporter;
use crate::persistence::PersistenceContract;
use crate::state::{week_key, PositionState, StateHandle};
use crate::strategy::Strategy;
use crate::timeframes::timeframe_to_seconds;
use crate::trading::exits::atr_exit_reason;
use crate::trading::journal;
use crate::trading::orders::send_order;
use crate::trading::pyramiding::{maybe_pyramid, pyramid_add_notional};
use crate::trading::sizing::{compute_notional, compute_qty};
use crate::types::{BotContext, Direction};

pub struct PositionManager {
    exchange: Arc<dyn ExchangeCapability>,
    db: Arc<dyn PersistenceContract>,
    reporter: Arc<HealthReporter>,
    state: PositionState,
    handle: StateHandle,
}

impl PositionManager {
    pub fn new(
        exchange: Arc<dyn ExchangeCapability>,
        db: Arc<dyn PersistenceContract>,
        reporter: Arc<HealthReporter>,
        state: PositionState,
    ) -> Self {
        let handle = StateHandle::default();
        handle.publish(&state);
        reporter.set_in_position(state.in_position);
        Self {
            exchange,
            db,
            reporter,
            state,
            handle,
        }
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    /// Snapshot handle for background readers.
    pub fn handle(&self) -> StateHandle {
        self.handle.clone()
    }

    fn publish(&self) {
        self.handle.publish(&self.state);
    }

    // -------------------------------------------------------------------------
    // Manage an open position
    // -------------------------------------------------------------------------

    pub async fn manage_open_position(
        &mut self,
        ctx: &BotContext,
        strategy: &dyn Strategy,
    ) -> Result<()> {
        if !self.state.in_position {
            return Ok(());
        }
        let direction = self
            .state
            .direction
            .context("in position without a direction")?;

        let price = match self.exchange.fetch_ticker(&ctx.market_symbol).await {
            Ok(ticker) => ticker.price(),
            Err(err) => {
                self.maybe_record_stream_disconnect(&err).await;
                return Err(err);
            }
        };

        let frame = self.fetch_prepared_frame(ctx, strategy).await?;
        let row = frame.last_row().context("indicator frame is empty")?;
        let atr = row.get_or("atr", 0.0);
        let expected_price = row.get_or("close", price);

        // Unrealized PnL and gauge tracking.
        let unreal = (price - self.state.entry_price) * self.state.qty * direction.sign();
        self.state.max_unrealized_pnl = self.state.max_unrealized_pnl.max(unreal);
        self.state.min_unrealized_pnl = self.state.min_unrealized_pnl.min(unreal);
        self.state.last_price = price;
        self.state.unrealized_pnl = unreal;
        self.state.atr = atr;
        self.update_exit_gauges(ctx, direction, price, atr, unreal).await;

        if let Some(reason) = atr_exit_reason(&mut self.state, price, atr, &ctx.strategy_config) {
            let realized = (price - self.state.entry_price) * self.state.qty * direction.sign();
            info!(
                reason = %reason,
                price,
                realized_pnl = realized,
                "exit signal on open position"
            );

            let submission = send_order(
                ctx,
                self.exchange.as_ref(),
                &self.reporter,
                direction.close_side(),
                self.state.qty,
                expected_price,
                Some("exit"),
                true,
            )
            .await?
            .context("exit order submission skipped")?;

            let exit_time = Utc::now();
            journal::on_exit(
                self.db.as_ref(),
                &self.reporter,
                ctx,
                &self.state.position_id,
                direction,
                price,
                exit_time,
                self.state.qty,
                realized,
                reason.as_str(),
                submission.order.as_ref().and_then(|o| o.id.as_deref()),
                &submission.client_order_id,
                submission.order.as_ref(),
            )
            .await?;

            self.state.reset_after_exit(exit_time, realized);
            journal::persist_state(self.db.as_ref(), &self.reporter, ctx, &self.state).await?;
            self.reporter.set_in_position(false);
            self.publish();
            return Ok(());
        }

        self.maybe_pyramid_in(ctx, direction, price, expected_price).await?;

        self.state.last_manage_time = Some(Utc::now());
        journal::persist_state(self.db.as_ref(), &self.reporter, ctx, &self.state).await?;
        self.publish();
        Ok(())
    }

    /// Stop / take-profit / trailing gauges cached for observers.
    async fn update_exit_gauges(
        &mut self,
        ctx: &BotContext,
        direction: Direction,
        price: f64,
        atr: f64,
        unreal: f64,
    ) {
        if atr <= 0.0 {
            return;
        }
        let cfg = &ctx.strategy_config;
        let sl = cfg.sl_atr_mult * atr;
        let tp = cfg.tp_atr_mult * atr;

        match direction {
            Direction::Long => {
                self.state.stop_price = self.state.entry_price - sl;
                self.state.take_profit_price = self.state.entry_price + tp;
                self.state.peak_price = self.state.peak_price.max(price);
            }
            Direction::Short => {
                self.state.stop_price = self.state.entry_price + sl;
                self.state.take_profit_price = self.state.entry_price - tp;
                self.state.low_price = self.state.low_price.min(price);
            }
        }

        if !self.state.trailing_active && unreal >= cfg.trail_start_r * sl * self.state.qty {
            self.state.trailing_active = true;
        }
        if self.state.trailing_active {
            let trail = cfg.trail_atr_mult * atr;
            let new_stop = match direction {
                Direction::Long => self.state.peak_price - trail,
                Direction::Short => self.state.low_price + trail,
            };
            if (new_stop - self.state.trailing_stop_price).abs() > f64::EPSILON {
                self.state.trailing_stop_price = new_stop;
                self.reporter.record_trailing_update().await;
            }
        }
    }

    async fn maybe_pyramid_in(
        &mut self,
        ctx: &BotContext,
        direction: Direction,
        price: f64,
        expected_price: f64,
    ) -> Result<()> {
        if self.state.entry_price <= 0.0 {
            return Ok(());
        }
        let move_frac = match direction {
            Direction::Long => (price - self.state.entry_price) / self.state.entry_price,
            Direction::Short => (self.state.entry_price - price) / self.state.entry_price,
        };

        while maybe_pyramid(&ctx.strategy_config, move_frac, self.state.added_levels) {
            let add_notional = pyramid_add_notional(self.state.base_notional, &ctx.strategy_config);
            let add_qty = compute_qty(add_notional, price);

            let Some(submission) = send_order(
                ctx,
                self.exchange.as_ref(),
                &self.reporter,
                direction.open_side(),
                add_qty,
                expected_price,
                Some("add"),
                false,
            )
            .await?
            else {
                break;
            };

            self.state.qty += add_qty;
            self.state.added_levels += 1;

            journal::on_pyramid(
                self.db.as_ref(),
                ctx,
                &self.state.position_id,
                direction,
                price,
                add_qty,
                submission.order.as_ref().and_then(|o| o.id.as_deref()),
                &submission.client_order_id,
                Utc::now(),
            )
            .await?;
            journal::write_event(
                self.db.as_ref(),
                &self.reporter,
                ctx,
                "trade",
                &format!(
                    "PYRAMID {direction} level={} add_qty={add_qty:.6}",
                    self.state.added_levels
                ),
            )
            .await;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Try to open a position
    // -------------------------------------------------------------------------

    pub async fn try_open_position(
        &mut self,
        ctx: &BotContext,
        strategy: &dyn Strategy,
    ) -> Result<()> {
        if self.state.in_position {
            return Ok(());
        }

        let frame = self.fetch_prepared_frame(ctx, strategy).await?;
        let min_bars = ctx.strategy_config.min_bars as usize;
        if frame.len() < min_bars {
            debug!(bars = frame.len(), min_bars, "skip entry: not enough bars");
            return Ok(());
        }

        let last_ts = frame.last_ts().context("indicator frame is empty")?;
        let row = frame.last_row().context("indicator frame is empty")?;
        self.record_candle_metrics(ctx, last_ts).await;

        // One decision per closed bar.
        if self.state.last_candle_time == Some(last_ts) {
            debug!(candle = %last_ts, "skip entry: candle already processed");
            return Ok(());
        }
        self.state.last_candle_time = Some(last_ts);

        let week = week_key(last_ts);
        if self.state.week_trades(&week) >= ctx.risk_config.max_trades_per_week {
            debug!(week = %week, "skip entry: weekly trade cap reached");
            self.persist_and_publish(ctx).await?;
            return Ok(());
        }

        let long_ok = self.eval_signal(strategy.long_signal(&row, &ctx.strategy_config)).await?;
        let short_ok = self.eval_signal(strategy.short_signal(&row, &ctx.strategy_config)).await?;
        self.reporter.record_decision();
        self.reporter.record_strategy_tick_ok();
        if !long_ok && !short_ok {
            debug!(close = row.get_or("close", 0.0), "skip entry: no signal");
            self.persist_and_publish(ctx).await?;
            return Ok(());
        }

        let expected_price = row.get_or("close", 0.0);
        let price = expected_price;

        let balance = match self.exchange.fetch_balance().await {
            Ok(balances) => crate::exchange::quote_balance(&balances, ctx.quote_currency()),
            Err(err) => {
                self.maybe_record_stream_disconnect(&err).await;
                return Err(err);
            }
        };
        let notional = compute_notional(
            balance,
            ctx.risk_config.allocation_frac,
            ctx.risk_config.leverage,
        );
        if notional < ctx.risk_config.min_notional_usd {
            debug!(
                notional,
                min_notional = ctx.risk_config.min_notional_usd,
                "skip entry: notional too small"
            );
            self.persist_and_publish(ctx).await?;
            return Ok(());
        }

        let qty = compute_qty(notional, price);
        let direction = if long_ok { Direction::Long } else { Direction::Short };

        let Some(submission) = send_order(
            ctx,
            self.exchange.as_ref(),
            &self.reporter,
            direction.open_side(),
            qty,
            expected_price,
            None,
            false,
        )
        .await?
        else {
            return Ok(());
        };

        self.state.in_position = true;
        self.state.direction = Some(direction);
        self.state.entry_price = price;
        self.state.entry_time = Some(last_ts);
        self.state.qty = qty;
        self.state.base_notional = notional;
        self.state.peak_price = price;
        self.state.low_price = price;
        self.state.added_levels = 0;
        self.state.max_unrealized_pnl = 0.0;
        self.state.min_unrealized_pnl = 0.0;
        self.state.trailing_active = false;
        self.state.trailing_stop_price = 0.0;
        *self.state.week_trade_counts.entry(week).or_insert(0) += 1;

        let position_id = journal::on_entry(
            self.db.as_ref(),
            &self.reporter,
            ctx,
            direction,
            price,
            last_ts,
            qty,
            submission.order.as_ref().and_then(|o| o.id.as_deref()),
            &submission.client_order_id,
            submission.order.as_ref(),
        )
        .await?;
        self.state.position_id = position_id;

        journal::write_event(
            self.db.as_ref(),
            &self.reporter,
            ctx,
            "trade",
            &format!("ENTRY {direction} price={price:.6} qty={qty:.6} notional={notional:.2}"),
        )
        .await;

        self.state.last_manage_time = Some(Utc::now());
        journal::persist_state(self.db.as_ref(), &self.reporter, ctx, &self.state).await?;
        self.reporter.set_in_position(true);
        self.publish();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Shared helpers
    // -------------------------------------------------------------------------

    async fn fetch_prepared_frame(
        &self,
        ctx: &BotContext,
        strategy: &dyn Strategy,
    ) -> Result<Frame> {
        let candles = match self
            .exchange
            .fetch_ohlcv(
                &ctx.market_symbol,
                &ctx.execution_config.timeframe,
                ctx.execution_config.lookback_bars,
            )
            .await
        {
            Ok(candles) => candles,
            Err(err) => {
                self.maybe_record_stream_disconnect(&err).await;
                return Err(err);
            }
        };

        match strategy.prepare(Frame::from_candles(&candles), &ctx.strategy_config) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.reporter
                    .record_indicator_error(ReasonCode::classify_error(&err).as_str())
                    .await;
                self.reporter.record_strategy_tick_fail();
                Err(err)
            }
        }
    }

    async fn eval_signal(&self, result: Result<bool>) -> Result<bool> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.reporter
                    .record_indicator_error(ReasonCode::classify_error(&err).as_str())
                    .await;
                self.reporter.record_strategy_tick_fail();
                Err(err)
            }
        }
    }

    async fn record_candle_metrics(&self, ctx: &BotContext, last_ts: chrono::DateTime<Utc>) {
        let lag = (Utc::now() - last_ts).num_seconds().max(0);
        self.reporter.record_candle_lag(lag);

        if let Some(prev) = self.state.last_candle_time {
            let tf_secs = timeframe_to_seconds(&ctx.execution_config.timeframe);
            let gap_secs = (last_ts - prev).num_seconds() as f64;
            if gap_secs > tf_secs * 1.5 {
                self.reporter.record_candle_gap().await;
            }
        }
    }

    async fn persist_and_publish(&mut self, ctx: &BotContext) -> Result<()> {
        journal::persist_state(self.db.as_ref(), &self.reporter, ctx, &self.state).await?;
        self.publish();
        Ok(())
    }

    async fn maybe_record_stream_disconnect(&self, err: &anyhow::Error) {
        if looks_like_stream_error(&format!("{err:#}")) {
            self.reporter.record_stream_disconnect().await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollingTier;
    use crate::testutil::{
        candles_from_closes, test_context, FakeSink, MockExchange, MockPersistence, StubStrategy,
    };
    use serde_json::json;

    struct Rig {
        manager: PositionManager,
        exchange: Arc<MockExchange>,
        db: Arc<MockPersistence>,
    }

    fn rig(ticker: f64, closes: &[f64], state: PositionState) -> Rig {
        let exchange = Arc::new(MockExchange::new(ticker));
        exchange.set_candles(candles_from_closes(closes, 3600));
        exchange.set_balance("USDT", 100.0, 100.0);
        let db = Arc::new(MockPersistence::default());
        let reporter = Arc::new(HealthReporter::new(
            "bot-1",
            Arc::new(FakeSink::default()),
            PollingTier::Standard,
        ));
        let manager = PositionManager::new(exchange.clone(), db.clone(), reporter, state);
        Rig {
            manager,
            exchange,
            db,
        }
    }

    fn entry_ctx() -> BotContext {
        let mut ctx = test_context();
        ctx.strategy_config = serde_json::from_value(json!({ "min_bars": 3 })).unwrap();
        ctx.risk_config = serde_json::from_value(json!({
            "allocation_frac": 0.5,
            "leverage": 1.0,
            "min_notional_usd": 10.0,
            "max_trades_per_week": 5,
        }))
        .unwrap();
        ctx.execution_config.max_slippage_bps = 50;
        ctx
    }

    #[tokio::test(start_paused = true)]
    async fn entry_on_new_bar_opens_long() {
        let mut rig = rig(102.0, &[100.0, 101.0, 102.0], PositionState::default());
        let ctx = entry_ctx();
        let strategy = StubStrategy::long_only(2.0);

        rig.manager.try_open_position(&ctx, &strategy).await.unwrap();

        let state = rig.manager.state();
        assert!(state.in_position);
        assert_eq!(state.direction, Some(Direction::Long));
        assert_eq!(state.entry_price, 102.0);
        // notional = 100 * 0.5 * 1 = 50; qty = 50 / 102.
        assert!((state.base_notional - 50.0).abs() < 1e-9);
        assert!((state.qty - 50.0 / 102.0).abs() < 1e-9);
        assert_eq!(state.position_id, "pos-1");
        let week = week_key(state.entry_time.unwrap());
        assert_eq!(state.week_trades(&week), 1);

        // Journal wrote the open position row and the entry trade.
        assert_eq!(rig.db.position_upserts().len(), 1);
        assert_eq!(rig.db.trade_upserts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_decision_per_bar() {
        let mut rig = rig(102.0, &[100.0, 101.0, 102.0], PositionState::default());
        let mut ctx = entry_ctx();
        // Signal off: the first tick consumes the bar without entering.
        let quiet = StubStrategy::no_signal(2.0);
        rig.manager.try_open_position(&ctx, &quiet).await.unwrap();
        assert!(!rig.manager.state().in_position);

        // Same bar, signal now on: still no entry — the bar was decided.
        ctx.strategy_config.extra.insert("unused".into(), json!(1));
        let eager = StubStrategy::long_only(2.0);
        rig.manager.try_open_position(&ctx, &eager).await.unwrap();
        assert!(!rig.manager.state().in_position);
        assert!(rig.db.position_upserts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn weekly_cap_blocks_entries() {
        let mut state = PositionState::default();
        let closes = [100.0, 101.0, 102.0];
        // Pre-load the cap for the week the last candle falls into.
        let candles = candles_from_closes(&closes, 3600);
        let week = week_key(candles.last().unwrap().ts);
        state.week_trade_counts.insert(week.clone(), 5);

        let mut rig = rig(102.0, &closes, state);
        let ctx = entry_ctx();
        let strategy = StubStrategy::long_only(2.0);

        rig.manager.try_open_position(&ctx, &strategy).await.unwrap();
        assert!(!rig.manager.state().in_position);
        assert_eq!(rig.manager.state().week_trades(&week), 5);
        assert!(rig.db.position_upserts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notional_below_minimum_skips_entry() {
        let mut rig = rig(102.0, &[100.0, 101.0, 102.0], PositionState::default());
        rig.exchange.set_balance("USDT", 10.0, 10.0); // notional = 5 < 10
        let ctx = entry_ctx();
        let strategy = StubStrategy::long_only(2.0);

        rig.manager.try_open_position(&ctx, &strategy).await.unwrap();
        assert!(!rig.manager.state().in_position);
    }

    #[tokio::test(start_paused = true)]
    async fn short_signal_opens_short() {
        let mut rig = rig(102.0, &[100.0, 101.0, 102.0], PositionState::default());
        let ctx = entry_ctx();
        let strategy = StubStrategy::short_only(2.0);

        rig.manager.try_open_position(&ctx, &strategy).await.unwrap();
        assert_eq!(rig.manager.state().direction, Some(Direction::Short));
    }

    #[tokio::test(start_paused = true)]
    async fn try_open_noops_while_in_position() {
        let mut rig = rig(102.0, &[100.0, 101.0, 102.0], open_long_state(100.0, 1.0));
        let ctx = entry_ctx();
        let strategy = StubStrategy::long_only(2.0);

        rig.manager.try_open_position(&ctx, &strategy).await.unwrap();
        assert!(rig.exchange.created_orders().is_empty());
        assert!(rig.db.position_upserts().is_empty());
        assert_eq!(rig.manager.state().qty, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn manage_noops_when_flat() {
        let mut rig = rig(102.0, &[100.0, 101.0, 102.0], PositionState::default());
        let ctx = entry_ctx();
        let strategy = StubStrategy::long_only(2.0);

        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();
        assert!(rig.exchange.created_orders().is_empty());
        assert!(rig.db.heartbeats().is_empty());
    }

    fn open_long_state(entry: f64, qty: f64) -> PositionState {
        PositionState {
            in_position: true,
            position_id: "pos-1".to_string(),
            direction: Some(Direction::Long),
            entry_price: entry,
            entry_time: Some(Utc::now()),
            qty,
            base_notional: entry * qty,
            peak_price: entry,
            low_price: entry,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_loss_exit_resets_state_and_journals() {
        // entry=100, atr=2, sl_mult=1.5 -> stop at 97; ticker 96 stops out.
        let mut state = open_long_state(100.0, 1.0);
        state.week_trade_counts.insert("2024-10".to_string(), 2);
        let mut rig = rig(96.0, &[100.0, 99.0, 96.0], state);
        let mut ctx = entry_ctx();
        ctx.strategy_config.sl_atr_mult = 1.5;
        let strategy = StubStrategy::no_signal(2.0);

        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();

        let state = rig.manager.state();
        assert!(!state.in_position);
        assert_eq!(state.qty, 0.0);
        assert_eq!(state.direction, None);
        assert_eq!(state.week_trades("2024-10"), 2);
        assert!((state.cumulative_pnl - (-4.0)).abs() < 1e-9);
        assert!(state.last_exit_time.is_some());

        let positions = rig.db.position_upserts();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0]["status"], "closed");
        assert_eq!(positions[0]["close_reason"], "SL_ATR");
        assert!((positions[0]["realized_pnl"].as_f64().unwrap() - (-4.0)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn pyramiding_adds_levels_under_favorable_drift() {
        let mut ctx = entry_ctx();
        ctx.strategy_config = serde_json::from_value(json!({
            "min_bars": 3,
            "pyramiding_enabled": true,
            "max_pyramid_levels": 2,
            "pyramid_step": 0.02,
            "pyramid_add_frac": 0.5,
            "tp_atr_mult": 100.0,
            "trail_start_r": 100.0,
        }))
        .unwrap();
        let strategy = StubStrategy::no_signal(2.0);

        // Price 103: move 0.03 covers level 1 only.
        let mut rig = rig(103.0, &[100.0, 102.0, 103.0], open_long_state(100.0, 1.0));
        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();
        {
            let state = rig.manager.state();
            assert_eq!(state.added_levels, 1);
            assert!((state.qty - (1.0 + 50.0 / 103.0)).abs() < 1e-9);
        }

        // Price 105: move 0.05 covers level 2; the cap stops level 3 even at
        // move 0.06 later.
        rig.exchange.set_ticker(105.0);
        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();
        assert_eq!(rig.manager.state().added_levels, 2);

        rig.exchange.set_ticker(106.0);
        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();
        assert_eq!(rig.manager.state().added_levels, 2);

        // One scale-in trade row per level.
        assert_eq!(rig.db.trade_upserts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_exit_after_activation() {
        // S4: entry 100, atr=2, activation at +3, trail 2 from the peak.
        let mut ctx = entry_ctx();
        ctx.strategy_config = serde_json::from_value(json!({
            "min_bars": 3,
            "sl_atr_mult": 1.5,
            "tp_atr_mult": 100.0,
            "trail_atr_mult": 1.0,
            "trail_start_r": 1.0,
        }))
        .unwrap();
        let strategy = StubStrategy::no_signal(2.0);
        let mut rig = rig(101.0, &[100.0, 100.5, 101.0], open_long_state(100.0, 1.0));

        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();
        assert!(rig.manager.state().in_position);
        assert!(!rig.manager.state().trailing_active);

        rig.exchange.set_ticker(104.0);
        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();
        assert!(rig.manager.state().trailing_active);
        assert_eq!(rig.manager.state().peak_price, 104.0);
        assert!((rig.manager.state().trailing_stop_price - 102.0).abs() < 1e-9);

        rig.exchange.set_ticker(102.5);
        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();
        assert!(rig.manager.state().in_position, "trail at 102 must hold at 102.5");

        rig.exchange.set_ticker(101.9);
        rig.manager.manage_open_position(&ctx, &strategy).await.unwrap();
        assert!(!rig.manager.state().in_position, "101.9 <= 102 fires the trail");

        let positions = rig.db.position_upserts();
        assert_eq!(positions.last().unwrap()["close_reason"], "TRAIL_ATR");
    }
}
