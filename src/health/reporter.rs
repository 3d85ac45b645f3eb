// =============================================================================
// Health reporter — debounced, in-position-sensitive evidence flusher
// =============================================================================
//
// Record methods are cheap: they update the pending patch and the rolling
// window under a single mutex. Critical events request an immediate flush;
// the claim protocol decides whether one actually happens:
//
//   - a flush claimed while another is scheduled in the future is declined
//     unless forced;
//   - a due scheduled flush hands its reason to the claimer (last scheduled
//     reason wins) and is cleared;
//   - forced flushes require DEBOUNCE since the last flush, otherwise they
//     defer one to max(last_flush + DEBOUNCE, now + CRITICAL_DELAY);
//   - periodic flushes require the tier's full flush interval.
//
// The RPC itself runs outside the lock. On failure the pending patch is
// retained; window counters are recomputed fresh on every snapshot and are
// never drained.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::PollingTier;
use crate::error::normalize_reason_code;

use super::config::{flush_interval, CRITICAL_DELAY, DEBOUNCE, FLUSH_LOOP_INTERVAL};
use super::window::{HealthWindow, WindowKey};
use super::HealthSink;

struct Inner {
    tier: PollingTier,
    in_position: bool,
    pending_patch: Map<String, Value>,
    last_flush_at: Option<Instant>,
    scheduled_flush_at: Option<Instant>,
    scheduled_reason: Option<String>,
}

pub struct HealthReporter {
    bot_id: String,
    sink: Arc<dyn HealthSink>,
    window: HealthWindow,
    inner: Mutex<Inner>,
}

impl HealthReporter {
    pub fn new(bot_id: impl Into<String>, sink: Arc<dyn HealthSink>, tier: PollingTier) -> Self {
        Self {
            bot_id: bot_id.into(),
            sink,
            window: HealthWindow::default(),
            inner: Mutex::new(Inner {
                tier,
                in_position: false,
                pending_patch: Map::new(),
                last_flush_at: None,
                scheduled_flush_at: None,
                scheduled_reason: None,
            }),
        }
    }

    pub fn set_tier(&self, tier: PollingTier) {
        self.inner.lock().tier = tier;
    }

    pub fn set_in_position(&self, in_position: bool) {
        self.inner.lock().in_position = in_position;
    }

    pub fn window(&self) -> &HealthWindow {
        &self.window
    }

    // -------------------------------------------------------------------------
    // Record methods
    // -------------------------------------------------------------------------

    pub fn mark_auth_ok(&self) {
        self.update_patch(vec![
            ("exchange_auth_ok", Value::Bool(true)),
            ("last_auth_ok_at", now_iso()),
        ]);
    }

    pub async fn mark_auth_fail(&self, code: &str) {
        self.update_patch(vec![
            ("exchange_auth_ok", Value::Bool(false)),
            ("last_auth_fail_at", now_iso()),
            ("last_auth_error_code", Value::String(normalize_reason_code(code))),
        ]);
        self.flush_now("auth_fail").await;
    }

    pub fn record_rate_limit_hit(&self) {
        self.window.inc(WindowKey::RateLimitHit);
    }

    pub fn record_candle_lag(&self, lag_seconds: i64) {
        self.update_patch(vec![
            ("market_data_ok", Value::Bool(true)),
            ("candle_lag_seconds", Value::from(lag_seconds.max(0))),
        ]);
    }

    pub async fn record_stream_disconnect(&self) {
        self.window.inc(WindowKey::StreamDisconnect);
        self.update_patch(vec![("market_data_ok", Value::Bool(false))]);
        if self.window.count(WindowKey::StreamDisconnect) >= 2 {
            self.flush_now("stream_disconnect").await;
        }
    }

    pub async fn record_candle_gap(&self) {
        self.window.inc(WindowKey::CandleGap);
        self.update_patch(vec![("market_data_ok", Value::Bool(false))]);
        let in_position = self.inner.lock().in_position;
        if in_position && self.window.count(WindowKey::CandleGap) >= 1 {
            self.flush_now("candle_gap").await;
        }
    }

    pub fn record_strategy_tick_ok(&self) {
        self.update_patch(vec![
            ("strategy_ok", Value::Bool(true)),
            ("last_strategy_tick_at", now_iso()),
        ]);
    }

    pub fn record_strategy_tick_fail(&self) {
        self.update_patch(vec![
            ("strategy_ok", Value::Bool(false)),
            ("last_strategy_tick_at", now_iso()),
        ]);
    }

    pub async fn record_indicator_error(&self, reason_code: &str) {
        self.window.inc(WindowKey::IndicatorError);
        self.update_patch(vec![
            ("strategy_ok", Value::Bool(false)),
            ("last_strategy_tick_at", now_iso()),
            ("last_indicator_error_code", Value::String(normalize_reason_code(reason_code))),
        ]);
        if self.window.count(WindowKey::IndicatorError) >= 3 {
            self.flush_now("indicator_error_spike").await;
        }
    }

    pub fn record_decision(&self) {
        self.window.inc(WindowKey::Decision);
    }

    pub async fn record_order_submit(&self) {
        self.update_patch(vec![
            ("order_flow_ok", Value::Bool(true)),
            ("last_order_submit_at", now_iso()),
        ]);
        self.flush_now("order_submit").await;
    }

    pub async fn record_order_ack(&self, latency_ms: i64) {
        self.update_patch(vec![
            ("order_flow_ok", Value::Bool(true)),
            ("last_order_ack_at", now_iso()),
            ("order_ack_latency_ms", Value::from(latency_ms.max(0))),
        ]);
        self.flush_now("order_ack").await;
    }

    pub async fn record_order_reject(&self, reason: &str) {
        self.window.inc(WindowKey::OrderReject);
        self.update_patch(vec![
            ("order_flow_ok", Value::Bool(false)),
            ("last_order_reject_reason", Value::String(normalize_reason_code(reason))),
            ("last_order_reject_at", now_iso()),
        ]);
        self.flush_now("order_reject").await;
    }

    pub async fn record_position_sync(&self, diff: f64) {
        let safe_diff = diff.max(0.0);
        self.update_patch(vec![
            ("position_ok", Value::Bool(safe_diff <= 0.0)),
            ("last_position_sync_at", now_iso()),
            ("position_sync_diff", Value::from(safe_diff)),
        ]);
        if safe_diff > 0.0 {
            self.flush_now("position_diff").await;
        }
    }

    pub async fn record_trailing_update(&self) {
        self.update_patch(vec![("last_trailing_update_at", now_iso())]);
        self.flush_now("trailing_update").await;
    }

    pub fn record_db_ok(&self) {
        self.update_patch(vec![
            ("db_ok", Value::Bool(true)),
            ("last_db_ok_at", now_iso()),
        ]);
    }

    pub async fn record_db_error(&self) {
        self.window.inc(WindowKey::DbError);
        self.update_patch(vec![("db_ok", Value::Bool(false))]);
        self.flush_now("db_error").await;
    }

    // -------------------------------------------------------------------------
    // Flush protocol
    // -------------------------------------------------------------------------

    /// Periodic path, driven by the background flush loop.
    pub async fn maybe_flush(&self) {
        if let Some((reason, patch)) = self.claim_flush("scheduled", false) {
            self.execute_flush(&reason, patch).await;
        }
    }

    /// Critical path. Executes immediately when the debounce allows it,
    /// otherwise defers a flush and remembers the reason (last writer wins).
    pub async fn flush_now(&self, reason: &str) {
        if let Some((reason, patch)) = self.claim_flush(reason, true) {
            self.execute_flush(&reason, patch).await;
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let after_debounce = inner
            .last_flush_at
            .map(|t| t + DEBOUNCE)
            .unwrap_or(now + CRITICAL_DELAY);
        let next_due = after_debounce.max(now + CRITICAL_DELAY);
        inner.scheduled_flush_at = Some(match inner.scheduled_flush_at {
            Some(existing) => existing.max(next_due),
            None => next_due,
        });
        inner.scheduled_reason = Some(reason.to_string());
    }

    /// Single-mutex claim: returns the reason and patch snapshot to deliver,
    /// or `None` when this call must not flush.
    fn claim_flush(&self, reason: &str, force: bool) -> Option<(String, Map<String, Value>)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let interval = flush_interval(inner.tier, inner.in_position);
        let due = inner.last_flush_at.map(|t| now.duration_since(t));

        if let Some(scheduled) = inner.scheduled_flush_at {
            if now < scheduled && !force {
                return None;
            }
        }
        let mut reason = reason.to_string();
        if let Some(scheduled) = inner.scheduled_flush_at {
            if now >= scheduled {
                if let Some(adopted) = inner.scheduled_reason.take() {
                    reason = adopted;
                }
                inner.scheduled_flush_at = None;
            }
        }

        let threshold = if force {
            DEBOUNCE
        } else {
            DEBOUNCE.max(interval)
        };
        if let Some(due) = due {
            if due < threshold {
                return None;
            }
        }

        let mut patch = inner.pending_patch.clone();
        for (field, count) in self.window.snapshot_at(now) {
            patch.insert(field.to_string(), Value::from(count));
        }
        Some((reason, patch))
    }

    /// RPC runs outside the lock; commit happens after.
    async fn execute_flush(&self, reason: &str, patch: Map<String, Value>) {
        let keys = patch.len();
        let (success, elapsed_ms) = self
            .sink
            .upsert_bot_health_evidence(&self.bot_id, Value::Object(patch))
            .await;

        let mut inner = self.inner.lock();
        info!(
            bot_id = %self.bot_id,
            tier = %inner.tier,
            in_position = inner.in_position,
            reason,
            keys,
            rpc_ms = elapsed_ms as u64,
            success,
            "health flush"
        );
        if success {
            inner.pending_patch.clear();
            inner.last_flush_at = Some(Instant::now());
        }
    }

    fn update_patch(&self, fields: Vec<(&'static str, Value)>) {
        let mut inner = self.inner.lock();
        for (key, value) in fields {
            if !value.is_null() {
                inner.pending_patch.insert(key.to_string(), value);
            }
        }
    }
}

fn now_iso() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

/// Background flusher driving the time-based flush path.
pub fn spawn_flush_loop(reporter: Arc<HealthReporter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(FLUSH_LOOP_INTERVAL).await;
            reporter.maybe_flush().await;
        }
    })
}

/// Background watcher recording the |local qty - exchange total| drift while
/// a position is open. `snapshot` yields `(in_position, local_qty)`.
pub fn spawn_position_sync_watcher<F>(
    reporter: Arc<HealthReporter>,
    exchange: Arc<dyn crate::exchange::ExchangeCapability>,
    base_currency: String,
    snapshot: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> (bool, f64) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let (in_position, local_qty) = snapshot();
            if !in_position {
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            match exchange.fetch_balance().await {
                Ok(balances) => {
                    let actual = balances
                        .get(&base_currency)
                        .map(|b| if b.total > 0.0 { b.total } else { b.free })
                        .unwrap_or(0.0);
                    reporter.record_position_sync((local_qty - actual).abs()).await;
                }
                Err(err) => {
                    warn!(error = %err, "position sync balance fetch failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeSink;

    fn reporter_with_sink() -> (Arc<HealthReporter>, Arc<FakeSink>) {
        let sink = Arc::new(FakeSink::default());
        let reporter = Arc::new(HealthReporter::new(
            "bot",
            sink.clone(),
            PollingTier::Standard,
        ));
        (reporter, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_flush_respects_interval() {
        let (reporter, sink) = reporter_with_sink();

        // Never flushed: first periodic flush goes through.
        reporter.maybe_flush().await;
        assert_eq!(sink.call_count(), 1);

        // Within the interval: declined.
        reporter.maybe_flush().await;
        assert_eq!(sink.call_count(), 1);
        tokio::time::advance(Duration::from_secs(179)).await;
        reporter.maybe_flush().await;
        assert_eq!(sink.call_count(), 1);

        // Interval elapsed: flushes.
        tokio::time::advance(Duration::from_secs(1)).await;
        reporter.maybe_flush().await;
        assert_eq!(sink.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn in_position_shortens_the_interval() {
        let (reporter, sink) = reporter_with_sink();
        reporter.set_in_position(true);
        reporter.maybe_flush().await;
        assert_eq!(sink.call_count(), 1);

        tokio::time::advance(Duration::from_secs(150)).await;
        reporter.maybe_flush().await;
        assert_eq!(sink.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_flush_respects_debounce() {
        let (reporter, sink) = reporter_with_sink();
        reporter.flush_now("critical").await;
        assert_eq!(sink.call_count(), 1);

        // Too soon: schedules instead of flushing.
        tokio::time::advance(Duration::from_secs(1)).await;
        reporter.flush_now("too_soon").await;
        assert_eq!(sink.call_count(), 1);

        // Debounce elapsed: the next forced claim adopts the deferred flush.
        tokio::time::advance(Duration::from_secs(2)).await;
        reporter.flush_now("later").await;
        assert_eq!(sink.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_flush_blocks_periodic_path_until_due() {
        let (reporter, sink) = reporter_with_sink();
        reporter.flush_now("first").await;
        assert_eq!(sink.call_count(), 1);
        reporter.flush_now("deferred").await; // schedules
        assert_eq!(sink.call_count(), 1);

        // Periodic path declines while the deferred flush is in the future.
        reporter.maybe_flush().await;
        assert_eq!(sink.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_patch_preserved_on_failure() {
        let (reporter, sink) = reporter_with_sink();
        reporter.mark_auth_ok();
        sink.fail_next();
        reporter.flush_now("fail").await;
        assert_eq!(sink.call_count(), 1);

        // Failed flush keeps the patch; the retry delivers the same keys.
        tokio::time::advance(Duration::from_secs(10)).await;
        reporter.flush_now("retry").await;
        assert_eq!(sink.call_count(), 2);
        let last = sink.last_patch().unwrap();
        assert_eq!(last.get("exchange_auth_ok"), Some(&Value::Bool(true)));
        assert!(last.get("last_auth_ok_at").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn window_counters_are_never_drained() {
        let (reporter, sink) = reporter_with_sink();
        reporter.record_decision();
        reporter.record_decision();

        reporter.flush_now("first").await;
        tokio::time::advance(Duration::from_secs(200)).await;
        reporter.maybe_flush().await;
        assert_eq!(sink.call_count(), 2);

        let last = sink.last_patch().unwrap();
        assert_eq!(last.get("decision_count_15m"), Some(&Value::from(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_flush_clears_pending_patch() {
        let (reporter, sink) = reporter_with_sink();
        reporter.record_db_ok();
        reporter.flush_now("first").await;
        assert!(sink.last_patch().unwrap().get("db_ok").is_some());

        tokio::time::advance(Duration::from_secs(200)).await;
        reporter.maybe_flush().await;
        let last = sink.last_patch().unwrap();
        // Gauges were cleared; only window counters remain.
        assert!(last.get("db_ok").is_none());
        assert!(last.get("decision_count_15m").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn order_reject_reason_is_normalized() {
        let (reporter, sink) = reporter_with_sink();
        reporter.record_order_reject("slippage_guard").await;
        let last = sink.last_patch().unwrap();
        assert_eq!(
            last.get("last_order_reject_reason"),
            Some(&Value::String("SLIPPAGE_GUARD".to_string()))
        );
        assert_eq!(last.get("order_rejects_15m"), Some(&Value::from(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn position_sync_flushes_only_on_drift() {
        let (reporter, sink) = reporter_with_sink();
        reporter.record_position_sync(0.0).await;
        assert_eq!(sink.call_count(), 0);

        reporter.record_position_sync(0.5).await;
        assert_eq!(sink.call_count(), 1);
        let last = sink.last_patch().unwrap();
        assert_eq!(last.get("position_ok"), Some(&Value::Bool(false)));
        assert_eq!(last.get("position_sync_diff"), Some(&Value::from(0.5)));
    }
}
