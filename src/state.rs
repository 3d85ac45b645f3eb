// =============================================================================
// Position state — the worker's in-memory trading state
// =============================================================================
//
// Mutated only by the position manager on the loop task. Background tasks
// (health watcher, reporters) read through a published snapshot, never the
// live value.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Direction;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionState {
    pub in_position: bool,
    /// Backing-database id of the current open position row.
    #[serde(default)]
    pub position_id: String,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub qty: f64,
    #[serde(default)]
    pub base_notional: f64,
    /// High-water mark for longs.
    #[serde(default)]
    pub peak_price: f64,
    /// Low-water mark for shorts.
    #[serde(default)]
    pub low_price: f64,
    #[serde(default)]
    pub added_levels: u32,
    /// ISO week key -> entries taken that week. Carried across positions.
    #[serde(default)]
    pub week_trade_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub last_exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_candle_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cumulative_pnl: f64,
    #[serde(default)]
    pub max_unrealized_pnl: f64,
    #[serde(default)]
    pub min_unrealized_pnl: f64,
    #[serde(default)]
    pub last_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub stop_price: f64,
    #[serde(default)]
    pub take_profit_price: f64,
    #[serde(default)]
    pub trailing_stop_price: f64,
    #[serde(default)]
    pub trailing_active: bool,
    #[serde(default)]
    pub atr: f64,
    #[serde(default)]
    pub last_manage_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl PositionState {
    /// Flat state after an exit. Weekly counters, candle cursor, cumulative
    /// PnL, and the exit timestamp survive; everything else resets.
    pub fn reset_after_exit(&mut self, exit_time: DateTime<Utc>, realized_pnl: f64) {
        let week_trade_counts = std::mem::take(&mut self.week_trade_counts);
        let last_candle_time = self.last_candle_time;
        let cumulative_pnl = self.cumulative_pnl + realized_pnl;

        *self = Self {
            in_position: false,
            week_trade_counts,
            last_candle_time,
            cumulative_pnl,
            last_exit_time: Some(exit_time),
            last_manage_time: Some(exit_time),
            ..Self::default()
        };
    }

    pub fn week_trades(&self, week_key: &str) -> u32 {
        self.week_trade_counts.get(week_key).copied().unwrap_or(0)
    }
}

/// `"<iso_year>-<iso_week>"`, the key trade caps are bucketed by.
pub fn week_key(ts: DateTime<Utc>) -> String {
    let iso = ts.iso_week();
    format!("{}-{}", iso.year(), iso.week())
}

/// Read-only view of the position state for background tasks.
#[derive(Clone, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<PositionState>>,
}

impl StateHandle {
    pub fn snapshot(&self) -> PositionState {
        self.inner.read().clone()
    }

    /// Called by the position manager after each mutation.
    pub fn publish(&self, state: &PositionState) {
        *self.inner.write() = state.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reset_keeps_only_carried_fields() {
        let exit_time = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        let mut state = PositionState {
            in_position: true,
            position_id: "pos-1".to_string(),
            direction: Some(Direction::Long),
            entry_price: 100.0,
            qty: 1.5,
            base_notional: 150.0,
            peak_price: 110.0,
            added_levels: 2,
            cumulative_pnl: 5.0,
            last_candle_time: Some(exit_time),
            ..Default::default()
        };
        state.week_trade_counts.insert("2024-10".to_string(), 3);

        state.reset_after_exit(exit_time, -4.0);

        assert!(!state.in_position);
        assert!(state.position_id.is_empty());
        assert_eq!(state.direction, None);
        assert_eq!(state.qty, 0.0);
        assert_eq!(state.entry_price, 0.0);
        assert_eq!(state.added_levels, 0);
        assert_eq!(state.week_trades("2024-10"), 3);
        assert_eq!(state.last_candle_time, Some(exit_time));
        assert_eq!(state.cumulative_pnl, 1.0);
        assert_eq!(state.last_exit_time, Some(exit_time));
    }

    #[test]
    fn week_key_uses_iso_calendar() {
        // 2024-01-01 falls in ISO week 1 of 2024.
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(week_key(ts), "2024-1");
        // 2023-01-01 is a Sunday and belongs to ISO week 52 of 2022.
        let ts = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(week_key(ts), "2022-52");
    }

    #[test]
    fn handle_publishes_snapshots() {
        let handle = StateHandle::default();
        assert!(!handle.snapshot().in_position);

        let state = PositionState {
            in_position: true,
            qty: 2.0,
            ..Default::default()
        };
        handle.publish(&state);
        let snap = handle.snapshot();
        assert!(snap.in_position);
        assert_eq!(snap.qty, 2.0);
    }
}
