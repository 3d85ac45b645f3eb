// =============================================================================
// Strategy surface — prepare/long/short over OHLCV frames
// =============================================================================
//
// A strategy decorates the OHLCV frame with indicator columns in `prepare`
// and answers per-row entry questions. The dynamic expression evaluator is
// external; the built-in registry ships the three stock strategies.
// =============================================================================

use anyhow::Result;

use crate::config::StrategyConfig;
use crate::frame::{Frame, Row};
use crate::indicators::{atr_series, ema_series, rolling_max, rolling_mean, rolling_min, rsi_series};

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Add the indicator columns this strategy's signals read. The `atr`
    /// column is mandatory: the exits engine scales stops from it.
    fn prepare(&self, frame: Frame, cfg: &StrategyConfig) -> Result<Frame>;

    fn long_signal(&self, row: &Row<'_>, cfg: &StrategyConfig) -> Result<bool>;

    fn short_signal(&self, row: &Row<'_>, cfg: &StrategyConfig) -> Result<bool>;
}

/// Look up a registry strategy by key. Unknown keys fail bootstrap.
pub fn get_strategy(key: &str) -> Result<Box<dyn Strategy>> {
    match key.trim().to_lowercase().as_str() {
        "trend" => Ok(Box::new(TrendStrategy)),
        "breakout" => Ok(Box::new(BreakoutStrategy)),
        "sentiment" => Ok(Box::new(SentimentStrategy)),
        other => anyhow::bail!("unknown strategy: {other}"),
    }
}

/// Shift a column one bar forward (value at `i` becomes value at `i + 1`).
fn shift_one(mut values: Vec<f64>) -> Vec<f64> {
    if !values.is_empty() {
        values.pop();
        values.insert(0, f64::NAN);
    }
    values
}

fn close_column(frame: &Frame) -> Result<Vec<f64>> {
    Ok(frame
        .column("close")
        .ok_or_else(|| anyhow::anyhow!("indicator input missing close column"))?
        .to_vec())
}

fn add_atr_column(frame: &mut Frame, cfg: &StrategyConfig) -> Result<()> {
    let high = frame
        .column("high")
        .ok_or_else(|| anyhow::anyhow!("indicator input missing high column"))?
        .to_vec();
    let low = frame
        .column("low")
        .ok_or_else(|| anyhow::anyhow!("indicator input missing low column"))?
        .to_vec();
    let close = close_column(frame)?;
    let period = cfg.usize_param("atr_period", 14);
    frame.set_column("atr", atr_series(&high, &low, &close, period));
    Ok(())
}

// =============================================================================
// Trend — EMA stack alignment gated by RSI
// =============================================================================

pub struct TrendStrategy;

impl Strategy for TrendStrategy {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn prepare(&self, mut frame: Frame, cfg: &StrategyConfig) -> Result<Frame> {
        let close = close_column(&frame)?;
        frame.set_column("ema_fast", ema_series(&close, cfg.usize_param("ema_fast", 20)));
        frame.set_column("ema_slow", ema_series(&close, cfg.usize_param("ema_slow", 50)));
        frame.set_column("ema_trend", ema_series(&close, cfg.usize_param("ema_trend", 100)));
        frame.set_column("rsi", rsi_series(&close, cfg.usize_param("rsi_period", 14)));
        add_atr_column(&mut frame, cfg)?;
        Ok(frame)
    }

    fn long_signal(&self, row: &Row<'_>, cfg: &StrategyConfig) -> Result<bool> {
        let (Some(fast), Some(slow), Some(trend), Some(rsi)) = (
            row.get("ema_fast"),
            row.get("ema_slow"),
            row.get("ema_trend"),
            row.get("rsi"),
        ) else {
            return Ok(false);
        };
        Ok(fast > slow && slow > trend && rsi >= cfg.f64_param("rsi_entry_long", 55.0))
    }

    fn short_signal(&self, row: &Row<'_>, cfg: &StrategyConfig) -> Result<bool> {
        let (Some(fast), Some(slow), Some(trend), Some(rsi)) = (
            row.get("ema_fast"),
            row.get("ema_slow"),
            row.get("ema_trend"),
            row.get("rsi"),
        ) else {
            return Ok(false);
        };
        Ok(fast < slow && slow < trend && rsi <= cfg.f64_param("rsi_entry_short", 45.0))
    }
}

// =============================================================================
// Breakout — range high/low break with ATR buffer and volume filter
// =============================================================================

pub struct BreakoutStrategy;

impl BreakoutStrategy {
    fn volume_ok(row: &Row<'_>, cfg: &StrategyConfig) -> bool {
        if !cfg.bool_param("volume_filter_enabled", true) {
            return true;
        }
        let vol_ma = row.get_or("vol_ma", 0.0);
        if vol_ma <= 0.0 {
            return true;
        }
        row.get_or("volume", 0.0) >= cfg.f64_param("volume_mult", 1.2) * vol_ma
    }

    fn buffer(row: &Row<'_>, cfg: &StrategyConfig) -> Option<f64> {
        let atr = row.get_or("atr", 0.0);
        if atr <= 0.0 {
            return None;
        }
        let confirm = cfg.usize_param("confirm_candles", 1).max(1) as f64;
        Some(cfg.f64_param("breakout_buffer_atr", 0.2) * atr * confirm)
    }
}

impl Strategy for BreakoutStrategy {
    fn name(&self) -> &'static str {
        "breakout"
    }

    fn prepare(&self, mut frame: Frame, cfg: &StrategyConfig) -> Result<Frame> {
        add_atr_column(&mut frame, cfg)?;
        let lookback = cfg.usize_param("range_lookback", 48);
        let high = frame
            .column("high")
            .ok_or_else(|| anyhow::anyhow!("indicator input missing high column"))?
            .to_vec();
        let low = frame
            .column("low")
            .ok_or_else(|| anyhow::anyhow!("indicator input missing low column"))?
            .to_vec();
        // Range excludes the breakout bar itself; a close can never clear a
        // level its own high is part of.
        frame.set_column("range_high", shift_one(rolling_max(&high, lookback)));
        frame.set_column("range_low", shift_one(rolling_min(&low, lookback)));
        if cfg.bool_param("volume_filter_enabled", true) {
            let volume = frame
                .column("volume")
                .ok_or_else(|| anyhow::anyhow!("indicator input missing volume column"))?
                .to_vec();
            let period = cfg.usize_param("volume_ma_period", 20);
            frame.set_column("vol_ma", rolling_mean(&volume, period));
        }
        Ok(frame)
    }

    fn long_signal(&self, row: &Row<'_>, cfg: &StrategyConfig) -> Result<bool> {
        let Some(buffer) = Self::buffer(row, cfg) else {
            return Ok(false);
        };
        let Some(range_high) = row.get("range_high") else {
            return Ok(false);
        };
        if !Self::volume_ok(row, cfg) {
            return Ok(false);
        }
        Ok(row.get_or("close", 0.0) > range_high + buffer)
    }

    fn short_signal(&self, row: &Row<'_>, cfg: &StrategyConfig) -> Result<bool> {
        let Some(buffer) = Self::buffer(row, cfg) else {
            return Ok(false);
        };
        let Some(range_low) = row.get("range_low") else {
            return Ok(false);
        };
        if !Self::volume_ok(row, cfg) {
            return Ok(false);
        }
        Ok(row.get_or("close", f64::MAX) < range_low - buffer)
    }
}

// =============================================================================
// Sentiment — external score stub vs entry thresholds
// =============================================================================

pub struct SentimentStrategy;

impl SentimentStrategy {
    /// Dynamic score fed by the platform through the environment.
    fn score() -> f64 {
        std::env::var("SENTIMENT_SCORE")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0.0)
    }
}

impl Strategy for SentimentStrategy {
    fn name(&self) -> &'static str {
        "sentiment"
    }

    fn prepare(&self, mut frame: Frame, cfg: &StrategyConfig) -> Result<Frame> {
        add_atr_column(&mut frame, cfg)?;
        Ok(frame)
    }

    fn long_signal(&self, _row: &Row<'_>, cfg: &StrategyConfig) -> Result<bool> {
        Ok(Self::score() >= cfg.f64_param("long_threshold", 0.55))
    }

    fn short_signal(&self, _row: &Row<'_>, cfg: &StrategyConfig) -> Result<bool> {
        Ok(Self::score() <= cfg.f64_param("short_threshold", -0.55))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::candles_from_closes;
    use serde_json::json;

    fn cfg_with(extra: serde_json::Value) -> StrategyConfig {
        serde_json::from_value(extra).unwrap()
    }

    #[test]
    fn registry_resolves_known_keys() {
        assert_eq!(get_strategy("trend").unwrap().name(), "trend");
        assert_eq!(get_strategy("BREAKOUT").unwrap().name(), "breakout");
        assert_eq!(get_strategy(" sentiment ").unwrap().name(), "sentiment");
        assert!(get_strategy("martingale").is_err());
    }

    #[test]
    fn trend_long_fires_on_aligned_uptrend() {
        // Steady uptrend: fast > slow > trend and RSI pinned at 100.
        let closes: Vec<f64> = (0..200).map(|i| 100.0 + i as f64).collect();
        let frame = Frame::from_candles(&candles_from_closes(&closes, 3600));
        let cfg = cfg_with(json!({ "ema_fast": 10, "ema_slow": 30, "ema_trend": 60 }));

        let strategy = TrendStrategy;
        let prepared = strategy.prepare(frame, &cfg).unwrap();
        let row = prepared.last_row().unwrap();
        assert!(strategy.long_signal(&row, &cfg).unwrap());
        assert!(!strategy.short_signal(&row, &cfg).unwrap());
    }

    #[test]
    fn trend_no_signal_during_warmup() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let frame = Frame::from_candles(&candles_from_closes(&closes, 3600));
        let cfg = StrategyConfig::default(); // ema_trend=100 never warms up
        let strategy = TrendStrategy;
        let prepared = strategy.prepare(frame, &cfg).unwrap();
        let row = prepared.last_row().unwrap();
        assert!(!strategy.long_signal(&row, &cfg).unwrap());
    }

    #[test]
    fn breakout_long_on_range_break() {
        // Flat range then a decisive breakout bar.
        let mut closes = vec![100.0; 60];
        closes.push(130.0);
        let frame = Frame::from_candles(&candles_from_closes(&closes, 3600));
        let cfg = cfg_with(json!({
            "range_lookback": 20,
            "atr_period": 5,
            "volume_filter_enabled": false,
        }));

        let strategy = BreakoutStrategy;
        let prepared = strategy.prepare(frame, &cfg).unwrap();
        let row = prepared.last_row().unwrap();
        assert!(strategy.long_signal(&row, &cfg).unwrap());
        assert!(!strategy.short_signal(&row, &cfg).unwrap());
    }

    #[test]
    fn breakout_requires_positive_atr() {
        // Two bars: no ATR warmup, so no signal either way.
        let frame = Frame::from_candles(&candles_from_closes(&[100.0, 140.0], 3600));
        let cfg = StrategyConfig::default();
        let strategy = BreakoutStrategy;
        let prepared = strategy.prepare(frame, &cfg).unwrap();
        let row = prepared.last_row().unwrap();
        assert!(!strategy.long_signal(&row, &cfg).unwrap());
    }

    #[test]
    fn sentiment_reads_env_score() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let frame = Frame::from_candles(&candles_from_closes(&closes, 3600));
        let cfg = StrategyConfig::default();
        let strategy = SentimentStrategy;
        let prepared = strategy.prepare(frame, &cfg).unwrap();
        let row = prepared.last_row().unwrap();

        std::env::set_var("SENTIMENT_SCORE", "0.9");
        assert!(strategy.long_signal(&row, &cfg).unwrap());
        assert!(!strategy.short_signal(&row, &cfg).unwrap());

        std::env::set_var("SENTIMENT_SCORE", "-0.9");
        assert!(strategy.short_signal(&row, &cfg).unwrap());
        std::env::remove_var("SENTIMENT_SCORE");
    }

    #[test]
    fn prepare_always_adds_atr_column() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        let candles = candles_from_closes(&closes, 3600);
        for key in ["trend", "breakout", "sentiment"] {
            let strategy = get_strategy(key).unwrap();
            let prepared = strategy
                .prepare(Frame::from_candles(&candles), &StrategyConfig::default())
                .unwrap();
            assert!(prepared.column("atr").is_some(), "{key} missing atr");
        }
    }
}
