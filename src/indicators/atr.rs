// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// ATR measures volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is then the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14
// =============================================================================

/// Full-length ATR column for aligned `high`/`low`/`close` series. Bars
/// before the warmup (`period` TR values, each needing a previous close)
/// hold NaN.
pub fn atr_series(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let len = close.len();
    let mut out = vec![f64::NAN; len];
    if period == 0 || len < period + 1 || high.len() != len || low.len() != len {
        return out;
    }

    // --- True Range for each consecutive pair --------------------------------
    let mut tr_values = Vec::with_capacity(len - 1);
    for i in 1..len {
        let hl = high[i] - low[i];
        let hc = (high[i] - close[i - 1]).abs();
        let lc = (low[i] - close[i - 1]).abs();
        tr_values.push(hl.max(hc).max(lc));
    }

    // --- Seed with SMA of the first `period` TR values -----------------------
    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return out;
    }
    out[period] = seed;

    // --- Wilder's smoothing for the remainder --------------------------------
    let period_f = period as f64;
    let mut atr = seed;
    for (i, &tr) in tr_values.iter().enumerate().skip(period) {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return out;
        }
        out[i + 1] = atr;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(bars: &[(f64, f64, f64)]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        (
            bars.iter().map(|b| b.0).collect(),
            bars.iter().map(|b| b.1).collect(),
            bars.iter().map(|b| b.2).collect(),
        )
    }

    #[test]
    fn period_zero_is_all_nan() {
        let (h, l, c) = series(&[(105.0, 95.0, 102.0); 20]);
        assert!(atr_series(&h, &l, &c, 0).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn insufficient_data_is_all_nan() {
        let (h, l, c) = series(&[(105.0, 95.0, 102.0); 10]);
        assert!(atr_series(&h, &l, &c, 14).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn warmup_prefix_is_nan_then_values() {
        let bars: Vec<(f64, f64, f64)> = (0..10)
            .map(|i| {
                let base = 100.0 + i as f64;
                (base + 5.0, base - 5.0, base)
            })
            .collect();
        let (h, l, c) = series(&bars);
        let atr = atr_series(&h, &l, &c, 3);
        assert!(atr[..3].iter().all(|v| v.is_nan()));
        assert!(atr[3..].iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn constant_range_converges_to_range() {
        let bars: Vec<(f64, f64, f64)> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                (base + 5.0, base - 5.0, base)
            })
            .collect();
        let (h, l, c) = series(&bars);
        let atr = atr_series(&h, &l, &c, 14);
        let last = *atr.last().unwrap();
        assert!((last - 10.0).abs() < 1.0, "expected ATR near 10.0, got {last}");
    }

    #[test]
    fn true_range_uses_prev_close_on_gaps() {
        // Gap up: |H - prevClose| dominates H - L.
        let bars = [
            (105.0, 95.0, 95.0),
            (115.0, 108.0, 112.0),
            (118.0, 110.0, 115.0),
            (120.0, 113.0, 118.0),
        ];
        let (h, l, c) = series(&bars);
        let atr = atr_series(&h, &l, &c, 3);
        let last = *atr.last().unwrap();
        assert!(last > 7.0, "ATR should reflect the gap, got {last}");
    }

    #[test]
    fn nan_input_stays_nan() {
        let bars = [
            (105.0, 95.0, 100.0),
            (f64::NAN, 95.0, 100.0),
            (105.0, 95.0, 100.0),
            (105.0, 95.0, 100.0),
        ];
        let (h, l, c) = series(&bars);
        assert!(atr_series(&h, &l, &c, 3).iter().all(|v| v.is_nan()));
    }
}
