// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average.
//
// Formula:
//   multiplier = 2 / (span + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value is seeded with the SMA of the first `span` closes.
// =============================================================================

/// Full-length EMA column. The first `span - 1` positions hold NaN.
pub fn ema_series(values: &[f64], span: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if span == 0 || values.len() < span {
        return out;
    }

    let multiplier = 2.0 / (span + 1) as f64;

    let sma: f64 = values[..span].iter().sum::<f64>() / span as f64;
    if !sma.is_finite() {
        return out;
    }
    out[span - 1] = sma;

    let mut prev = sma;
    for i in span..values.len() {
        let ema = values[i] * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            // A broken series is worse than a truncated one.
            break;
        }
        out[i] = ema;
        prev = ema;
    }

    out
}
