// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free series implementations consumed by the strategies'
// `prepare` step. Every function returns a column of the same length as its
// input; positions where the indicator is undefined (warmup) hold NaN, which
// frame rows surface as missing values.

pub mod atr;
pub mod ema;
pub mod rsi;

pub use atr::atr_series;
pub use ema::ema_series;
pub use rsi::rsi_series;

/// Rolling maximum over the trailing `window` values (inclusive). NaN until
/// the window is full.
pub fn rolling_max(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, |slice| {
        slice.iter().copied().fold(f64::MIN, f64::max)
    })
}

/// Rolling minimum over the trailing `window` values (inclusive).
pub fn rolling_min(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, |slice| {
        slice.iter().copied().fold(f64::MAX, f64::min)
    })
}

/// Rolling arithmetic mean over the trailing `window` values (inclusive).
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, |slice| {
        slice.iter().sum::<f64>() / slice.len() as f64
    })
}

fn rolling(values: &[f64], window: usize, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 {
        return out;
    }
    for i in (window - 1)..values.len() {
        out[i] = f(&values[i + 1 - window..=i]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_max_and_min() {
        let values = [1.0, 3.0, 2.0, 5.0, 4.0];
        let max = rolling_max(&values, 3);
        assert!(max[0].is_nan() && max[1].is_nan());
        assert_eq!(&max[2..], &[3.0, 5.0, 5.0]);

        let min = rolling_min(&values, 3);
        assert_eq!(&min[2..], &[1.0, 2.0, 2.0]);
    }

    #[test]
    fn rolling_mean_window_of_two() {
        let values = [2.0, 4.0, 6.0];
        let mean = rolling_mean(&values, 2);
        assert!(mean[0].is_nan());
        assert_eq!(&mean[1..], &[3.0, 5.0]);
    }

    #[test]
    fn zero_window_is_all_nan() {
        assert!(rolling_max(&[1.0, 2.0], 0).iter().all(|v| v.is_nan()));
    }
}
