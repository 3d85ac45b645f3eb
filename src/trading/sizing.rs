// =============================================================================
// Position sizing
// =============================================================================

/// Quote-currency notional for a new entry.
pub fn compute_notional(balance_quote: f64, allocation_frac: f64, leverage: f64) -> f64 {
    balance_quote * allocation_frac * leverage
}

/// Base-asset quantity for `notional` at `price`. Zero on degenerate prices.
pub fn compute_qty(notional: f64, price: f64) -> f64 {
    if price > 0.0 {
        notional / price
    } else {
        0.0
    }
}
