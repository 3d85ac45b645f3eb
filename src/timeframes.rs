// =============================================================================
// Timeframe parsing
// =============================================================================

/// Seconds covered by one bar of `timeframe` ("1m", "5m", "1h", "4h", "1d",
/// "1w"). Unparseable input falls back to one minute.
pub fn timeframe_to_seconds(timeframe: &str) -> f64 {
    let tf = timeframe.trim().to_lowercase();
    if tf.is_empty() || !tf.is_ascii() {
        return 60.0;
    }
    let (value_part, unit) = tf.split_at(tf.len() - 1);
    let value: f64 = match value_part.parse() {
        Ok(v) => v,
        Err(_) => return 60.0,
    };
    let multiplier = match unit {
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86_400.0,
        "w" => 604_800.0,
        _ => 60.0,
    };
    value * multiplier
}
