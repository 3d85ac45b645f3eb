// =============================================================================
// Configuration — typed config bundles, hard-safety clamps, merge resolution
// =============================================================================
//
// Four bundles travel with the bot context: strategy, risk, execution, and
// control. Each is resolved at boot by merging JSON layers (definition
// defaults -> profile overrides -> user overrides -> persisted) and then
// normalized against the clamp constants below. The loop re-normalizes
// whatever the control-refresh RPC hands back, so clamps survive hot reloads.
//
// Every field carries `#[serde(default)]` so older persisted rows missing new
// fields still deserialize.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Hard-safety constants
// =============================================================================

/// Global floor for the polling cadence. Tiers raise this further.
pub const MIN_POLL_SECONDS: u64 = 5;
pub const MAX_LOOKBACK_BARS: u32 = 2000;
pub const MAX_LEVERAGE: f64 = 10.0;
pub const MAX_ALLOCATION_FRAC: f64 = 0.9;
pub const MIN_ALLOCATION_FRAC: f64 = 0.05;
pub const MAX_TRADES_PER_WEEK: u32 = 100;
pub const MIN_NOTIONAL_USD: f64 = 10.0;
pub const MAX_SLIPPAGE_BPS: u32 = 300;
pub const MAX_PYRAMID_LEVELS: u32 = 5;

pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
pub const ERROR_BACKOFF_SECONDS: u64 = 20;
pub const CONTROL_REFRESH_SECONDS: u64 = 60;
pub const CONTROL_REFRESH_POLLS: u32 = 20;

// =============================================================================
// Polling tiers
// =============================================================================

/// Named cadence class. Selects both the loop's minimum poll interval and the
/// health reporter's flush intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingTier {
    Fast5s,
    Ultra15s,
    Fast30s,
    Standard,
}

impl Default for PollingTier {
    fn default() -> Self {
        Self::Standard
    }
}

impl PollingTier {
    /// Unknown or empty tier names normalize to `standard`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "fast_5s" => Self::Fast5s,
            "ultra_15s" => Self::Ultra15s,
            "fast_30s" => Self::Fast30s,
            _ => Self::Standard,
        }
    }

    /// Minimum poll cadence this tier allows, in seconds.
    pub fn min_poll_seconds(self) -> u64 {
        match self {
            Self::Fast5s => 5,
            Self::Ultra15s => 15,
            Self::Fast30s => 30,
            Self::Standard => 60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast5s => "fast_5s",
            Self::Ultra15s => "ultra_15s",
            Self::Fast30s => "fast_30s",
            Self::Standard => "standard",
        }
    }
}

impl std::fmt::Display for PollingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_lookback_bars() -> u32 {
    700
}

fn default_order_type() -> String {
    "market".to_string()
}

fn default_max_slippage_bps() -> u32 {
    20
}

fn default_leverage() -> f64 {
    3.0
}

fn default_allocation_frac() -> f64 {
    0.5
}

fn default_max_trades_per_week() -> u32 {
    30
}

fn default_min_notional_usd() -> f64 {
    15.0
}

fn default_min_bars() -> u32 {
    500
}

fn default_sl_atr_mult() -> f64 {
    1.5
}

fn default_tp_atr_mult() -> f64 {
    3.5
}

fn default_trail_atr_mult() -> f64 {
    1.5
}

fn default_trail_start_r() -> f64 {
    1.0
}

fn default_pyramid_step() -> f64 {
    0.01
}

fn default_pyramid_add_frac() -> f64 {
    0.5
}

// =============================================================================
// StrategyConfig
// =============================================================================

/// Strategy bundle: exit multipliers, pyramiding, warmup, plus whatever extra
/// parameters the selected strategy reads (kept in `extra`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_min_bars")]
    pub min_bars: u32,

    #[serde(default = "default_sl_atr_mult")]
    pub sl_atr_mult: f64,
    #[serde(default = "default_tp_atr_mult")]
    pub tp_atr_mult: f64,
    #[serde(default = "default_trail_atr_mult")]
    pub trail_atr_mult: f64,
    /// Favorable move, in multiples of the stop distance, that arms trailing.
    #[serde(default = "default_trail_start_r")]
    pub trail_start_r: f64,

    #[serde(default)]
    pub pyramiding_enabled: bool,
    #[serde(default)]
    pub max_pyramid_levels: u32,
    #[serde(default = "default_pyramid_step")]
    pub pyramid_step: f64,
    #[serde(default = "default_pyramid_add_frac")]
    pub pyramid_add_frac: f64,

    /// Strategy-specific parameters (EMA spans, RSI gates, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Map::new())).expect("defaults deserialize")
    }
}

impl StrategyConfig {
    pub fn f64_param(&self, key: &str, default: f64) -> f64 {
        self.extra.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn usize_param(&self, key: &str, default: usize) -> usize {
        self.extra
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    pub fn bool_param(&self, key: &str, default: bool) -> bool {
        self.extra.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}

// =============================================================================
// RiskConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    /// Fraction of the free quote balance allocated per entry.
    #[serde(default = "default_allocation_frac")]
    pub allocation_frac: f64,
    #[serde(default = "default_max_trades_per_week")]
    pub max_trades_per_week: u32,
    #[serde(default = "default_min_notional_usd")]
    pub min_notional_usd: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Map::new())).expect("defaults deserialize")
    }
}

// =============================================================================
// ExecutionConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_lookback_bars")]
    pub lookback_bars: u32,
    #[serde(default = "default_order_type")]
    pub order_type: String,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
    #[serde(default)]
    pub polling_tier: Option<String>,
    #[serde(default)]
    pub margin_mode: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Map::new())).expect("defaults deserialize")
    }
}

// =============================================================================
// ControlConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_true")]
    pub trading_enabled: bool,
    #[serde(default)]
    pub kill_switch: bool,
    #[serde(default)]
    pub admin_override: bool,
    #[serde(default)]
    pub pause_requested: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            trading_enabled: true,
            kill_switch: false,
            admin_override: false,
            pause_requested: false,
        }
    }
}

// =============================================================================
// Normalization (clamps)
// =============================================================================

/// The four bundles plus a note per clamp that fired, so the caller can
/// journal `config_clamped` events.
#[derive(Debug, Clone, Default)]
pub struct NormalizedConfigs {
    pub strategy: StrategyConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub control: ControlConfig,
    pub clamps: Vec<String>,
}

fn clamp_f64(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Apply the hard-safety clamps. Called at boot and on every control refresh.
pub fn normalize_configs(
    mut strategy: StrategyConfig,
    mut risk: RiskConfig,
    mut execution: ExecutionConfig,
    control: ControlConfig,
    tier: PollingTier,
) -> NormalizedConfigs {
    let mut clamps = Vec::new();

    // Execution
    if execution.timeframe.trim().is_empty() {
        execution.timeframe = default_timeframe();
    }
    let poll_floor = MIN_POLL_SECONDS.max(tier.min_poll_seconds());
    if execution.poll_interval < poll_floor {
        execution.poll_interval = poll_floor;
        clamps.push(format!("poll_interval raised to {poll_floor}"));
    }
    if execution.lookback_bars > MAX_LOOKBACK_BARS {
        execution.lookback_bars = MAX_LOOKBACK_BARS;
        clamps.push(format!("lookback_bars clamped to {MAX_LOOKBACK_BARS}"));
    }
    if execution.order_type.trim().is_empty() {
        execution.order_type = default_order_type();
    }
    if execution.max_slippage_bps > MAX_SLIPPAGE_BPS {
        execution.max_slippage_bps = MAX_SLIPPAGE_BPS;
        clamps.push(format!("max_slippage_bps clamped to {MAX_SLIPPAGE_BPS}"));
    }

    // Risk
    let leverage = clamp_f64(risk.leverage, 1.0, MAX_LEVERAGE);
    if (leverage - risk.leverage).abs() > f64::EPSILON {
        clamps.push(format!("leverage clamped to {leverage}"));
    }
    risk.leverage = leverage;

    let alloc = clamp_f64(risk.allocation_frac, MIN_ALLOCATION_FRAC, MAX_ALLOCATION_FRAC);
    if (alloc - risk.allocation_frac).abs() > f64::EPSILON {
        clamps.push(format!("allocation_frac clamped to {alloc}"));
    }
    risk.allocation_frac = alloc;

    if risk.max_trades_per_week > MAX_TRADES_PER_WEEK {
        risk.max_trades_per_week = MAX_TRADES_PER_WEEK;
        clamps.push(format!("max_trades_per_week clamped to {MAX_TRADES_PER_WEEK}"));
    }
    if risk.min_notional_usd < MIN_NOTIONAL_USD {
        risk.min_notional_usd = MIN_NOTIONAL_USD;
        clamps.push(format!("min_notional_usd raised to {MIN_NOTIONAL_USD}"));
    }

    // Strategy
    if strategy.max_pyramid_levels > MAX_PYRAMID_LEVELS {
        strategy.max_pyramid_levels = MAX_PYRAMID_LEVELS;
        clamps.push(format!("max_pyramid_levels clamped to {MAX_PYRAMID_LEVELS}"));
    }

    NormalizedConfigs {
        strategy,
        risk,
        execution,
        control,
        clamps,
    }
}

// =============================================================================
// Layered merge resolution
// =============================================================================

/// Deep-merge `overlay` into `base`: nested objects merge recursively, every
/// other value type replaces.
pub fn merge_section(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out = b.clone();
            for (k, v) in o {
                let merged = match out.get(k) {
                    Some(existing) => merge_section(existing, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (_, overlay) => overlay.clone(),
    }
}

fn section(source: &Value, names: &[&str]) -> Value {
    for name in names {
        if let Some(v) = source.get(*name) {
            if v.is_object() {
                return v.clone();
            }
        }
    }
    Value::Object(Map::new())
}

/// Raw JSON sections of one resolution layer. Accepts both `{strategy: ..}`
/// and `{strategy_config: ..}` spellings.
fn extract_sections(source: &Value) -> (Value, Value, Value, Value) {
    (
        section(source, &["strategy", "strategy_config"]),
        section(source, &["risk", "risk_config"]),
        section(source, &["execution", "execution_config"]),
        section(source, &["control", "control_config"]),
    )
}

/// Merge definition defaults -> profile overrides -> user overrides ->
/// persisted bot configs, then deserialize into the typed bundles.
pub fn resolve_configs(
    definition_defaults: &Value,
    profile_overrides: &Value,
    user_overrides: &Value,
    persisted: &Value,
) -> anyhow::Result<(StrategyConfig, RiskConfig, ExecutionConfig, ControlConfig)> {
    let layers = [
        extract_sections(definition_defaults),
        extract_sections(profile_overrides),
        extract_sections(user_overrides),
        extract_sections(persisted),
    ];

    let mut merged = [
        Value::Object(Map::new()),
        Value::Object(Map::new()),
        Value::Object(Map::new()),
        Value::Object(Map::new()),
    ];
    for (sc, rc, ec, cc) in &layers {
        merged[0] = merge_section(&merged[0], sc);
        merged[1] = merge_section(&merged[1], rc);
        merged[2] = merge_section(&merged[2], ec);
        merged[3] = merge_section(&merged[3], cc);
    }

    Ok((
        serde_json::from_value(merged[0].clone())?,
        serde_json::from_value(merged[1].clone())?,
        serde_json::from_value(merged[2].clone())?,
        serde_json::from_value(merged[3].clone())?,
    ))
}
