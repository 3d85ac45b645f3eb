// =============================================================================
// Shared types used across the Meridian trading worker
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::{ControlConfig, ExecutionConfig, RiskConfig, StrategyConfig};

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// PnL sign convention: +1 for longs, -1 for shorts.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Order side that opens (or adds to) a position in this direction.
    pub fn open_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position in this direction.
    pub fn close_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the worker trades real funds or simulates fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Live,
    Paper,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl TradeMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "live" => Self::Live,
            _ => Self::Paper,
        }
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Paper => write!(f, "paper"),
        }
    }
}

/// Encrypted exchange credentials as stored in the backing database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptedCredentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub api_password: Option<String>,
    #[serde(default)]
    pub api_uid: Option<String>,
}

/// Identity plus live configuration for the one bot this process runs.
///
/// Identity fields are immutable after boot; `subscription_status` and the
/// config bundles are refreshed by the loop's control-refresh path.
#[derive(Debug, Clone)]
pub struct BotContext {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub strategy_key: String,
    pub mode: TradeMode,
    pub dry_run: bool,

    pub subscription_status: String,

    pub exchange_id: String,
    /// Market symbol in `BASE/QUOTE` form, e.g. "BTC/USDT".
    pub market_symbol: String,

    pub credentials: EncryptedCredentials,

    pub strategy_config: StrategyConfig,
    pub risk_config: RiskConfig,
    pub execution_config: ExecutionConfig,
    pub control_config: ControlConfig,

    pub runtime_provider: Option<String>,
    pub runtime_region: Option<String>,
    pub runtime_machine_id: Option<String>,
}

impl BotContext {
    /// Dry-run bots and paper-mode bots never reach the live exchange.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run || self.mode == TradeMode::Paper
    }

    pub fn subscription_active(&self) -> bool {
        self.subscription_status == "active"
    }

    /// Quote currency of the market symbol ("USDT" for "BTC/USDT").
    pub fn quote_currency(&self) -> &str {
        self.market_symbol
            .split('/')
            .nth(1)
            .unwrap_or(&self.market_symbol)
    }

    /// Base currency of the market symbol ("BTC" for "BTC/USDT").
    pub fn base_currency(&self) -> &str {
        self.market_symbol
            .split('/')
            .next()
            .unwrap_or(&self.market_symbol)
    }
}
