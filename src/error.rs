// =============================================================================
// Error taxonomy — tagged reason codes classified at adapter boundaries
// =============================================================================
//
// The worker never branches on raw error strings outside this module. Each
// adapter (exchange, persistence, indicator) classifies whatever it surfaces
// into a `ReasonCode`; the health reporter and the loop consume the code.
// =============================================================================

use thiserror::Error;

/// Stable reason codes persisted in health evidence and event rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    UnknownError,
    InvalidApiKey,
    InsufficientBalance,
    MinNotional,
    RateLimit,
    WebsocketTimeout,
    PositionMismatch,
    DbTimeout,
    IndicatorError,
    SlippageGuard,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::MinNotional => "MIN_NOTIONAL",
            Self::RateLimit => "RATE_LIMIT",
            Self::WebsocketTimeout => "WEBSOCKET_TIMEOUT",
            Self::PositionMismatch => "POSITION_MISMATCH",
            Self::DbTimeout => "DB_TIMEOUT",
            Self::IndicatorError => "INDICATOR_ERROR",
            Self::SlippageGuard => "SLIPPAGE_GUARD",
        }
    }

    /// Case-insensitive substring classification of an error's display text.
    /// First matching pattern wins; no match falls back to `UnknownError`.
    pub fn classify(text: &str) -> Self {
        const PATTERNS: &[(&str, ReasonCode)] = &[
            ("invalid api", ReasonCode::InvalidApiKey),
            ("invalid key", ReasonCode::InvalidApiKey),
            ("insufficient balance", ReasonCode::InsufficientBalance),
            ("insufficient funds", ReasonCode::InsufficientBalance),
            ("min notional", ReasonCode::MinNotional),
            ("min_notional", ReasonCode::MinNotional),
            ("rate limit", ReasonCode::RateLimit),
            ("ratelimit", ReasonCode::RateLimit),
            ("ddos", ReasonCode::RateLimit),
            ("slippage", ReasonCode::SlippageGuard),
            ("position mismatch", ReasonCode::PositionMismatch),
            // Specific timeout spellings must outrank the bare keyword.
            ("db timeout", ReasonCode::DbTimeout),
            ("db_timeout", ReasonCode::DbTimeout),
            ("websocket", ReasonCode::WebsocketTimeout),
            ("timeout", ReasonCode::WebsocketTimeout),
            ("indicator", ReasonCode::IndicatorError),
        ];

        let lower = text.to_lowercase();
        for (pattern, code) in PATTERNS {
            if lower.contains(pattern) {
                return *code;
            }
        }
        Self::UnknownError
    }

    pub fn classify_error(err: &anyhow::Error) -> Self {
        Self::classify(&format!("{err:#}"))
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a free-form reason string into the stable upper-case form.
pub fn normalize_reason_code(code: &str) -> String {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return ReasonCode::UnknownError.as_str().to_string();
    }
    trimmed.to_uppercase()
}

/// Rate-limit errors get special backoff handling in the loop.
pub fn is_rate_limit_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit") || lower.contains("ratelimit") || lower.contains("ddos")
}

/// Keywords that mark a market-data transport failure rather than a business
/// error; these feed the stream-disconnect window.
pub fn looks_like_stream_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["timeout", "disconnect", "connection reset", "socket", "read", "network", "reset"]
        .iter()
        .any(|token| lower.contains(token))
}

/// Drift between the local position row and the exchange of record.
///
/// Fatal: the loop treats any sync error as unrecoverable and halts.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("position mismatch: missing identity fields: {0:?}")]
    MissingIdentity(Vec<&'static str>),
    #[error("position mismatch: entry order lookup failed: {0}")]
    EntryOrderLookup(String),
    #[error("position missing on exchange and closure not confirmed")]
    MissingNotConfirmed,
}
