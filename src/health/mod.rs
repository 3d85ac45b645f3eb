// =============================================================================
// Health evidence — rolling counters, debounced reporter, flush policy
// =============================================================================

pub mod config;
pub mod reporter;
pub mod window;

use async_trait::async_trait;
use serde_json::Value;

pub use reporter::HealthReporter;
pub use window::{HealthWindow, WindowKey};

/// Destination for health evidence flushes. Production is the persistence
/// RPC client; tests capture patches in memory.
#[async_trait]
pub trait HealthSink: Send + Sync {
    /// Returns `(success, rpc_elapsed_ms)`. The reporter retains its pending
    /// patch when `success` is false.
    async fn upsert_bot_health_evidence(&self, bot_id: &str, patch: Value) -> (bool, f64);
}
