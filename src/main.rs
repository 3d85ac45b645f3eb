// =============================================================================
// Meridian Trading Worker — Main Entry Point
// =============================================================================
//
// One process runs one bot: hydrate its context from the backing database,
// verify exchange connectivity, then poll the market on a jittered cadence
// until a halt condition stops the loop. The process is supervised
// externally; clean stops exit 0 and bootstrap failures exit non-zero.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod crypto;
mod error;
mod exchange;
mod frame;
mod health;
mod healthcheck;
mod ids;
mod indicators;
mod monitoring;
mod persistence;
mod runtime;
mod scheduler;
mod state;
mod strategy;
mod sync;
#[cfg(test)]
mod testutil;
mod timeframes;
mod trading;
mod types;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bot_id = match std::env::args().nth(1).or_else(|| std::env::var("BOT_ID").ok()) {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            error!("usage: meridian-bot <BOT_ID> (or set BOT_ID)");
            std::process::exit(2);
        }
    };

    info!(bot_id = %bot_id, "meridian worker starting");

    match runtime::bootstrap::start(&bot_id).await {
        Ok(()) => {
            info!("worker stopped cleanly");
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "worker failed to start");
            std::process::exit(1);
        }
    }
}
