// =============================================================================
// External liveness probe — healthchecks.io integration
// =============================================================================
//
// The supervisor watches the check, not the process: a halted worker stops
// pinging (or pings /fail) and the check raises the alert. Everything here is
// best-effort; a monitoring outage must never take the worker down.
// =============================================================================

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

const DEFAULT_API_BASE: &str = "https://healthchecks.io/api/v3";
const DEFAULT_GRACE_SECONDS: u64 = 900;

fn enabled() -> bool {
    std::env::var("HEALTHCHECKS_API_KEY")
        .map(|key| !key.trim().is_empty())
        .unwrap_or(false)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build reqwest client")
}

/// Create (or adopt, via the API's unique-name semantics) the check for this
/// bot and return its ping URL. `None` when the integration is disabled or
/// the API call fails.
pub async fn ensure(bot_id: &str, name: &str, poll_interval: u64) -> Option<String> {
    if !enabled() {
        warn!("HEALTHCHECKS_API_KEY not set; liveness probe disabled");
        return None;
    }
    let api_key = std::env::var("HEALTHCHECKS_API_KEY").ok()?;
    let api_base =
        std::env::var("HEALTHCHECKS_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
    let channels = std::env::var("HEALTHCHECKS_CHANNELS").unwrap_or_else(|_| "*".to_string());
    let grace = std::env::var("HEALTHCHECKS_GRACE_SECONDS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_GRACE_SECONDS);
    let timeout = poll_interval.saturating_mul(2).max(60);
    let support_email =
        std::env::var("SUPPORT_EMAIL").unwrap_or_else(|_| "support@meridian.bot".to_string());

    let payload = json!({
        "name": format!("b-{bot_id}"),
        "tags": format!("bot {bot_id} meridian"),
        "timeout": timeout,
        "grace": grace,
        "channels": channels,
        "desc": format!("Bot {bot_id} alert to {support_email}"),
        "unique": ["name"],
    });

    let response = client()
        .post(format!("{api_base}/checks/"))
        .header("X-Api-Key", &api_key)
        .json(&payload)
        .send()
        .await;

    match response {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await.ok()?;
            let ping_url = body
                .get("ping_url")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if ping_url.is_some() {
                info!(name, "liveness check ready");
            } else {
                warn!("healthcheck create response missing ping_url");
            }
            ping_url
        }
        Ok(resp) => {
            warn!(status = %resp.status(), "healthcheck create failed");
            None
        }
        Err(err) => {
            warn!(error = %err, "healthcheck create failed");
            None
        }
    }
}

/// Liveness ping. No-op without a URL.
pub async fn ping(ping_url: Option<&str>) {
    let Some(url) = ping_url else { return };
    if let Err(err) = client().get(url).send().await {
        warn!(error = %err, "healthcheck ping failed");
    }
}

/// Explicit failure ping so the alert fires before the grace period runs out.
pub async fn fail_ping(ping_url: Option<&str>, message: &str) {
    let Some(url) = ping_url else { return };
    let url = format!("{}/fail", url.trim_end_matches('/'));
    let result = client().get(&url).query(&[("msg", message)]).send().await;
    if let Err(err) = result {
        warn!(error = %err, "healthcheck fail ping failed");
    }
}
