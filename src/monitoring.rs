// =============================================================================
// Monitoring — out-of-band error shipping to the observability target
// =============================================================================
//
// Fire-and-forget: shipping runs on a spawned task and failures vanish into
// a debug log. The hot path never waits on the log API.
// =============================================================================

use serde_json::json;
use tracing::{debug, info};

const DEFAULT_LOG_API: &str = "https://log-api.newrelic.com/log/v1";

fn license_key() -> Option<String> {
    std::env::var("NEW_RELIC_LICENSE_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty())
}

pub fn init() {
    match license_key() {
        Some(_) => {
            let app = std::env::var("NEW_RELIC_APP_NAME")
                .unwrap_or_else(|_| "meridian-bot".to_string());
            info!(app, "error shipping enabled");
        }
        None => debug!("NEW_RELIC_LICENSE_KEY not set; error shipping disabled"),
    }
}

/// Ship one error record. Returns immediately; the send happens in the
/// background.
pub fn ship_error(bot_id: &str, message: &str) {
    let Some(key) = license_key() else { return };
    let endpoint =
        std::env::var("NEW_RELIC_LOG_API").unwrap_or_else(|_| DEFAULT_LOG_API.to_string());
    let app = std::env::var("NEW_RELIC_APP_NAME").unwrap_or_else(|_| "meridian-bot".to_string());
    let payload = json!({
        "message": message,
        "level": "error",
        "attributes": { "app": app, "bot_id": bot_id },
    });

    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
        {
            Ok(client) => client,
            Err(_) => return,
        };
        if let Err(err) = client
            .post(endpoint)
            .header("Api-Key", key)
            .json(&payload)
            .send()
            .await
        {
            debug!(error = %err, "error shipping failed");
        }
    });
}
