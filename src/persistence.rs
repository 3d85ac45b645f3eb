// =============================================================================
// Persistence contract — RPC-style HTTP interface to the backing database
// =============================================================================
//
// Every call stands alone: the client keeps no session state beyond the HTTP
// connection pool. Transient upstream failures (502/503/504, transport
// errors) retry with 0.25 s / 1.0 s / 3.0 s delays and ±20 % jitter; anything
// else surfaces immediately.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::health::HealthSink;

const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAYS: [f64; 3] = [0.25, 1.0, 3.0];
const TIMEOUT_SECONDS: u64 = 10;

/// Result of `bot_runtime_refresh_controls`.
#[derive(Debug, Clone, Default)]
pub struct ControlRefresh {
    pub control_config: Option<Value>,
    pub execution_config: Option<Value>,
    pub subscription_status: Option<String>,
}

/// The RPC surface the core journals through. Production is
/// [`RuntimeRpcClient`]; tests substitute an in-memory mock.
#[async_trait]
pub trait PersistenceContract: Send + Sync {
    /// Joined context row for the bot (bot, api keys, exchange, market,
    /// subscription, strategy profile).
    async fn get_context(&self, bot_id: &str) -> Result<Value>;

    async fn refresh_controls(&self, bot_id: &str) -> Result<ControlRefresh>;

    /// Heartbeat carrying the serialized position-state snapshot.
    async fn heartbeat(&self, bot_id: &str, payload: Value) -> Result<()>;

    /// The currently open position row, if any.
    async fn get_open_position(&self, bot_id: &str) -> Result<Option<Value>>;

    /// Returns the row id on insert, `None` on update.
    async fn upsert_position(&self, bot_id: &str, payload: Value) -> Result<Option<String>>;

    /// Trade rows are idempotent on `(bot_id, exchange_order_id)`.
    async fn upsert_trade(
        &self,
        bot_id: &str,
        exchange_order_id: Option<&str>,
        payload: Value,
    ) -> Result<()>;

    async fn notify(&self, bot_id: &str, channel: &str, payload: Value) -> Result<()>;
}

// =============================================================================
// Production client
// =============================================================================

pub struct RuntimeRpcClient {
    endpoint_base: String,
    service_role_key: String,
    runtime_token: Option<String>,
    client: reqwest::Client,
}

impl RuntimeRpcClient {
    pub fn new(url: &str, service_role_key: &str, runtime_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECONDS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            endpoint_base: format!("{}/rest/v1/rpc", url.trim_end_matches('/')),
            service_role_key: service_role_key.to_string(),
            runtime_token,
            client,
        }
    }

    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SUPABASE_URL").context("SUPABASE_URL is not set")?;
        let key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .context("SUPABASE_SERVICE_ROLE_KEY is not set")?;
        let token = std::env::var("RUNTIME_TOKEN").ok();
        Ok(Self::new(&url, &key, token))
    }

    fn is_transient(status: StatusCode) -> bool {
        matches!(status.as_u16(), 502 | 503 | 504)
    }

    async fn sleep_with_jitter(delay: f64) {
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        tokio::time::sleep(Duration::from_secs_f64(delay * jitter)).await;
    }

    /// POST one RPC with the retry policy. Returns the response body.
    async fn call(&self, function: &str, payload: Value) -> Result<Value> {
        let url = format!("{}/{}", self.endpoint_base, function);
        let mut last_err: Option<anyhow::Error> = None;

        for (attempt, base_delay) in RETRY_DELAYS.iter().enumerate().take(MAX_ATTEMPTS) {
            let mut req = self
                .client
                .post(&url)
                .header("apikey", &self.service_role_key)
                .header("Authorization", format!("Bearer {}", self.service_role_key))
                .header("Content-Type", "application/json")
                .json(&payload);
            if let Some(token) = &self.runtime_token {
                req = req.header("x-runtime-token", token);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
                        return Ok(body);
                    }
                    let body = resp.text().await.unwrap_or_default();
                    warn!(function, attempt = attempt + 1, status = %status, "rpc attempt failed");
                    if Self::is_transient(status) && attempt + 1 < MAX_ATTEMPTS {
                        Self::sleep_with_jitter(*base_delay).await;
                        last_err = Some(anyhow::anyhow!("rpc {function} returned {status}: {body}"));
                        continue;
                    }
                    anyhow::bail!("rpc {function} returned {status}: {body}");
                }
                Err(err) => {
                    warn!(function, attempt = attempt + 1, error = %err, "rpc transport error");
                    if attempt + 1 >= MAX_ATTEMPTS {
                        return Err(anyhow::Error::from(err)
                            .context(format!("rpc {function} failed after {MAX_ATTEMPTS} attempts")));
                    }
                    last_err = Some(err.into());
                    Self::sleep_with_jitter(*base_delay).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("rpc {function} exhausted retries")))
    }
}

#[async_trait]
impl PersistenceContract for RuntimeRpcClient {
    async fn get_context(&self, bot_id: &str) -> Result<Value> {
        let row = self
            .call("bot_runtime_get_context", json!({ "p_bot_id": bot_id }))
            .await?;
        if row.is_null() {
            anyhow::bail!("bot_not_found: {bot_id}");
        }
        Ok(row)
    }

    async fn refresh_controls(&self, bot_id: &str) -> Result<ControlRefresh> {
        let body = self
            .call("bot_runtime_refresh_controls", json!({ "p_bot_id": bot_id }))
            .await?;
        Ok(ControlRefresh {
            control_config: body.get("control_config").filter(|v| !v.is_null()).cloned(),
            execution_config: body.get("execution_config").filter(|v| !v.is_null()).cloned(),
            subscription_status: body
                .get("subscription_status")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    async fn heartbeat(&self, bot_id: &str, payload: Value) -> Result<()> {
        self.call(
            "bot_runtime_heartbeat",
            json!({ "p_bot_id": bot_id, "p_payload": payload }),
        )
        .await?;
        Ok(())
    }

    async fn get_open_position(&self, bot_id: &str) -> Result<Option<Value>> {
        let body = self
            .call(
                "bot_runtime_get_position",
                json!({ "p_bot_id": bot_id, "p_status": "open" }),
            )
            .await?;
        if body.is_null() {
            return Ok(None);
        }
        Ok(Some(body))
    }

    async fn upsert_position(&self, bot_id: &str, payload: Value) -> Result<Option<String>> {
        let body = self
            .call(
                "bot_runtime_upsert_position",
                json!({ "p_bot_id": bot_id, "p_payload": payload }),
            )
            .await?;
        Ok(body.get("id").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }))
    }

    async fn upsert_trade(
        &self,
        bot_id: &str,
        exchange_order_id: Option<&str>,
        payload: Value,
    ) -> Result<()> {
        self.call(
            "bot_runtime_upsert_trade",
            json!({
                "p_bot_id": bot_id,
                "p_exchange_order_id": exchange_order_id,
                "p_payload": payload,
            }),
        )
        .await?;
        Ok(())
    }

    async fn notify(&self, bot_id: &str, channel: &str, payload: Value) -> Result<()> {
        self.call(
            "bot_runtime_notify",
            json!({ "p_bot_id": bot_id, "p_channel": channel, "p_payload": payload }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl HealthSink for RuntimeRpcClient {
    /// Health evidence flush. Returns success plus RPC latency; the reporter
    /// keeps its pending patch when this reports failure.
    async fn upsert_bot_health_evidence(&self, bot_id: &str, patch: Value) -> (bool, f64) {
        let start = Instant::now();
        let result = self
            .call(
                "upsert_bot_health_evidence",
                json!({ "p_bot_id": bot_id, "p_patch": patch }),
            )
            .await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(_) => (true, elapsed_ms),
            Err(err) => {
                debug!(error = %err, "health evidence flush failed");
                (false, elapsed_ms)
            }
        }
    }
}
