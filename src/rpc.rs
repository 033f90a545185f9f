use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{BitrixConfig, MaxConfig, TelegramConfig};
use crate::error::{BridgeError, Result};

/// Shared HTTP client with the fixed connect + total timeout every
/// outbound RPC call carries. Calls are single-attempt; a timeout or
/// remote failure surfaces as `DeliveryError` with no retry.
fn build_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(timeout_secs))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

fn transport_error(platform: &'static str, err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        BridgeError::delivery(platform, "request timed out")
    } else {
        BridgeError::delivery(platform, err)
    }
}

// ── CRM (Bitrix-style) REST client ──────────────────────────────────────────

pub struct BitrixClient {
    client: reqwest::Client,
    connector_code: String,
}

impl BitrixClient {
    pub fn new(config: &BitrixConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(config.request_timeout_secs)?,
            connector_code: config.connector_code.clone(),
        })
    }

    /// Call one CRM REST method on the tenant's portal. The CRM signals
    /// remote errors in-band with an `error` field, so a 200 response can
    /// still fail.
    async fn call(&self, domain: &str, method: &str, params: Value) -> Result<Value> {
        let url = format!("https://{domain}/rest/{method}.json");
        debug!("CRM RPC: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(|e| transport_error("bitrix", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::delivery(
                "bitrix",
                format!("HTTP {status} from {method}"),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| transport_error("bitrix", e))?;

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("");
            return Err(BridgeError::delivery(
                "bitrix",
                format!("{method}: {error} {description}"),
            ));
        }

        Ok(body)
    }

    /// Push one end-customer message into the tenant's open line.
    /// Returns the CRM-side message id.
    pub async fn send_message(
        &self,
        domain: &str,
        api_token: Option<&str>,
        line_id: i64,
        chat_id: &str,
        user_id: &str,
        user_name: &str,
        text: &str,
    ) -> Result<String> {
        let params = json!({
            "CONNECTOR": self.connector_code,
            "LINE": line_id,
            "auth": api_token,
            "MESSAGES": [{
                "user": {"id": user_id, "name": user_name},
                "chat": {"id": chat_id},
                "message": {"text": text},
            }],
        });
        let body = self
            .call(domain, "imconnector.send.messages", params)
            .await?;
        let message_id = body
            .pointer("/result/DATA/RESULT/0/session/MESSAGE_ID")
            .map(value_to_string)
            .unwrap_or_else(|| "0".to_string());
        Ok(message_id)
    }

    /// Confirm delivery of an operator message so the CRM UI shows the
    /// delivered check mark.
    pub async fn send_status_delivery(
        &self,
        domain: &str,
        api_token: Option<&str>,
        line_id: i64,
        chat_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let params = json!({
            "CONNECTOR": self.connector_code,
            "LINE": line_id,
            "auth": api_token,
            "MESSAGES": [{
                "im": {"chat_id": chat_id, "message_id": message_id},
                "chat": {"id": chat_id},
            }],
        });
        self.call(domain, "imconnector.send.status.delivery", params)
            .await?;
        Ok(())
    }

    /// Flip the connector's remote registration for a line on or off.
    pub async fn set_connector_active(
        &self,
        domain: &str,
        api_token: Option<&str>,
        line_id: i64,
        active: bool,
    ) -> Result<()> {
        let method = if active {
            "imconnector.activate"
        } else {
            "imconnector.deactivate"
        };
        let params = json!({
            "CONNECTOR": self.connector_code,
            "LINE": line_id,
            "ACTIVE": if active { 1 } else { 0 },
            "auth": api_token,
        });
        self.call(domain, method, params).await?;
        Ok(())
    }
}

// ── Telegram Bot API client ─────────────────────────────────────────────────

pub struct TelegramClient {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig, timeout_secs: u64) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout_secs)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Bot API sendMessage. Returns the remote message id.
    pub async fn send_message(&self, bot_token: &str, chat_id: i64, text: &str) -> Result<String> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, bot_token);
        debug!("Telegram RPC: sendMessage to chat {}", chat_id);

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await
            .map_err(|e| transport_error("telegram", e))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| transport_error("telegram", e))?;

        if !status.is_success() || body.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("sendMessage failed");
            return Err(BridgeError::delivery(
                "telegram",
                format!("HTTP {status}: {description}"),
            ));
        }

        let message_id = body
            .pointer("/result/message_id")
            .map(value_to_string)
            .unwrap_or_else(|| "0".to_string());
        Ok(message_id)
    }
}

// ── Max bot API client ──────────────────────────────────────────────────────

pub struct MaxClient {
    client: reqwest::Client,
    api_base: String,
}

impl MaxClient {
    pub fn new(config: &MaxConfig, timeout_secs: u64) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout_secs)?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Send one text message to a native (unprefixed) Max chat id.
    pub async fn send_message(&self, bot_token: &str, chat_id: &str, text: &str) -> Result<String> {
        let url = format!("{}/messages", self.api_base);
        debug!("Max RPC: send to chat {}", chat_id);

        let response = self
            .client
            .post(&url)
            .query(&[("access_token", bot_token), ("chat_id", chat_id)])
            .json(&json!({"text": text}))
            .send()
            .await
            .map_err(|e| transport_error("max", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::delivery(
                "max",
                format!("HTTP {status} from messages"),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| transport_error("max", e))?;

        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(BridgeError::delivery("max", error.to_string()));
        }

        let message_id = body
            .pointer("/message/body/mid")
            .or_else(|| body.get("message_id"))
            .map(value_to_string)
            .unwrap_or_else(|| "0".to_string());
        Ok(message_id)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
