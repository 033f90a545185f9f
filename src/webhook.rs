use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::detect::{
    detect, detect_message_type, extract_chat_id, is_reply, Platform, BITRIX_MESSAGE_EVENT,
    BITRIX_UNINSTALL_EVENT, CONNECTOR_PLACEMENT,
};
use crate::envelope::{Envelope, MessageType};
use crate::error::BridgeError;
use crate::markup::Translator;
use crate::sender::MessengerFactory;
use crate::store::{TenantConnector, TenantStore};

/// Shared application state, immutable after startup.
pub struct AppState {
    pub config: Config,
    pub store: TenantStore,
    pub factory: MessengerFactory,
    pub translator: Translator,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    "bridgebot ok"
}

/// Pipeline stage a request failed in, reported in error responses.
/// Only stages that can actually fail are represented: body parsing and
/// detection are total, translation cannot fail, and an unknown source is
/// a terminal success rather than a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolved,
    Delivered,
    Acknowledged,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Delivered => "delivered",
            Self::Acknowledged => "acknowledged",
        }
    }
}

type StageResult<T> = std::result::Result<T, (Stage, BridgeError)>;

fn at(stage: Stage) -> impl Fn(BridgeError) -> (Stage, BridgeError) {
    move |err| (stage, err)
}

/// Single inbound endpoint. The body may be JSON or an urlencoded form;
/// platform hints may also arrive as query parameters. The request runs
/// a linear stage machine: detect, resolve, translate, deliver, and (for
/// CRM-originated messages) acknowledge. Every outcome produces a JSON
/// response; unknown payloads are acknowledged rather than rejected so
/// origin platforms do not enter retry storms.
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let payload = parse_body(&headers, &body);
    let platform = detect(&payload, &query);
    info!("webhook received: platform={}", platform.as_str());

    let outcome = match platform {
        Platform::Unknown => {
            // Terminal success with a no-op marker; no store access.
            return (StatusCode::OK, Json(json!({"status": "ignored"})));
        }
        Platform::Bitrix => handle_bitrix(&state, &payload, &query).await,
        Platform::Telegram | Platform::SessionRelay | Platform::Max => {
            handle_bot_inbound(&state, platform, &payload, &query).await
        }
    };

    match outcome {
        Ok(result) => (StatusCode::OK, Json(json!({"status": "ok", "result": result}))),
        Err((stage, err)) => {
            error!(
                "webhook failed: platform={} stage={} code={}: {}",
                platform.as_str(),
                stage.as_str(),
                err.code(),
                err
            );
            let status = StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({
                    "status": "error",
                    "error": {
                        "stage": stage.as_str(),
                        "code": err.code(),
                        "message": err.to_string(),
                    },
                })),
            )
        }
    }
}

// ── CRM-originated requests ─────────────────────────────────────────────────

async fn handle_bitrix(
    state: &AppState,
    payload: &Value,
    query: &HashMap<String, String>,
) -> StageResult<Value> {
    let domain = payload
        .pointer("/auth/domain")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| query.get("DOMAIN").cloned())
        .ok_or_else(|| {
            at(Stage::Resolved)(BridgeError::validation("CRM request without a domain"))
        })?;

    // Token first, domain second. First-contact requests lack a token.
    let application_token = payload
        .pointer("/auth/application_token")
        .and_then(Value::as_str);
    let tenant = match application_token {
        Some(token) => state
            .store
            .resolve_by_api_token(token)
            .await
            .map_err(at(Stage::Resolved))?,
        None => None,
    };
    let tenant = match tenant {
        Some(t) => t,
        None => state
            .store
            .resolve_by_domain(&domain)
            .await
            .map_err(at(Stage::Resolved))?,
    };

    // Capture the credential so later requests resolve by token alone.
    if let Some(token) = application_token {
        state
            .store
            .set_api_token(&tenant.connector_id, token)
            .await
            .map_err(at(Stage::Resolved))?;
    }

    let event = payload.get("event").and_then(Value::as_str).unwrap_or("");

    if payload.get("PLACEMENT").and_then(Value::as_str) == Some(CONNECTOR_PLACEMENT) {
        return handle_activation(state, payload, &tenant).await;
    }
    if event.eq_ignore_ascii_case(BITRIX_MESSAGE_EVENT) {
        return handle_operator_messages(state, payload, &tenant).await;
    }
    if event.eq_ignore_ascii_case(BITRIX_UNINSTALL_EVENT) {
        return handle_uninstall(state, &tenant).await;
    }

    // CRM-shaped but no actionable event. Acknowledge without effect.
    warn!("unhandled CRM event '{}' from {}", event, tenant.domain);
    Ok(json!({"handled": false}))
}

/// Connector settings placement: flips the remote registration and binds
/// the line. `PLACEMENT_OPTIONS` arrives as a JSON string inside the form.
async fn handle_activation(
    state: &AppState,
    payload: &Value,
    tenant: &TenantConnector,
) -> StageResult<Value> {
    let (line_id, active) = parse_placement_options(payload).map_err(at(Stage::Resolved))?;

    state
        .factory
        .bitrix_client()
        .set_connector_active(&tenant.domain, tenant.api_token.as_deref(), line_id, active)
        .await
        .map_err(at(Stage::Delivered))?;

    if active {
        state
            .store
            .activate_line(&tenant.connector_id, line_id)
            .await
            .map_err(at(Stage::Resolved))?;
        info!(
            "connector {} activated on line {} for {}",
            tenant.connector_id, line_id, tenant.domain
        );
    } else {
        state
            .store
            .deactivate(&tenant.connector_id)
            .await
            .map_err(at(Stage::Resolved))?;
        info!(
            "connector {} deactivated for {}",
            tenant.connector_id, tenant.domain
        );
    }

    Ok(json!({
        "connector_id": tenant.connector_id,
        "line": line_id,
        "active": active,
    }))
}

/// Operator replies pushed by the CRM: translate each message and forward
/// it to the bot platform its chat identifier belongs to, then confirm
/// delivery back to the CRM.
async fn handle_operator_messages(
    state: &AppState,
    payload: &Value,
    tenant: &TenantConnector,
) -> StageResult<Value> {
    let connector = payload
        .pointer("/data/CONNECTOR")
        .and_then(Value::as_str)
        .unwrap_or("");
    if !connector.is_empty() && connector != state.config.bitrix.connector_code {
        // Event for some other connector sharing the portal.
        return Ok(json!({"handled": false}));
    }

    let messages = payload
        .pointer("/data/MESSAGES")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            at(Stage::Resolved)(BridgeError::validation("message event without MESSAGES"))
        })?;

    let crm_sender = state
        .factory
        .for_platform(Platform::Bitrix, tenant, "", "")
        .map_err(at(Stage::Delivered))?;

    let mut delivered = Vec::new();
    for message in messages {
        let chat_id = message
            .pointer("/chat/id")
            .map(json_id)
            .ok_or_else(|| {
                at(Stage::Resolved)(BridgeError::validation("operator message without chat id"))
            })?;
        let crm_message_id = message.pointer("/message/id").map(json_id).unwrap_or_default();
        let text = message
            .pointer("/message/text")
            .and_then(Value::as_str)
            .unwrap_or("");

        // CRM -> bot: bracket markup to native rich text.
        let native_text = state.translator.to_native(text);

        let sender = state
            .factory
            .for_chat_id(&chat_id, tenant)
            .map_err(at(Stage::Delivered))?;
        let remote_id = sender
            .deliver(&chat_id, &native_text, MessageType::Text)
            .await
            .map_err(at(Stage::Delivered))?;

        // Delivery confirmation. The message already left the system, so a
        // failed acknowledgment is logged without reverting anything.
        if let Err(err) = crm_sender
            .acknowledge_delivery(&chat_id, &crm_message_id)
            .await
        {
            warn!(
                "stage {} failed for {} chat {}: {}",
                Stage::Acknowledged.as_str(),
                tenant.domain,
                chat_id,
                err
            );
        }

        delivered.push(json!({"chat_id": chat_id, "message_id": remote_id}));
    }

    Ok(json!({"delivered": delivered}))
}

async fn handle_uninstall(state: &AppState, tenant: &TenantConnector) -> StageResult<Value> {
    // Clear the remote registration; the row persists for reinstallation.
    if let Some(line_id) = tenant.line_id {
        if let Err(err) = state
            .factory
            .bitrix_client()
            .set_connector_active(&tenant.domain, tenant.api_token.as_deref(), line_id, false)
            .await
        {
            warn!("remote deactivation failed for {}: {}", tenant.domain, err);
        }
    }
    state
        .store
        .deactivate(&tenant.connector_id)
        .await
        .map_err(at(Stage::Resolved))?;
    info!("uninstalled connector {} for {}", tenant.connector_id, tenant.domain);
    Ok(json!({"connector_id": tenant.connector_id, "active": false}))
}

fn parse_placement_options(payload: &Value) -> crate::error::Result<(i64, bool)> {
    let raw = payload
        .get("PLACEMENT_OPTIONS")
        .ok_or_else(|| BridgeError::validation("placement without PLACEMENT_OPTIONS"))?;

    // Options arrive either as a JSON string (form post) or an object.
    let options: Value = match raw {
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| BridgeError::validation(format!("bad PLACEMENT_OPTIONS: {e}")))?,
        other => other.clone(),
    };

    let line_id = options
        .get("LINE")
        .map(json_id)
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| BridgeError::validation("PLACEMENT_OPTIONS without LINE"))?;

    let active = match options.get("ACTIVE_STATUS").map(json_id).as_deref() {
        Some("Y") | Some("y") | Some("1") | None => true,
        _ => false,
    };

    Ok((line_id, active))
}

// ── Bot-originated requests ─────────────────────────────────────────────────

/// End-customer message from a bot platform or session relay: build the
/// canonical envelope, translate into bracket markup, and deliver it into
/// the tenant's open line. No acknowledgment for bot-originated traffic.
async fn handle_bot_inbound(
    state: &AppState,
    platform: Platform,
    payload: &Value,
    query: &HashMap<String, String>,
) -> StageResult<Value> {
    let tenant = resolve_tenant(state, query).await?;

    let message = match platform {
        Platform::SessionRelay => payload,
        _ => payload.get("message").unwrap_or(payload),
    };

    let chat_id = extract_chat_id(payload, platform).ok_or_else(|| {
        at(Stage::Resolved)(BridgeError::validation("payload without chat identifier"))
    })?;

    let envelope = Envelope {
        source: platform,
        message_type: detect_message_type(message, platform),
        chat_id,
        sender_id: extract_sender_id(message, platform),
        sender_name: extract_sender_name(message, platform),
        // Bot -> CRM: native rich text to bracket markup.
        text: state
            .translator
            .to_bracket(extract_text(message, platform).unwrap_or_default()),
        is_reply: is_reply(message, platform),
        timestamp: Utc::now(),
    };

    info!(
        "inbound {} {} from {} chat {} (reply: {})",
        envelope.source.as_str(),
        envelope.message_type.as_str(),
        tenant.domain,
        envelope.chat_id,
        envelope.is_reply
    );

    let sender = state
        .factory
        .for_platform(
            Platform::Bitrix,
            &tenant,
            &envelope.sender_id,
            &envelope.sender_name,
        )
        .map_err(at(Stage::Delivered))?;

    let remote_id = sender
        .deliver(&envelope.chat_id, &envelope.text, envelope.message_type)
        .await
        .map_err(at(Stage::Delivered))?;

    Ok(json!({
        "platform": envelope.source.as_str(),
        "chat_id": envelope.chat_id,
        "message_id": remote_id,
        "received_at": envelope.timestamp.to_rfc3339(),
    }))
}

/// Tenant context for a bot request: opaque credential first, domain
/// second. Requests carrying neither cannot be attributed to a tenant.
async fn resolve_tenant(
    state: &AppState,
    query: &HashMap<String, String>,
) -> StageResult<TenantConnector> {
    if let Some(token) = query.get("token") {
        if let Some(tenant) = state
            .store
            .resolve_by_api_token(token)
            .await
            .map_err(at(Stage::Resolved))?
        {
            return Ok(tenant);
        }
    }
    if let Some(domain) = query.get("domain") {
        return state
            .store
            .resolve_by_domain(domain)
            .await
            .map_err(at(Stage::Resolved));
    }
    Err(at(Stage::Resolved)(BridgeError::validation(
        "request carries neither tenant token nor domain",
    )))
}

fn extract_sender_id(message: &Value, platform: Platform) -> String {
    match platform {
        Platform::Telegram => message.pointer("/from/id").map(json_id),
        Platform::Max => message
            .pointer("/sender/user_id")
            .or_else(|| message.pointer("/from/id"))
            .map(json_id),
        Platform::SessionRelay => message.get("profile_id").map(json_id),
        _ => None,
    }
    .unwrap_or_else(|| "0".to_string())
}

fn extract_sender_name(message: &Value, platform: Platform) -> String {
    let name = match platform {
        Platform::Telegram => {
            let first = message.pointer("/from/first_name").and_then(Value::as_str);
            let last = message.pointer("/from/last_name").and_then(Value::as_str);
            match (first, last) {
                (Some(f), Some(l)) => Some(format!("{f} {l}")),
                (Some(f), None) => Some(f.to_string()),
                _ => None,
            }
        }
        Platform::Max => message
            .pointer("/sender/name")
            .and_then(Value::as_str)
            .map(str::to_string),
        Platform::SessionRelay => message
            .get("session_name")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };
    name.unwrap_or_else(|| "Guest".to_string())
}

fn extract_text(message: &Value, platform: Platform) -> Option<&str> {
    match platform {
        Platform::Max => message
            .get("text")
            .or_else(|| message.pointer("/body/text"))
            .and_then(Value::as_str),
        _ => message.get("text").and_then(Value::as_str),
    }
}

/// Render a JSON string or number as a bare id string.
fn json_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Body parsing ────────────────────────────────────────────────────────────

/// Build the attribute map for one request. JSON body first, then form
/// fields merged on top: form fields take precedence on key collision.
/// Bracketed form keys (`data[MESSAGES][0][chat][id]`) expand into nested
/// objects and arrays.
pub fn parse_body(headers: &HeaderMap, body: &[u8]) -> Value {
    let mut merged = serde_json::from_slice::<Value>(body)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()));

    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let looks_like_form = !body.is_empty() && !body.starts_with(b"{") && body.contains(&b'=');

    if content_type.starts_with("application/x-www-form-urlencoded") || looks_like_form {
        let form = form_to_json(url::form_urlencoded::parse(body));
        merge_into(&mut merged, form);
    }

    merged
}

fn form_to_json<'a>(pairs: impl Iterator<Item = (std::borrow::Cow<'a, str>, std::borrow::Cow<'a, str>)>) -> Value {
    let mut root = Value::Object(Map::new());
    for (key, value) in pairs {
        let segments = split_form_key(&key);
        insert_path(&mut root, &segments, Value::String(value.into_owned()));
    }
    root
}

fn split_form_key(key: &str) -> Vec<String> {
    let Some(pos) = key.find('[') else {
        return vec![key.to_string()];
    };
    let mut segments = vec![key[..pos].to_string()];
    let mut rest = &key[pos..];
    while let Some(stripped) = rest.strip_prefix('[') {
        match stripped.find(']') {
            Some(end) => {
                segments.push(stripped[..end].to_string());
                rest = &stripped[end + 1..];
            }
            None => {
                segments.push(stripped.to_string());
                break;
            }
        }
    }
    segments
}

fn insert_path(slot: &mut Value, segments: &[String], value: Value) {
    let Some((head, tail)) = segments.split_first() else {
        *slot = value;
        return;
    };

    if let Ok(index) = head.parse::<usize>() {
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(arr) = slot {
            while arr.len() <= index {
                arr.push(Value::Null);
            }
            insert_path(&mut arr[index], tail, value);
        }
    } else {
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(obj) = slot {
            let entry = obj.entry(head.clone()).or_insert(Value::Null);
            insert_path(entry, tail, value);
        }
    }
}

fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
