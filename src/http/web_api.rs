//! `/api/*` endpoints backing the web UI.

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{ApiError, ApiResult, AppState};
use crate::bridge::session::contact_approval_command;
use crate::bridge::{Bridge, BridgeError};
use crate::meshcore::messages::{compute_updates, parse_last_seen, read_messages, MessageQuery};
use crate::meshcore::parser::{format_command, parse_channels, Channel};
use crate::validation::{
    validate_channel_index, validate_hours, validate_message_text, ValidationError,
};

/// How long a `get_channels` listing is reused by the updates poll.
const CHANNEL_CACHE_TTL: Duration = Duration::from_secs(30);

/// Last known channel list. The updates endpoint is polled every few seconds
/// and must not put a `get_channels` round-trip on the radio each time.
#[derive(Debug, Default)]
pub struct ChannelCache {
    inner: Mutex<Option<(Instant, Vec<Channel>)>>,
}

impl ChannelCache {
    fn lock(&self) -> MutexGuard<'_, Option<(Instant, Vec<Channel>)>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fresh(&self) -> Option<Vec<Channel>> {
        self.lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < CHANNEL_CACHE_TTL)
            .map(|(_, channels)| channels.clone())
    }

    /// Cached list regardless of age.
    pub fn last_known(&self) -> Option<Vec<Channel>> {
        self.lock().as_ref().map(|(_, channels)| channels.clone())
    }

    pub fn store(&self, channels: Vec<Channel>) {
        *self.lock() = Some((Instant::now(), channels));
    }
}

async fn fetch_channels(bridge: &Bridge, cache: &ChannelCache) -> Result<Vec<Channel>, BridgeError> {
    let output = bridge.execute_command("get_channels", None).await?;
    let channels = parse_channels(&output.stdout);
    cache.store(channels.clone());
    Ok(channels)
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(e.to_string())
}

pub async fn handle_list_messages(
    State(state): State<Arc<AppState>>,
    query: Result<Query<MessageQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let config = state.bridge.config();
    let messages = read_messages(&config.msgs_file_path(), &query, &config.bridge.device_name)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "success": true,
        "count": messages.len(),
        "messages": messages,
        "channel_idx": query.channel_idx,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: Option<String>,
    pub reply_to: Option<String>,
    pub channel_idx: Option<i64>,
}

pub async fn handle_send_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let text = request
        .text
        .as_deref()
        .ok_or(ValidationError::MissingField("text"))?;
    let text = validate_message_text(text)?;
    let channel_idx = validate_channel_index(request.channel_idx.unwrap_or(0))?;

    let composed = match request.reply_to.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => format!("@[{}] {}", name, text),
        _ => text.to_string(),
    };
    let composed = validate_message_text(&composed)?;

    let index = channel_idx.to_string();
    let command = format_command(&["chan", index.as_str(), composed]);
    state.bridge.execute_command(&command, None).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Message sent successfully",
        "channel_idx": channel_idx,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpdatesQuery {
    pub last_seen: Option<String>,
}

/// Per-channel update flags for the UI's polling loop.
///
/// Channel names come from the cache, refreshed through the session when
/// stale. If the session cannot answer, the last known list (or names derived
/// from the message feed) is used so polling keeps working while the radio is down.
pub async fn handle_message_updates(
    State(state): State<Arc<AppState>>,
    query: Result<Query<UpdatesQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let last_seen = parse_last_seen(query.last_seen.as_deref())?;

    let channels = match state.channels.fresh() {
        Some(channels) => channels,
        None => match fetch_channels(&state.bridge, &state.channels).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!("Channel list unavailable for updates ({}); using fallback", e);
                state.channels.last_known().unwrap_or_default()
            }
        },
    };

    let config = state.bridge.config();
    let messages = read_messages(
        &config.msgs_file_path(),
        &MessageQuery::default(),
        &config.bridge.device_name,
    )
    .await
    .map_err(internal)?;

    Ok(Json(compute_updates(&channels, &messages, &last_seen)).into_response())
}

pub async fn handle_channels(State(state): State<Arc<AppState>>) -> ApiResult {
    let channels = fetch_channels(&state.bridge, &state.channels).await?;
    Ok(Json(json!({
        "success": true,
        "count": channels.len(),
        "channels": channels,
    }))
    .into_response())
}

pub async fn handle_status(State(state): State<Arc<AppState>>) -> ApiResult {
    let config = state.bridge.config();
    let connected = state.bridge.session().is_alive().await;
    let messages = read_messages(
        &config.msgs_file_path(),
        &MessageQuery::default(),
        &config.bridge.device_name,
    )
    .await
    .map_err(internal)?;
    Ok(Json(json!({
        "success": true,
        "connected": connected,
        "device_name": config.bridge.device_name,
        "serial_port": config.cli.serial_port,
        "tcp_host": config.cli.tcp_host,
        "message_count": messages.len(),
        "latest_message_timestamp": messages.last().map(|m| m.timestamp),
        "watchdog": state.bridge.watchdog().status(),
    }))
    .into_response())
}

pub async fn handle_get_settings(State(state): State<Arc<AppState>>) -> ApiResult {
    let settings = state.bridge.settings().load().await.map_err(internal)?;
    Ok(Json(json!({
        "success": true,
        "settings": settings,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeviceSettingsRequest {
    pub manual_add_contacts: Option<bool>,
}

/// Apply the contact-approval mode on the device, then persist it so the next
/// session's Init Script replays it.
pub async fn handle_update_settings(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeviceSettingsRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let enabled = request
        .manual_add_contacts
        .ok_or(ValidationError::MissingField("manual_add_contacts"))?;

    let output = state
        .bridge
        .execute_command(&contact_approval_command(enabled), None)
        .await?;
    let settings = state
        .bridge
        .settings()
        .set_manual_add_contacts(enabled)
        .await
        .map_err(internal)?;
    info!("manual_add_contacts set to {}", enabled);

    Ok(Json(json!({
        "success": true,
        "manual_add_contacts": settings.manual_add_contacts,
        "stdout": output.stdout,
    }))
    .into_response())
}

/// Device details from `infos`. The reply is JSON when the CLI runs in JSON
/// mode; anything else is returned as text.
pub async fn handle_device_info(State(state): State<Arc<AppState>>) -> ApiResult {
    let output = state.bridge.execute_command("infos", None).await?;
    let info = serde_json::from_str::<Value>(&output.stdout)
        .unwrap_or_else(|_| Value::String(output.stdout.clone()));
    Ok(Json(json!({
        "success": true,
        "info": info,
    }))
    .into_response())
}

/// Remove contacts not heard from for `hours` (default from config).
///
/// The body is optional; when present it must be a JSON object.
pub async fn handle_cleanup_contacts(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult {
    let request: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))?
    };
    if !request.is_object() {
        return Err(ApiError::BadRequest("Expected a JSON object".to_string()));
    }
    let hours = match request.get("hours") {
        Some(value) => validate_hours(value)?,
        None => state.bridge.config().bridge.inactive_hours.max(1),
    };

    let filter = format!("u<{}h", hours);
    let command = format_command(&["apply_to", filter.as_str(), "remove_contact"]);
    let output = state.bridge.execute_command(&command, None).await?;
    info!("Contact cleanup for {}h inactivity: {}", hours, output.stdout);

    Ok(Json(json!({
        "success": true,
        "message": format!("Cleanup completed: {}", output.stdout),
        "hours": hours,
    }))
    .into_response())
}
