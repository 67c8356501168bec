//! Channel message feed read from meshcore-cli's `.msgs` file.
//!
//! meshcore-cli appends every received (`CHAN`) and sent (`SENT_CHAN`) channel
//! message to `<config_dir>/<device>.msgs` as one JSON object per line. The
//! bridge only reads this file; it never writes it.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::fs;

use super::parser::Channel;
use crate::validation::ValidationError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub content: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub datetime: Option<String>,
    pub is_own: bool,
    pub snr: Option<f64>,
    pub path_len: Option<i64>,
    pub channel_idx: u8,
}

/// Filters for [`read_messages`]. `offset` drops that many newest messages
/// before `limit` keeps the newest `limit` of what remains.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub days: Option<u32>,
    pub channel_idx: Option<u8>,
}

fn json_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

/// Interpret one `.msgs` record. Returns `None` for anything that is not a
/// non-empty channel message.
pub fn parse_message(record: &Value, device_name: &str) -> Option<ChatMessage> {
    let kind = record.get("type")?.as_str()?;
    let is_own = match kind {
        "CHAN" => false,
        "SENT_CHAN" => true,
        _ => return None,
    };
    let text = record.get("text").and_then(Value::as_str)?.trim();
    if text.is_empty() {
        return None;
    }
    let channel_idx = record
        .get("channel_idx")
        .and_then(json_i64)
        .and_then(|i| u8::try_from(i).ok())
        .unwrap_or(0);
    let timestamp = record.get("timestamp").and_then(json_i64).unwrap_or(0);

    let (sender, content) = if is_own {
        let name = record
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(device_name);
        (name.to_string(), text.to_string())
    } else {
        match text.split_once(':') {
            Some((sender, body)) => (sender.trim().to_string(), body.trim().to_string()),
            None => ("Unknown".to_string(), text.to_string()),
        }
    };

    let datetime = if timestamp > 0 {
        DateTime::<Utc>::from_timestamp(timestamp, 0).map(|dt| dt.to_rfc3339())
    } else {
        None
    };

    Some(ChatMessage {
        sender,
        content,
        timestamp,
        datetime,
        is_own,
        snr: record.get("SNR").and_then(Value::as_f64),
        path_len: record.get("path_len").and_then(json_i64),
        channel_idx,
    })
}

/// Parse a whole `.msgs` document, skipping malformed lines.
pub fn parse_messages(content: &str, device_name: &str, channel: Option<u8>) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(lineno, line)| match serde_json::from_str::<Value>(line) {
            Ok(record) => parse_message(&record, device_name),
            Err(e) => {
                warn!("Invalid JSON at line {}: {}", lineno + 1, e);
                None
            }
        })
        .filter(|m| channel.map(|c| m.channel_idx == c).unwrap_or(true))
        .collect();
    messages.sort_by_key(|m| m.timestamp);
    messages
}

/// Apply `days`, `offset` and `limit` to messages sorted oldest first.
pub fn apply_query(
    mut messages: Vec<ChatMessage>,
    query: &MessageQuery,
    now: DateTime<Utc>,
) -> Vec<ChatMessage> {
    if let Some(days) = query.days.filter(|d| *d > 0) {
        let cutoff = (now - Duration::days(i64::from(days))).timestamp();
        messages.retain(|m| m.timestamp >= cutoff);
    }
    if query.offset > 0 {
        let keep = messages.len().saturating_sub(query.offset);
        messages.truncate(keep);
    }
    if let Some(limit) = query.limit.filter(|l| *l > 0) {
        let skip = messages.len().saturating_sub(limit);
        messages.drain(..skip);
    }
    messages
}

/// Read and filter the `.msgs` file. A missing file is an empty feed.
pub async fn read_messages(
    path: &Path,
    query: &MessageQuery,
    device_name: &str,
) -> Result<Vec<ChatMessage>> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Messages file not found: {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(anyhow!("Failed to read {}: {}", path.display(), e)),
    };
    let messages = parse_messages(&content, device_name, query.channel_idx);
    let messages = apply_query(messages, query, Utc::now());
    debug!("Loaded {} messages from {}", messages.len(), path.display());
    Ok(messages)
}

/// Parse the `last_seen` query parameter: a JSON object mapping channel index
/// strings to unix timestamps. Absent or blank means nothing has been seen.
pub fn parse_last_seen(raw: Option<&str>) -> Result<HashMap<u8, i64>, ValidationError> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(HashMap::new()),
        Some(r) => r,
    };
    let invalid = |why: &str| ValidationError::InvalidLastSeen(why.to_string());
    let value: Value = serde_json::from_str(raw).map_err(|e| invalid(&e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| invalid("expected a JSON object"))?;
    object
        .iter()
        .map(|(key, ts)| {
            let index: u8 = key
                .trim()
                .parse()
                .map_err(|_| invalid(&format!("bad channel index '{}'", key)))?;
            let ts = json_i64(ts)
                .ok_or_else(|| invalid(&format!("timestamp for channel {} is not a number", key)))?;
            Ok((index, ts))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelUpdate {
    pub index: u8,
    pub name: String,
    pub has_updates: bool,
    pub latest_timestamp: i64,
    pub unread_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatesSummary {
    pub success: bool,
    pub channels: Vec<ChannelUpdate>,
    pub total_unread: usize,
}

pub fn fallback_channel_name(index: u8) -> String {
    if index == 0 {
        "Public".to_string()
    } else {
        format!("Channel {}", index)
    }
}

/// Per-channel update state for the web UI's polling loop.
///
/// Reports every known channel plus any channel index that only appears in
/// the message feed. Own messages never count as unread.
pub fn compute_updates(
    channels: &[Channel],
    messages: &[ChatMessage],
    last_seen: &HashMap<u8, i64>,
) -> UpdatesSummary {
    let mut names: BTreeMap<u8, String> = channels
        .iter()
        .map(|c| (c.index, c.name.clone()))
        .collect();
    for m in messages {
        names
            .entry(m.channel_idx)
            .or_insert_with(|| fallback_channel_name(m.channel_idx));
    }

    let channels: Vec<ChannelUpdate> = names
        .into_iter()
        .map(|(index, name)| {
            let seen = last_seen.get(&index).copied().unwrap_or(0);
            let in_channel = messages.iter().filter(|m| m.channel_idx == index);
            let latest_timestamp = in_channel.clone().map(|m| m.timestamp).max().unwrap_or(0);
            let unread_count = in_channel
                .filter(|m| !m.is_own && m.timestamp > seen)
                .count();
            ChannelUpdate {
                index,
                name,
                has_updates: latest_timestamp > seen,
                latest_timestamp,
                unread_count,
            }
        })
        .collect();
    let total_unread = channels.iter().map(|c| c.unread_count).sum();
    UpdatesSummary {
        success: true,
        channels,
        total_unread,
    }
}
