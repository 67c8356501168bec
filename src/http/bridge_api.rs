//! Bridge endpoints: raw command passthrough plus the contact-approval helpers.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{ApiError, ApiResult, AppState};
use crate::bridge::CommandOutput;
use crate::logutil::escape_log;
use crate::meshcore::parser::{format_command, parse_pending_contacts};
use crate::validation::{validate_command_line, validate_selector, ValidationError};

/// Upper bound for a caller-supplied `/cli` timeout.
const MAX_CLI_TIMEOUT_SECS: f64 = 300.0;
const DEFAULT_ADVERT_LIMIT: usize = 100;

/// `args` may be a word list (quoted as needed) or a ready command line.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CliArgs {
    Words(Vec<String>),
    Line(String),
}

#[derive(Debug, Deserialize)]
pub struct CliRequest {
    pub args: Option<CliArgs>,
    /// Seconds.
    pub timeout: Option<f64>,
}

impl CliRequest {
    fn command_line(&self) -> Result<String, ValidationError> {
        let line = match &self.args {
            None => return Err(ValidationError::MissingField("args")),
            Some(CliArgs::Words(words)) => format_command(words),
            Some(CliArgs::Line(line)) => line.clone(),
        };
        validate_command_line(&line).map(str::to_string)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(|t| Duration::from_secs_f64(t.min(MAX_CLI_TIMEOUT_SECS)))
    }
}

fn command_response(output: CommandOutput) -> axum::response::Response {
    Json(json!({
        "success": output.returncode == 0,
        "stdout": output.stdout,
        "stderr": output.stderr,
        "returncode": output.returncode,
    }))
    .into_response()
}

pub async fn handle_cli(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CliRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let command = request.command_line()?;
    debug!("/cli {}", escape_log(&command));
    let output = state
        .bridge
        .execute_command(&command, request.timeout())
        .await?;
    Ok(command_response(output))
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.bridge.health().await;
    let status = if report.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::to_value(&report).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((status, Json(body)).into_response())
}

pub async fn handle_pending_contacts(State(state): State<Arc<AppState>>) -> ApiResult {
    let output = state
        .bridge
        .execute_command("pending_contacts", None)
        .await?;
    let pending = parse_pending_contacts(&output.stdout);
    Ok(Json(json!({
        "success": true,
        "pending": pending,
        "raw_stdout": output.stdout,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct AddPendingRequest {
    pub selector: Option<String>,
}

pub async fn handle_add_pending(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AddPendingRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload.map_err(|_| ValidationError::EmptySelector)?;
    let selector = validate_selector(request.selector.as_deref().unwrap_or_default())?;
    let command = format_command(&["add_pending", selector]);
    let output = state.bridge.execute_command(&command, None).await?;
    Ok(command_response(output))
}

#[derive(Debug, Deserialize)]
pub struct AdvertsQuery {
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
}

pub async fn handle_adverts(
    State(state): State<Arc<AppState>>,
    query: Result<Query<AdvertsQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_ADVERT_LIMIT);
    let adverts = state.bridge.adverts().recent(limit, query.since);
    Ok(Json(json!({
        "success": true,
        "count": adverts.len(),
        "adverts": adverts,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_request_accepts_words_or_line() {
        let words: CliRequest =
            serde_json::from_str(r#"{"args": ["chan", "0", "hi there"]}"#).expect("words");
        assert_eq!(words.command_line(), Ok("chan 0 \"hi there\"".to_string()));

        let line: CliRequest =
            serde_json::from_str(r#"{"args": "infos", "timeout": 2.5}"#).expect("line");
        assert_eq!(line.command_line(), Ok("infos".to_string()));
        assert_eq!(line.timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn cli_request_rejects_missing_or_injected_commands() {
        let missing: CliRequest = serde_json::from_str("{}").expect("empty");
        assert_eq!(
            missing.command_line(),
            Err(ValidationError::MissingField("args"))
        );
        let injected: CliRequest =
            serde_json::from_str(r#"{"args": "infos\nreboot"}"#).expect("line");
        assert_eq!(
            injected.command_line(),
            Err(ValidationError::ControlCharacters)
        );
    }

    #[test]
    fn cli_timeout_ignores_nonsense_and_caps() {
        let zero: CliRequest = serde_json::from_str(r#"{"args":"x","timeout":0}"#).expect("req");
        assert_eq!(zero.timeout(), None);
        let huge: CliRequest =
            serde_json::from_str(r#"{"args":"x","timeout":100000}"#).expect("req");
        assert_eq!(huge.timeout(), Some(Duration::from_secs(300)));
    }
}
