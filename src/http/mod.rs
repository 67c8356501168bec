//! # HTTP API
//!
//! Two route groups share one axum router:
//!
//! - [`bridge_api`] - the bridge surface: `/cli` passthrough, `/health`,
//!   `/pending_contacts`, `/add_pending`, `/adverts`
//! - [`web_api`] - the `/api/*` endpoints the web UI polls (message feed,
//!   per-channel updates, channels, status, device info and settings,
//!   contact cleanup)
//!
//! Handlers are a translation layer over [`Bridge`]; the only state they add
//! is a short-lived channel list cache.
//!
//! Errors are always JSON with `success: false`. Status codes: validation 400,
//! no session 503, command timeout 504, anything else 500.

pub mod bridge_api;
pub mod web_api;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::bridge::{Bridge, BridgeError};
use crate::validation::ValidationError;

/// Shared handler state.
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub channels: web_api::ChannelCache,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            channels: web_api::ChannelCache::default(),
        })
    }
}

/// Error type returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Bridge(BridgeError),
    Validation(ValidationError),
    BadRequest(String),
    Internal(String),
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Validation(v) => ApiError::Validation(v),
            other => ApiError::Bridge(other),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Bridge(BridgeError::NotInitialized) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Bridge(BridgeError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Bridge(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> Value {
        match self {
            ApiError::Bridge(e) => {
                let stdout = match e {
                    BridgeError::Timeout { partial_stdout, .. } => partial_stdout.clone(),
                    _ => String::new(),
                };
                json!({
                    "success": false,
                    "error": e.to_string(),
                    "code": e.code(),
                    "stdout": stdout,
                    "stderr": e.to_string(),
                    "returncode": -1,
                })
            }
            ApiError::Validation(e) => json!({
                "success": false,
                "error": e.to_string(),
                "code": "validation",
            }),
            ApiError::BadRequest(msg) => json!({
                "success": false,
                "error": msg,
                "code": "bad_request",
            }),
            ApiError::Internal(msg) => json!({
                "success": false,
                "error": msg,
                "code": "internal",
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {:?}", status, self);
        }
        (status, Json(self.body())).into_response()
    }
}

pub type ApiResult = std::result::Result<Response, ApiError>;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/cli", post(bridge_api::handle_cli))
        .route("/health", get(bridge_api::handle_health))
        .route("/pending_contacts", get(bridge_api::handle_pending_contacts))
        .route("/add_pending", post(bridge_api::handle_add_pending))
        .route("/adverts", get(bridge_api::handle_adverts))
        .route(
            "/api/messages",
            get(web_api::handle_list_messages).post(web_api::handle_send_message),
        )
        .route("/api/messages/updates", get(web_api::handle_message_updates))
        .route("/api/channels", get(web_api::handle_channels))
        .route("/api/status", get(web_api::handle_status))
        .route("/api/device/info", get(web_api::handle_device_info))
        .route("/api/contacts/cleanup", post(web_api::handle_cleanup_contacts))
        .route(
            "/api/device/settings",
            get(web_api::handle_get_settings).post(web_api::handle_update_settings),
        )
        .with_state(state)
}

/// Serve the API until Ctrl-C. The caller shuts the bridge down afterwards.
pub async fn run_http(bridge: Arc<Bridge>, bind: &str) -> Result<()> {
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}': expected host:port"))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind HTTP API on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve HTTP listen address")?;
    info!("HTTP API listening on {}", local_addr);

    let app = build_router(AppState::new(bridge));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received, stopping HTTP API");
        })
        .await
        .context("HTTP API exited unexpectedly")?;
    Ok(())
}
