//! # meshcore-bridge - HTTP Bridge for meshcore-cli
//!
//! meshcore-bridge keeps a single long-lived `meshcore-cli` process attached to a
//! MeshCore radio and exposes it over HTTP, so a web UI can drive the radio
//! without paying a process spawn (and a fresh serial handshake) per request.
//!
//! ## Features
//!
//! - **Persistent Session**: One CLI process, re-initialised with a replayable Init Script
//! - **Single-flight Queue**: Commands reach the radio strictly one at a time, in FIFO order
//! - **Output Multiplexing**: Unsolicited advert JSON is split from command replies
//!   and appended to an NDJSON event log
//! - **Supervised Restarts**: A watchdog restarts a dead session with backoff and
//!   gives up (visibly) after a configurable number of failures
//! - **Web API**: Message feed, per-channel unread tracking, channel list, device settings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshcore_bridge::bridge::Bridge;
//! use meshcore_bridge::config::Config;
//! use meshcore_bridge::http::run_http;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (config, _source) = Config::load_or_default("config.toml").await?;
//!     let bridge = Bridge::start(&config).await?;
//!     run_http(bridge.clone(), &config.http.bind).await?;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bridge`] - Session manager, output multiplexer, command queue and watchdog
//! - [`http`] - axum router for the bridge and web-facing endpoints
//! - [`meshcore`] - Parsers for CLI output and the `.msgs` message feed
//! - [`storage`] - Advert event log and persisted device settings
//! - [`config`] - Configuration loading and environment overrides
//! - [`validation`] - Request validation before anything reaches the CLI
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    HTTP API     │ ← axum handlers, JSON in/out
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │     Bridge      │ ← queue, multiplexer, watchdog
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  meshcore-cli   │ ← one child process, line-oriented stdio
//! └─────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod http;
pub mod logutil;
pub mod meshcore;
pub mod metrics;
pub mod storage;
pub mod validation;
