#![cfg(unix)]
mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{clear_pending_contacts, fake_config, stdin_lines};
use meshcore_bridge::bridge::Bridge;
use meshcore_bridge::config::Config;
use meshcore_bridge::http::{build_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn start(dir: &std::path::Path) -> (Config, Arc<Bridge>, Router) {
    let config = fake_config(dir);
    let bridge = Bridge::start(&config).await.expect("bridge");
    let app = build_router(AppState::new(bridge.clone()));
    (config, bridge, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    let parsed = serde_json::from_slice(&body).expect("json body");
    (status, parsed)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn add_pending_rejects_empty_selector_without_touching_the_cli() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;

    let (status, body) = send(&app, post_json("/add_pending", json!({"selector": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap_or_default().contains("selector"));

    let (status, _) = send(&app, post_json("/add_pending", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(!stdin_lines(dir.path()).iter().any(|l| l.starts_with("add_pending")));
    bridge.shutdown().await;
}

#[tokio::test]
async fn add_pending_returns_cli_output_unmodified() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;

    let (status, body) = send(
        &app,
        post_json("/add_pending", json!({"selector": "Skyllancer"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["stdout"], "added Skyllancer");
    assert_eq!(body["stderr"], "");
    assert_eq!(body["returncode"], 0);
    bridge.shutdown().await;
}

#[tokio::test]
async fn pending_contacts_are_parsed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;

    let (status, body) = send(&app, get("/pending_contacts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(
        body["pending"],
        json!([{"name": "Skyllancer", "public_key": "f9ef123abc"}])
    );
    assert_eq!(body["raw_stdout"], "Skyllancer: f9ef 123abc\ngarbage line");
    bridge.shutdown().await;
}

#[tokio::test]
async fn pending_contacts_with_no_output_is_an_empty_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;
    clear_pending_contacts(dir.path());

    let (status, body) = send(&app, get("/pending_contacts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"success": true, "pending": [], "raw_stdout": ""})
    );
    bridge.shutdown().await;
}

#[tokio::test]
async fn health_reports_live_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["session"]["alive"], true);
    assert_eq!(body["session"]["generation"], 1);
    assert_eq!(body["watchdog"]["state"], "healthy");
    assert!(body["metrics"]["session_starts"].as_u64().unwrap_or(0) >= 1);
    bridge.shutdown().await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["session"]["alive"], false);
}

#[tokio::test]
async fn cli_passthrough_and_error_mapping() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;

    let (status, body) = send(&app, post_json("/cli", json!({"args": ["echo", "hello"]}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stdout"], "hello");

    let (status, body) = send(&app, post_json("/cli", json!({"args": "echo a\nreboot"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(!stdin_lines(dir.path()).iter().any(|l| l == "reboot"));

    let (status, body) = send(
        &app,
        post_json("/cli", json!({"args": "slow", "timeout": 0.4})),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["code"], "command_timeout");
    assert_eq!(body["returncode"], -1);

    bridge.shutdown().await;
    let (status, body) = send(&app, post_json("/cli", json!({"args": "infos"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "session_not_initialized");
}

#[tokio::test]
async fn adverts_endpoint_serves_logged_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;

    bridge
        .execute_command("advert_then_reply", None)
        .await
        .expect("command");
    let adverts = bridge.adverts().clone();
    assert!(common::wait_until(std::time::Duration::from_secs(2), || !adverts.is_empty()).await);

    let (status, body) = send(&app, get("/adverts?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["adverts"][0]["payload"]["adv_name"], "Bob");
    bridge.shutdown().await;
}

fn seed_messages(config: &Config) {
    let feed = [
        json!({"type":"CHAN","channel_idx":0,"timestamp":1000,"text":"Alice: hi"}),
        json!({"type":"SENT_CHAN","channel_idx":0,"timestamp":1100,"text":"hello back"}),
        json!({"type":"CHAN","channel_idx":0,"timestamp":1200,"text":"Carol: news"}),
        json!({"type":"CHAN","channel_idx":1,"timestamp":1300,"text":"Dan: trail closed"}),
    ]
    .iter()
    .map(Value::to_string)
    .collect::<Vec<_>>()
    .join("\n");
    std::fs::write(config.msgs_file_path(), feed).expect("seed msgs");
}

#[tokio::test]
async fn message_updates_report_unread_per_channel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, bridge, app) = start(dir.path()).await;
    seed_messages(&config);

    // last_seen={"0":1000,"1":1300}
    let (status, body) = send(
        &app,
        get("/api/messages/updates?last_seen=%7B%220%22%3A1000%2C%221%22%3A1300%7D"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let channels = body["channels"].as_array().expect("channels");
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0]["name"], "Public");
    assert_eq!(channels[0]["has_updates"], true);
    assert_eq!(channels[0]["latest_timestamp"], 1200);
    assert_eq!(channels[0]["unread_count"], 1);
    assert_eq!(channels[1]["name"], "hiking");
    assert_eq!(channels[1]["has_updates"], false);
    assert_eq!(channels[1]["unread_count"], 0);
    assert_eq!(body["total_unread"], 1);

    let (status, _) = send(&app, get("/api/messages/updates?last_seen=nope")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    bridge.shutdown().await;
}

#[tokio::test]
async fn message_feed_and_send() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, bridge, app) = start(dir.path()).await;
    seed_messages(&config);

    let (status, body) = send(&app, get("/api/messages?channel_idx=0&limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["messages"][0]["is_own"], true);
    assert_eq!(body["messages"][0]["sender"], "TestNode");
    assert_eq!(body["messages"][1]["sender"], "Carol");

    let (status, body) = send(
        &app,
        post_json(
            "/api/messages",
            json!({"text": "on my way", "reply_to": "Carol", "channel_idx": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["channel_idx"], 1);
    assert!(stdin_lines(dir.path())
        .iter()
        .any(|l| l == "chan 1 \"@[Carol] on my way\""));

    let (status, _) = send(
        &app,
        post_json("/api/messages", json!({"text": "x".repeat(201)})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send(
        &app,
        post_json("/api/messages", json!({"text": "hi", "channel_idx": 9})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    bridge.shutdown().await;
}

#[tokio::test]
async fn device_settings_toggle_runs_command_and_persists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, bridge, app) = start(dir.path()).await;

    let (status, body) = send(
        &app,
        post_json("/api/device/settings", json!({"manual_add_contacts": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["manual_add_contacts"], true);
    assert!(stdin_lines(dir.path())
        .iter()
        .any(|l| l == "set manual_add_contacts on"));

    let saved: Value = serde_json::from_str(
        &std::fs::read_to_string(config.settings_file_path()).expect("settings file"),
    )
    .expect("settings json");
    assert_eq!(saved["manual_add_contacts"], true);

    let (status, body) = send(&app, get("/api/device/settings")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settings"]["manual_add_contacts"], true);

    let (status, _) = send(&app, post_json("/api/device/settings", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    bridge.shutdown().await;
}

#[tokio::test]
async fn channels_and_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (config, bridge, app) = start(dir.path()).await;
    seed_messages(&config);

    let (status, body) = send(&app, get("/api/channels")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["channels"][0]["key"], "8b3387e9c5cdea6ac9e5edbaa115cd72");

    let (status, body) = send(&app, get("/api/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], true);
    assert_eq!(body["device_name"], "TestNode");
    assert_eq!(body["message_count"], 4);
    assert_eq!(body["latest_message_timestamp"], 1300);
    bridge.shutdown().await;
}

#[tokio::test]
async fn device_info_returns_infos_reply() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;

    let (status, body) = send(&app, get("/api/device/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["info"]["name"], "FakeNode");
    assert_eq!(body["info"]["tx_power"], 22);

    bridge.shutdown().await;
    let (status, body) = send(&app, get("/api/device/info")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn contact_cleanup_validates_hours_and_runs_filter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_config, bridge, app) = start(dir.path()).await;

    let (status, body) = send(&app, post_json("/api/contacts/cleanup", json!({"hours": 24}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["hours"], 24);
    assert_eq!(body["message"], "Cleanup completed: removed 2 contacts");

    let empty = Request::builder()
        .method("POST")
        .uri("/api/contacts/cleanup")
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&app, empty).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hours"], 48);

    for bad in [json!({"hours": 0}), json!({"hours": "12"}), json!({"hours": 1.5}), json!([1])] {
        let (status, body) = send(&app, post_json("/api/contacts/cleanup", bad.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{bad}");
        assert_eq!(body["success"], false);
    }

    let sent: Vec<String> = stdin_lines(dir.path())
        .into_iter()
        .filter(|l| l.starts_with("apply_to"))
        .collect();
    assert_eq!(sent, vec!["apply_to u<24h remove_contact", "apply_to u<48h remove_contact"]);
    bridge.shutdown().await;
}
