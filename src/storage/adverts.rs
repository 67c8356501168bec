//! Append-only advert event log.
//!
//! A single writer task drains the multiplexer's advert channel, appends each
//! event to the NDJSON file and keeps a bounded window of recent events in
//! memory for the HTTP API. The window is primed from the tail of the existing
//! file so `/adverts` survives a bridge restart.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bridge::AdvertEvent;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct AdvertLog {
    path: PathBuf,
    capacity: usize,
    recent: Arc<Mutex<VecDeque<AdvertEvent>>>,
}

impl AdvertLog {
    /// Open (or create) the log, loading up to `capacity` trailing events.
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .await
                    .map_err(|e| anyhow!("Failed to create {}: {}", dir.display(), e))?;
            }
        }
        let capacity = capacity.max(1);
        let recent = load_tail(&path, capacity).await?;
        if !recent.is_empty() {
            info!(
                "Loaded {} recent advert events from {}",
                recent.len(),
                path.display()
            );
        }
        Ok(Self {
            path,
            capacity,
            recent: Arc::new(Mutex::new(recent)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AdvertEvent>> {
        self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one event to the file and the in-memory window.
    pub async fn append(&self, event: AdvertEvent) -> Result<()> {
        let mut line = serde_json::to_string(&event)
            .map_err(|e| anyhow!("Failed to serialize advert: {}", e))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        let mut recent = self.lock();
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(event);
        metrics::inc_adverts_logged();
        Ok(())
    }

    /// Most recent events, oldest first, optionally only those after `since`.
    pub fn recent(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<AdvertEvent> {
        let recent = self.lock();
        let mut selected: Vec<AdvertEvent> = recent
            .iter()
            .rev()
            .filter(|e| since.map(|s| e.received_at > s).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Spawn the writer task. It ends when every sender is dropped, or when
    /// `shutdown` flips to true, after writing whatever is already queued.
    pub fn spawn_writer(
        &self,
        mut rx: mpsc::UnboundedReceiver<AdvertEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(event) => log.record(event).await,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            let mut drained = 0usize;
                            while let Ok(event) = rx.try_recv() {
                                log.record(event).await;
                                drained += 1;
                            }
                            if drained > 0 {
                                info!("Flushed {} queued advert(s) on shutdown", drained);
                            }
                            break;
                        }
                    }
                }
            }
            debug!("Advert writer stopped");
        })
    }

    async fn record(&self, event: AdvertEvent) {
        debug!("Advert from session {}: {}", event.session, event.payload);
        if let Err(e) = self.append(event).await {
            warn!("Failed to record advert in {}: {}", self.path.display(), e);
        }
    }
}

async fn load_tail(path: &Path, capacity: usize) -> Result<VecDeque<AdvertEvent>> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(anyhow!("Failed to read {}: {}", path.display(), e)),
    };
    let mut recent = VecDeque::with_capacity(capacity.min(1024));
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AdvertEvent>(line) {
            Ok(event) => {
                if recent.len() >= capacity {
                    recent.pop_front();
                }
                recent.push_back(event);
            }
            Err(e) => warn!(
                "Skipping malformed advert record {}:{}: {}",
                path.display(),
                lineno + 1,
                e
            ),
        }
    }
    Ok(recent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn event(name: &str, at: DateTime<Utc>) -> AdvertEvent {
        AdvertEvent {
            received_at: at,
            session: 1,
            payload: json!({"type": "ADVERTISEMENT", "adv_name": name}),
        }
    }

    #[tokio::test]
    async fn appends_ndjson_and_reloads_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("adverts.jsonl");
        let log = AdvertLog::open(&path, 2).await.expect("open");
        let now = Utc::now();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            log.append(event(name, now + Duration::seconds(i as i64)))
                .await
                .expect("append");
        }
        assert_eq!(log.len(), 2);

        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 3);
        for line in raw.lines() {
            let v: serde_json::Value = serde_json::from_str(line).expect("json line");
            assert_eq!(v["payload"]["type"], "ADVERTISEMENT");
        }

        let reopened = AdvertLog::open(&path, 2).await.expect("reopen");
        let names: Vec<_> = reopened
            .recent(10, None)
            .into_iter()
            .map(|e| e.payload["adv_name"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn recent_honours_limit_and_since() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AdvertLog::open(dir.path().join("a.jsonl"), 10)
            .await
            .expect("open");
        let t0 = Utc::now();
        for i in 0..4 {
            log.append(event(&format!("n{i}"), t0 + Duration::seconds(i)))
                .await
                .expect("append");
        }
        let last_two = log.recent(2, None);
        assert_eq!(last_two[0].payload["adv_name"], "n2");
        assert_eq!(last_two[1].payload["adv_name"], "n3");

        let after = log.recent(10, Some(t0 + Duration::seconds(1)));
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].payload["adv_name"], "n2");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("adverts.jsonl");
        let good = serde_json::to_string(&event("ok", Utc::now())).expect("ser");
        std::fs::write(&path, format!("not json\n{}\n", good)).expect("seed");
        let log = AdvertLog::open(&path, 10).await.expect("open");
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn writer_flushes_queued_events_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("adverts.jsonl");
        let log = AdvertLog::open(&path, 10).await.expect("open");
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let now = Utc::now();
        for i in 0..3 {
            tx.send(event(&format!("q{i}"), now + Duration::seconds(i)))
                .expect("send");
        }
        stop_tx.send(true).expect("signal");
        let writer = log.spawn_writer(rx, stop_rx);
        tokio::time::timeout(std::time::Duration::from_secs(2), writer)
            .await
            .expect("writer stops")
            .expect("join");

        // The sender is still alive; the writer stopped because of the signal.
        assert!(tx.send(event("late", now)).is_err());
        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 3);
        assert_eq!(log.len(), 3);
    }
}
