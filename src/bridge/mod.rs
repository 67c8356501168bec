//! # Bridge Module - Persistent meshcore-cli Session
//!
//! The bridge keeps one long-lived meshcore-cli process open and multiplexes
//! HTTP requests onto it.
//!
//! ## Components
//!
//! - [`session`] - spawns the CLI, replays the Init Script, probes liveness
//! - [`multiplexer`] - splits CLI output into advert events and command replies
//! - [`queue`] - FIFO single-flight command execution with quiet-period completion
//! - [`watchdog`] - restarts a dead session with backoff and a give-up threshold
//!
//! ## Data flow
//!
//! ```text
//!  HTTP handler ──execute_command──▶ CommandQueue ──stdin──▶ meshcore-cli
//!        ▲                                │                      │
//!        └──────── oneshot result ◀── PendingSlot ◀── stdout ────┤
//!                                                                │
//!                         AdvertLog ◀── advert channel ◀─────────┘
//! ```
//!
//! [`Bridge`] wires these together. It is constructed once by the server's
//! startup routine and torn down with [`Bridge::shutdown`]; nothing here is a
//! process-wide singleton.

pub mod error;
pub mod multiplexer;
pub mod queue;
pub mod session;
pub mod watchdog;

pub use error::BridgeError;
pub use multiplexer::AdvertEvent;
pub use queue::{CommandOutput, CommandQueue, CommandResult};
pub use session::{SessionManager, SessionStatus};
pub use watchdog::{RestartPolicy, WatchdogHandle, WatchdogState, WatchdogStatus};

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::metrics;
use crate::storage::adverts::AdvertLog;
use crate::storage::settings::SettingsStore;
use multiplexer::PendingSlot;
use watchdog::Watchdog;

/// Snapshot served by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub session: SessionStatus,
    pub watchdog: WatchdogStatus,
    pub uptime_seconds: u64,
    pub adverts_in_memory: usize,
    pub metrics: metrics::Snapshot,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.session.alive
    }
}

pub struct Bridge {
    config: Config,
    session: Arc<SessionManager>,
    queue: CommandQueue,
    adverts: AdvertLog,
    watchdog: WatchdogHandle,
    shutdown_tx: watch::Sender<bool>,
    advert_stop_tx: watch::Sender<bool>,
    tasks: Mutex<Option<BackgroundTasks>>,
    started_at: Instant,
}

struct BackgroundTasks {
    watchdog: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    advert_writer: JoinHandle<()>,
}

/// How long shutdown waits for the watchdog and the advert writer to finish.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(2);

impl Bridge {
    /// Open storage, start the first session and spawn the dispatcher and watchdog.
    ///
    /// A failed first session start is logged, not returned: the watchdog
    /// keeps retrying under its restart policy.
    pub async fn start(config: &Config) -> Result<Arc<Self>> {
        let adverts = AdvertLog::open(config.adverts_file_path(), config.storage.recent_adverts)
            .await
            .map_err(|e| anyhow!("Failed to open advert log: {}", e))?;
        let (advert_stop_tx, advert_stop_rx) = watch::channel(false);
        let (advert_tx, advert_rx) = mpsc::unbounded_channel();
        let advert_writer = adverts.spawn_writer(advert_rx, advert_stop_rx);

        let slot = Arc::new(PendingSlot::new());
        let session = Arc::new(SessionManager::new(
            config.cli.clone(),
            config.session.clone(),
            SettingsStore::new(config.settings_file_path()),
            slot.clone(),
            advert_tx,
        ));

        match session.start().await {
            Ok(generation) => info!("Initial session {} is up", generation),
            Err(e) => warn!(
                "Initial meshcore-cli start failed: {} (watchdog will retry)",
                e
            ),
        }

        let (queue, dispatcher) = CommandQueue::spawn(
            session.clone(),
            slot,
            config.session.quiet_period(),
            config.session.command_timeout(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (watchdog, watchdog_task) = Watchdog::new(
            session.clone(),
            RestartPolicy::from_config(&config.watchdog),
            config.watchdog.interval(),
            shutdown_rx,
        )
        .spawn();

        Ok(Arc::new(Self {
            config: config.clone(),
            session,
            queue,
            adverts,
            watchdog,
            shutdown_tx,
            advert_stop_tx,
            tasks: Mutex::new(Some(BackgroundTasks {
                watchdog: watchdog_task,
                dispatcher,
                advert_writer,
            })),
            started_at: Instant::now(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn adverts(&self) -> &AdvertLog {
        &self.adverts
    }

    pub fn settings(&self) -> &SettingsStore {
        self.session.settings()
    }

    pub fn watchdog(&self) -> &WatchdogHandle {
        &self.watchdog
    }

    /// Run one command on the session; `None` uses the configured default timeout.
    pub async fn execute_command(&self, command: &str, timeout: Option<Duration>) -> CommandResult {
        self.queue.execute_command(command, timeout).await
    }

    pub async fn health(&self) -> HealthReport {
        let session = self.session.status().await;
        let watchdog = self.watchdog.status();
        let status = match (session.alive, watchdog.state) {
            (true, _) => "healthy",
            (false, WatchdogState::GaveUp) => "failed",
            (false, _) => "degraded",
        };
        HealthReport {
            status,
            session,
            watchdog,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            adverts_in_memory: self.adverts.len(),
            metrics: metrics::snapshot(),
        }
    }

    /// Stop the watchdog, then the session, then the background tasks.
    ///
    /// Adverts already queued when the session stops are still written to
    /// the log. Calling this twice is harmless.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        let _ = self.shutdown_tx.send(true);
        let Some(mut tasks) = self.tasks.lock().await.take() else {
            self.session.stop().await;
            return;
        };
        if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut tasks.watchdog)
            .await
            .is_err()
        {
            warn!("Watchdog did not stop in time");
            tasks.watchdog.abort();
        }
        self.session.stop().await;
        tasks.dispatcher.abort();
        let _ = self.advert_stop_tx.send(true);
        if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut tasks.advert_writer)
            .await
            .is_err()
        {
            warn!("Advert writer did not drain in time");
            tasks.advert_writer.abort();
        }
    }
}
