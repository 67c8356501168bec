//! Watchdog: keeps exactly one healthy session running.
//!
//! Every `interval` the session is probed. When it is found dead the watchdog
//! restarts it, retrying with exponential backoff. After `max_attempts`
//! consecutive failed restarts it stops trying and reports `gave_up` until the
//! session is seen alive again. Commands caught by a crash are not replayed;
//! they time out in the queue.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use super::session::SessionManager;
use crate::config::WatchdogConfig;
use crate::metrics;

/// Backoff and give-up policy for supervised restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before giving up; 0 means never give up.
    pub max_attempts: u32,
}

impl RestartPolicy {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts != 0 && failures >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    Healthy,
    Restarting,
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogStatus {
    pub state: WatchdogState,
    pub consecutive_failures: u32,
    /// Successful restarts since the bridge started.
    pub restarts: u64,
    pub last_error: Option<String>,
}

impl Default for WatchdogStatus {
    fn default() -> Self {
        Self {
            state: WatchdogState::Healthy,
            consecutive_failures: 0,
            restarts: 0,
            last_error: None,
        }
    }
}

/// Shared view of the watchdog for `/health`.
#[derive(Debug, Clone, Default)]
pub struct WatchdogHandle {
    status: Arc<Mutex<WatchdogStatus>>,
}

impl WatchdogHandle {
    fn lock(&self) -> MutexGuard<'_, WatchdogStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> WatchdogStatus {
        self.lock().clone()
    }
}

pub struct Watchdog {
    session: Arc<SessionManager>,
    policy: RestartPolicy,
    interval: Duration,
    handle: WatchdogHandle,
    shutdown: watch::Receiver<bool>,
}

impl Watchdog {
    pub fn new(
        session: Arc<SessionManager>,
        policy: RestartPolicy,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            session,
            policy,
            interval,
            handle: WatchdogHandle::default(),
            shutdown,
        }
    }

    pub fn handle(&self) -> WatchdogHandle {
        self.handle.clone()
    }

    pub fn spawn(self) -> (WatchdogHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self) {
        info!(
            "Watchdog started (interval {:?}, backoff {:?}..{:?}, max attempts {})",
            self.interval,
            self.policy.initial_backoff,
            self.policy.max_backoff,
            self.policy.max_attempts
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || self.stopping() {
                        break;
                    }
                    continue;
                }
            }
            if self.stopping() {
                break;
            }

            if self.session.is_alive().await {
                let mut status = self.handle.lock();
                if status.state != WatchdogState::Healthy || status.consecutive_failures > 0 {
                    info!("Session healthy again");
                    status.state = WatchdogState::Healthy;
                    status.consecutive_failures = 0;
                }
                continue;
            }

            if self.handle.lock().state == WatchdogState::GaveUp {
                debug!("Session down; watchdog has given up");
                continue;
            }

            warn!("meshcore-cli session is not alive; restarting");
            if !self.restart_with_backoff().await {
                break;
            }
        }
        info!("Watchdog stopped");
    }

    /// Retry until a restart succeeds, the policy gives up, or shutdown.
    /// Returns false on shutdown.
    async fn restart_with_backoff(&mut self) -> bool {
        self.handle.lock().state = WatchdogState::Restarting;
        loop {
            match self.session.restart().await {
                Ok(generation) => {
                    metrics::inc_session_restarts();
                    let mut status = self.handle.lock();
                    status.state = WatchdogState::Healthy;
                    status.consecutive_failures = 0;
                    status.restarts += 1;
                    info!(
                        "Session restarted as generation {} (restart #{})",
                        generation, status.restarts
                    );
                    return true;
                }
                Err(e) => {
                    metrics::inc_restart_failures();
                    let failures = {
                        let mut status = self.handle.lock();
                        status.consecutive_failures += 1;
                        status.last_error = Some(e.to_string());
                        status.consecutive_failures
                    };
                    if self.policy.exhausted(failures) {
                        error!(
                            "Giving up on meshcore-cli after {} consecutive failed restarts: {}",
                            failures, e
                        );
                        self.handle.lock().state = WatchdogState::GaveUp;
                        return true;
                    }
                    let delay = self.policy.delay_for(failures);
                    warn!(
                        "Session restart failed (attempt {}): {}; retrying in {:?}",
                        failures, e, delay
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() || self.stopping() {
                                return false;
                            }
                        }
                    }
                }
            }
        }
    }
}
