//! Session manager: owns the one long-lived meshcore-cli process.
//!
//! A session is spawned with piped stdio, gets its Init Script replayed once,
//! and is published only after the init responses have drained. Every start
//! gets a fresh generation number so output, pending commands and adverts can
//! be tied to the process that produced them.

use log::{debug, info, warn};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::error::BridgeError;
use super::multiplexer::{self, AdvertEvent, AdvertMatcher, PendingSlot};
use crate::config::{CliConfig, SessionConfig};
use crate::logutil::escape_log;
use crate::metrics;
use crate::storage::settings::{DeviceSettings, SettingsStore};

const CONTACT_APPROVAL_COMMAND: &str = "set manual_add_contacts";
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Build the Init Script for a new session: the configured base commands
/// followed by the persisted contact-approval mode.
pub fn init_script(base: &[String], settings: &DeviceSettings) -> Vec<String> {
    let mut script: Vec<String> = base
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty() && !c.starts_with(CONTACT_APPROVAL_COMMAND))
        .map(str::to_string)
        .collect();
    script.push(contact_approval_command(settings.manual_add_contacts));
    script
}

pub fn contact_approval_command(manual: bool) -> String {
    format!(
        "{} {}",
        CONTACT_APPROVAL_COMMAND,
        if manual { "on" } else { "off" }
    )
}

/// Liveness summary for `/health`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStatus {
    pub alive: bool,
    pub generation: Option<u64>,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
}

struct Session {
    generation: u64,
    child: Child,
    stdin: ChildStdin,
    readers: Vec<JoinHandle<()>>,
    started_at: Instant,
}

impl Session {
    /// A process whose output can no longer be read counts as dead too, so
    /// the watchdog replaces it.
    fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) if self.readers.iter().any(JoinHandle::is_finished) => {
                warn!(
                    "Session {} output reader stopped while the process is running",
                    self.generation
                );
                false
            }
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Session {} has exited: {}", self.generation, status);
                false
            }
            Err(e) => {
                warn!("Session {} status probe failed: {}", self.generation, e);
                false
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), BridgeError> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn shutdown(mut self, grace: Duration) {
        let pid = self.child.id();
        if let Err(e) = self.child.start_kill() {
            debug!("Session {} kill: {}", self.generation, e);
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(
                "Session {} (pid {:?}) stopped: {}",
                self.generation, pid, status
            ),
            Ok(Err(e)) => warn!("Session {} wait failed: {}", self.generation, e),
            Err(_) => warn!(
                "Session {} (pid {:?}) did not exit within {:?}",
                self.generation, pid, grace
            ),
        }
        // With the process gone the pipes close, so readers finish once
        // they have routed the last buffered lines.
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                reader.abort();
            }
        }
    }
}

/// Owns the subprocess lifecycle. At most one session is published at a time.
pub struct SessionManager {
    cli: CliConfig,
    timing: SessionConfig,
    settings: SettingsStore,
    matcher: Arc<AdvertMatcher>,
    slot: Arc<PendingSlot>,
    adverts: mpsc::UnboundedSender<AdvertEvent>,
    current: Mutex<Option<Session>>,
    start_lock: Mutex<()>,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(
        cli: CliConfig,
        timing: SessionConfig,
        settings: SettingsStore,
        slot: Arc<PendingSlot>,
        adverts: mpsc::UnboundedSender<AdvertEvent>,
    ) -> Self {
        let matcher = Arc::new(AdvertMatcher::new(
            cli.advert_marker_fields.clone(),
            cli.advert_event_types.clone(),
        ));
        Self {
            cli,
            timing,
            settings,
            matcher,
            slot,
            adverts,
            current: Mutex::new(None),
            start_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Spawn the CLI, replay the Init Script and publish the session.
    ///
    /// Returns the generation of the live session. Starting while a session is
    /// already alive is a no-op.
    pub async fn start(&self) -> Result<u64, BridgeError> {
        let _starting = self.start_lock.lock().await;
        if let Some(generation) = self.alive_generation().await {
            debug!("Session {} already running; start ignored", generation);
            return Ok(generation);
        }

        if let Some(device) = self.cli.required_device() {
            if !device.exists() {
                return Err(BridgeError::DeviceUnavailable(device.to_path_buf()));
            }
        }

        let settings = match self.settings.load().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to read device settings, using defaults: {}", e);
                DeviceSettings::default()
            }
        };
        let script = init_script(&self.cli.init_commands, &settings);
        let args = self.cli.command_args();
        info!(
            "Starting meshcore-cli session: {} {}",
            self.cli.binary,
            args.join(" ")
        );

        let mut child = Command::new(&self.cli.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                binary: self.cli.binary.clone(),
                source,
            })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stdin, stdout, stderr) = match (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => {
                let _ = child.start_kill();
                return Err(BridgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "meshcore-cli stdio was not captured",
                )));
            }
        };

        let readers = vec![
            tokio::spawn(multiplexer::run_stdout(
                stdout,
                generation,
                self.matcher.clone(),
                self.slot.clone(),
                self.adverts.clone(),
            )),
            tokio::spawn(multiplexer::run_stderr(
                stderr,
                generation,
                self.slot.clone(),
            )),
        ];

        let mut session = Session {
            generation,
            child,
            stdin,
            readers,
            started_at: Instant::now(),
        };

        for command in &script {
            debug!("init[{}] > {}", generation, escape_log(command));
            if let Err(e) = session.write_line(command).await {
                session.shutdown(self.timing.stop_timeout()).await;
                return Err(e);
            }
        }

        tokio::time::sleep(self.timing.init_settle()).await;
        match session.child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let status = status.to_string();
                session.shutdown(self.timing.stop_timeout()).await;
                return Err(BridgeError::SessionExited { status });
            }
            Err(e) => {
                session.shutdown(self.timing.stop_timeout()).await;
                return Err(BridgeError::Io(e));
            }
        }

        metrics::inc_session_starts();
        info!(
            "meshcore-cli session {} ready (pid {:?}, {} init commands)",
            generation,
            session.child.id(),
            script.len()
        );
        *self.current.lock().await = Some(session);
        Ok(generation)
    }

    /// Terminate the current session, if any, and release its pipes.
    pub async fn stop(&self) {
        let taken = self.current.lock().await.take();
        if let Some(session) = taken {
            session.shutdown(self.timing.stop_timeout()).await;
        }
    }

    /// Stop whatever is there and start a fresh session.
    pub async fn restart(&self) -> Result<u64, BridgeError> {
        self.stop().await;
        self.start().await
    }

    pub async fn is_alive(&self) -> bool {
        self.alive_generation().await.is_some()
    }

    /// Generation of the published session if its process is still running.
    pub async fn alive_generation(&self) -> Option<u64> {
        let mut guard = self.current.lock().await;
        let running = guard.as_mut().map(Session::is_running).unwrap_or(false);
        match guard.as_ref() {
            Some(session) if running => Some(session.generation),
            _ => None,
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let mut guard = self.current.lock().await;
        let running = guard.as_mut().map(Session::is_running).unwrap_or(false);
        match guard.as_ref() {
            Some(session) if running => SessionStatus {
                alive: true,
                generation: Some(session.generation),
                pid: session.child.id(),
                uptime_seconds: Some(session.started_at.elapsed().as_secs()),
            },
            Some(session) => SessionStatus {
                alive: false,
                generation: Some(session.generation),
                pid: None,
                uptime_seconds: None,
            },
            None => SessionStatus {
                alive: false,
                generation: None,
                pid: None,
                uptime_seconds: None,
            },
        }
    }

    /// Write one command line to the session identified by `generation`.
    ///
    /// Fails with `NotInitialized` if that session is no longer the live one.
    pub async fn write_line(&self, generation: u64, line: &str) -> Result<(), BridgeError> {
        let mut guard = self.current.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(BridgeError::NotInitialized);
        };
        if session.generation != generation || !session.is_running() {
            return Err(BridgeError::NotInitialized);
        }
        debug!("cli[{}] > {}", generation, escape_log(line));
        session.write_line(line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_script_appends_contact_approval_mode() {
        let base = vec![
            "msgs_subscribe".to_string(),
            " ".to_string(),
            "set manual_add_contacts on".to_string(),
            "set json_log_rx on".to_string(),
        ];
        let manual = DeviceSettings {
            manual_add_contacts: true,
            ..Default::default()
        };
        assert_eq!(
            init_script(&base, &manual),
            vec![
                "msgs_subscribe",
                "set json_log_rx on",
                "set manual_add_contacts on"
            ]
        );
        assert_eq!(
            init_script(&base, &DeviceSettings::default()).last().map(String::as_str),
            Some("set manual_add_contacts off")
        );
    }
}
