//! Command queue: FIFO, single-flight execution against the one session.
//!
//! Callers enqueue and get a oneshot receiver back. One dispatcher task pops
//! jobs in submission order, writes each to the session's stdin and waits for
//! the response to go quiet before looking at the next job, so at most one
//! command is ever in flight.
//!
//! Completion rules for a dispatched job:
//! - complete once no output has arrived for the quiet period (clock starts at
//!   the write and restarts with every routed line), provided the session that
//!   received it is still the live one;
//! - `Timeout` with the partial stdout once the job's deadline passes. A crashed
//!   session never completes a job, so commands caught in a crash time out.
//!
//! Jobs whose caller already gave up, or whose deadline expired while queued,
//! are skipped without touching the session.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use super::error::BridgeError;
use super::multiplexer::{PendingCommand, PendingSlot};
use super::session::SessionManager;
use crate::logutil::escape_log;
use crate::metrics;
use crate::validation::validate_command_line;

/// Extra time a caller waits past its own deadline so the dispatcher's
/// timeout (which carries partial output) wins the race.
const CALLER_GRACE: Duration = Duration::from_millis(250);

/// Captured result of one CLI command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

pub type CommandResult = Result<CommandOutput, BridgeError>;

struct QueuedCommand {
    id: Uuid,
    command: String,
    deadline: Instant,
    reply: oneshot::Sender<CommandResult>,
}

/// Handle used by HTTP handlers to run commands.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    session: Arc<SessionManager>,
    default_timeout: Duration,
}

impl CommandQueue {
    /// Create the queue and spawn its dispatcher task.
    pub fn spawn(
        session: Arc<SessionManager>,
        slot: Arc<PendingSlot>,
        quiet_period: Duration,
        default_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            rx,
            session: session.clone(),
            slot,
            quiet_period,
        };
        let handle = tokio::spawn(dispatcher.run());
        (
            Self {
                tx,
                session,
                default_timeout,
            },
            handle,
        )
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Append a command to the queue. The receiver resolves when the dispatcher
    /// completes or times out the command.
    pub fn enqueue(
        &self,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CommandResult>, BridgeError> {
        let (reply, rx) = oneshot::channel();
        let job = QueuedCommand {
            id: Uuid::new_v4(),
            command: command.into(),
            deadline: Instant::now() + timeout,
            reply,
        };
        self.tx.send(job).map_err(|_| BridgeError::QueueClosed)?;
        Ok(rx)
    }

    /// Run one command and wait for its output.
    ///
    /// Fails immediately with `NotInitialized` when no session is alive rather
    /// than waiting for the timeout.
    pub async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> CommandResult {
        let command = validate_command_line(command)?;
        if !self.session.is_alive().await {
            metrics::inc_commands_rejected();
            return Err(BridgeError::NotInitialized);
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let rx = self.enqueue(command, timeout)?;
        match tokio::time::timeout(timeout + CALLER_GRACE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::QueueClosed),
            Err(_) => {
                metrics::inc_commands_timed_out();
                Err(BridgeError::Timeout {
                    command: command.to_string(),
                    partial_stdout: String::new(),
                })
            }
        }
    }
}

struct Dispatcher {
    rx: mpsc::UnboundedReceiver<QueuedCommand>,
    session: Arc<SessionManager>,
    slot: Arc<PendingSlot>,
    quiet_period: Duration,
}

impl Dispatcher {
    async fn run(mut self) {
        info!("Command dispatcher started");
        while let Some(job) = self.rx.recv().await {
            if job.reply.is_closed() {
                debug!("Skipping {} ({}): caller gone", job.id, escape_log(&job.command));
                continue;
            }
            if Instant::now() >= job.deadline {
                metrics::inc_commands_timed_out();
                let _ = job.reply.send(Err(BridgeError::Timeout {
                    command: job.command.clone(),
                    partial_stdout: String::new(),
                }));
                continue;
            }
            let result = self.dispatch(&job).await;
            match &result {
                Ok(_) => metrics::inc_commands_completed(),
                Err(BridgeError::Timeout { .. }) => metrics::inc_commands_timed_out(),
                Err(BridgeError::NotInitialized) => metrics::inc_commands_rejected(),
                Err(_) => {}
            }
            let _ = job.reply.send(result);
        }
        info!("Command dispatcher stopped");
    }

    async fn dispatch(&self, job: &QueuedCommand) -> CommandResult {
        let Some(generation) = self.session.alive_generation().await else {
            return Err(BridgeError::NotInitialized);
        };

        self.slot
            .begin(PendingCommand::new(job.id, job.command.clone(), generation));
        if let Err(e) = self.session.write_line(generation, &job.command).await {
            self.slot.take(job.id);
            return Err(e);
        }
        metrics::inc_commands_dispatched();

        loop {
            let now = Instant::now();
            if now >= job.deadline || job.reply.is_closed() {
                let partial = self
                    .slot
                    .take(job.id)
                    .map(|p| p.stdout_text())
                    .unwrap_or_default();
                warn!(
                    "Command {} ({}) timed out with {} bytes of partial output",
                    job.id,
                    escape_log(&job.command),
                    partial.len()
                );
                return Err(BridgeError::Timeout {
                    command: job.command.clone(),
                    partial_stdout: partial,
                });
            }

            let Some(last_output) = self.slot.last_output_at(job.id) else {
                // Slot was replaced underneath us; nothing left to collect.
                return Err(BridgeError::Timeout {
                    command: job.command.clone(),
                    partial_stdout: String::new(),
                });
            };
            let quiet_at = last_output + self.quiet_period;

            if now >= quiet_at {
                if self.session.alive_generation().await == Some(generation) {
                    if let Some(pending) = self.slot.take(job.id) {
                        debug!(
                            "Command {} complete after {:?}",
                            job.id,
                            pending.submitted_at.elapsed()
                        );
                        return Ok(pending.into_output());
                    }
                }
                // The session that received this command is gone; let it time out.
                sleep_until(job.deadline).await;
                continue;
            }

            sleep_until(quiet_at.min(job.deadline)).await;
        }
    }
}
