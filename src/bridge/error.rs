use std::path::PathBuf;
use thiserror::Error;

use crate::validation::ValidationError;

/// Errors surfaced by the bridge session, queue and watchdog.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No live CLI session. Callers fail fast; the watchdog owns recovery.
    #[error("meshcore-cli session not initialized")]
    NotInitialized,

    /// No completion within the command's timeout. Carries whatever stdout arrived.
    #[error("command timeout: {command}")]
    Timeout {
        command: String,
        partial_stdout: String,
    },

    /// The configured serial device is missing.
    #[error("device not available: {}", .0.display())]
    DeviceUnavailable(PathBuf),

    /// The CLI binary could not be spawned.
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The CLI exited while the session was being initialised.
    #[error("meshcore-cli exited during startup ({status})")]
    SessionExited { status: String },

    /// Pipe I/O with the CLI failed.
    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),

    /// The dispatcher is gone (bridge shutting down).
    #[error("command queue closed")]
    QueueClosed,

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl BridgeError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::NotInitialized => "session_not_initialized",
            BridgeError::Timeout { .. } => "command_timeout",
            BridgeError::DeviceUnavailable(_) => "device_unavailable",
            BridgeError::Spawn { .. } => "spawn_failed",
            BridgeError::SessionExited { .. } => "session_exited",
            BridgeError::Io(_) => "session_io",
            BridgeError::QueueClosed => "queue_closed",
            BridgeError::Validation(_) => "validation",
        }
    }
}
