//! Output multiplexer: classifies every line the CLI prints.
//!
//! meshcore-cli interleaves two logical channels on one stdout pipe: replies
//! to the command we just wrote, and unsolicited JSON events (adverts) pushed
//! by the radio. One reader task per stream routes each line:
//!
//! - advert JSON goes to the advert sink, independent of any command;
//! - anything else is appended to the in-flight [`PendingCommand`], if one exists;
//! - with no command in flight, the line is a banner or a late reply and is discarded.
//!
//! There is no end-of-response marker. A command counts as complete once its
//! buffer has been quiet for the configured period, which is an approximation:
//! a slow reply can be split across two commands and an unrelated non-advert
//! line printed right after a write is attributed to that command.

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::CommandOutput;
use crate::logutil::{escape_log, strip_ansi};
use crate::metrics;

/// An unsolicited advertisement broadcast reported by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdvertEvent {
    pub received_at: DateTime<Utc>,
    /// Generation of the session that printed the event.
    pub session: u64,
    pub payload: Value,
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Classification result for a stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Advert(Value),
    Response,
}

/// Recognises advert lines: a JSON object whose marker field carries a known event type.
#[derive(Debug, Clone)]
pub struct AdvertMatcher {
    marker_fields: Vec<String>,
    event_types: Vec<String>,
}

impl AdvertMatcher {
    pub fn new(marker_fields: Vec<String>, event_types: Vec<String>) -> Self {
        Self {
            marker_fields,
            event_types,
        }
    }

    pub fn classify(&self, line: &str) -> LineKind {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return LineKind::Response;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return LineKind::Response;
        };
        let Some(object) = value.as_object() else {
            return LineKind::Response;
        };
        let is_advert = self.marker_fields.iter().any(|field| {
            object
                .get(field)
                .and_then(Value::as_str)
                .map(|marker| self.event_types.iter().any(|t| t == marker))
                .unwrap_or(false)
        });
        if is_advert {
            LineKind::Advert(value)
        } else {
            LineKind::Response
        }
    }
}

/// The command currently in flight and the output captured for it.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub id: Uuid,
    pub command: String,
    /// Session the command was written to; output from any other session is ignored.
    pub generation: u64,
    pub submitted_at: Instant,
    pub last_output_at: Instant,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl PendingCommand {
    pub fn new(id: Uuid, command: impl Into<String>, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            command: command.into(),
            generation,
            submitted_at: now,
            last_output_at: now,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn into_output(self) -> CommandOutput {
        CommandOutput {
            stdout: self.stdout.join("\n"),
            stderr: self.stderr.join("\n"),
            returncode: 0,
        }
    }
}

/// The single "current Pending Command" slot shared by the dispatcher and the readers.
#[derive(Debug, Default)]
pub struct PendingSlot {
    inner: Mutex<Option<PendingCommand>>,
}

impl PendingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingCommand>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install a command as in flight. A previous occupant is dropped.
    pub fn begin(&self, pending: PendingCommand) {
        let mut guard = self.lock();
        if let Some(previous) = guard.replace(pending) {
            warn!(
                "Pending slot still held command {} ({}); dropping it",
                previous.id,
                escape_log(&previous.command)
            );
        }
    }

    /// Remove the in-flight command, but only if it is the one identified by `id`.
    pub fn take(&self, id: Uuid) -> Option<PendingCommand> {
        let mut guard = self.lock();
        match guard.as_ref() {
            Some(p) if p.id == id => guard.take(),
            _ => None,
        }
    }

    pub fn last_output_at(&self, id: Uuid) -> Option<Instant> {
        self.lock()
            .as_ref()
            .filter(|p| p.id == id)
            .map(|p| p.last_output_at)
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_none()
    }

    /// Append a line printed by session `generation` to the in-flight command.
    /// Returns false when nothing from that session is in flight.
    pub fn append(&self, generation: u64, stream: OutputStream, line: String) -> bool {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(pending) if pending.generation == generation => {
                match stream {
                    OutputStream::Stdout => pending.stdout.push(line),
                    OutputStream::Stderr => pending.stderr.push(line),
                }
                pending.last_output_at = Instant::now();
                true
            }
            _ => false,
        }
    }
}

/// Next line without its terminator. Bytes that are not UTF-8 (node names and
/// relayed text are arbitrary bytes) become U+FFFD instead of ending the stream.
async fn next_line_lossy<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Read stdout until EOF, routing each line as described in the module docs.
///
/// The task only ends at EOF or on an I/O error; the session treats a
/// finished reader as a dead process.
pub async fn run_stdout<R>(
    reader: R,
    generation: u64,
    matcher: Arc<AdvertMatcher>,
    slot: Arc<PendingSlot>,
    adverts: mpsc::UnboundedSender<AdvertEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let raw = match next_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                warn!("Session {} stdout read error: {}", generation, e);
                break;
            }
        };
        let line = strip_ansi(&raw);
        if line.trim().is_empty() {
            continue;
        }
        trace!("cli[{}] stdout: {}", generation, escape_log(&line));
        match matcher.classify(&line) {
            LineKind::Advert(payload) => {
                let event = AdvertEvent {
                    received_at: Utc::now(),
                    session: generation,
                    payload,
                };
                if adverts.send(event).is_err() {
                    debug!("Advert sink closed; dropping advert line");
                }
            }
            LineKind::Response => {
                if !slot.append(generation, OutputStream::Stdout, line.clone()) {
                    metrics::inc_stray_lines_discarded();
                    debug!(
                        "Discarding unsolicited output (no command in flight): {}",
                        escape_log(&line)
                    );
                }
            }
        }
    }
    debug!("Session {} stdout reader finished", generation);
}

/// Read stderr until EOF; lines are attached to the in-flight command's stderr.
pub async fn run_stderr<R>(reader: R, generation: u64, slot: Arc<PendingSlot>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let raw = match next_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                warn!("Session {} stderr read error: {}", generation, e);
                break;
            }
        };
        let line = strip_ansi(&raw);
        if line.trim().is_empty() {
            continue;
        }
        if !slot.append(generation, OutputStream::Stderr, line.clone()) {
            warn!("cli[{}] stderr: {}", generation, escape_log(&line));
        }
    }
    debug!("Session {} stderr reader finished", generation);
}
