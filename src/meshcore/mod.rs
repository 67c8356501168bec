//! # MeshCore CLI formats
//!
//! Knowledge about meshcore-cli's text output and files, kept apart from the
//! process plumbing in [`crate::bridge`]:
//!
//! - [`parser`] - human-readable command output (`pending_contacts`, `get_channels`)
//!   and command-line formatting for the `/cli` passthrough
//! - [`messages`] - the `<device>.msgs` JSON-lines feed and per-channel unread tracking

pub mod messages;
pub mod parser;

pub use messages::{ChatMessage, ChannelUpdate, MessageQuery, UpdatesSummary};
pub use parser::{Channel, PendingContact};
