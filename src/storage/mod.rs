//! # Storage Module - Bridge Persistence
//!
//! The bridge keeps very little state of its own. Two files are written:
//!
//! - the append-only advert event log ([`adverts::AdvertLog`]), one JSON record per line;
//! - the persisted device settings ([`settings::SettingsStore`]), replayed into
//!   every new session's Init Script.
//!
//! ```text
//! data/
//! └── adverts.jsonl          ← Advert events (NDJSON)
//! <config_dir>/
//! ├── <device>.msgs          ← Written by meshcore-cli, read by meshcore::messages
//! └── .webui_settings.json   ← Device settings
//! ```
//!
//! ## File Locking
//!
//! Settings writes take an exclusive `fs2` lock on the destination, write a
//! temp file in the same directory and rename it into place, so a reader never
//! observes a half-written document.

pub mod adverts;
pub mod settings;

use anyhow::{anyhow, Result};
use fs2::FileExt;
use std::path::Path;

/// Replace `path` with `content` under an exclusive lock (temp file + rename).
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub(crate) fn write_file_locked(path: &Path, content: &str) -> Result<()> {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir)?;
    }

    // fs2 has no async API; lock the destination itself for the duration of the swap
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("data.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };

    fs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock_file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");
        write_file_locked(&path, "{\"a\":1}").expect("first write");
        write_file_locked(&path, "{\"a\":2}").expect("second write");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{\"a\":2}");
        let leftovers = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
