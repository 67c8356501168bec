//! Persisted device settings.
//!
//! Only `manual_add_contacts` is interpreted by the bridge; unknown keys written
//! by other tools are preserved across saves.

use anyhow::{anyhow, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// When on, new contacts wait in the pending list until approved.
    #[serde(default)]
    pub manual_add_contacts: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the settings file. A missing or empty file yields defaults.
    pub async fn load(&self) -> Result<DeviceSettings> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings file at {}; using defaults", self.path.display());
                return Ok(DeviceSettings::default());
            }
            Err(e) => {
                return Err(anyhow!(
                    "Failed to read settings {}: {}",
                    self.path.display(),
                    e
                ))
            }
        };
        if content.trim().is_empty() {
            return Ok(DeviceSettings::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| anyhow!("Invalid settings file {}: {}", self.path.display(), e))
    }

    pub async fn save(&self, settings: &DeviceSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| anyhow!("Failed to serialize settings: {}", e))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || super::write_file_locked(&path, &content))
            .await
            .map_err(|e| anyhow!("Settings writer task failed: {}", e))?
    }

    /// Load, flip `manual_add_contacts` and save. Other keys are kept.
    pub async fn set_manual_add_contacts(&self, enabled: bool) -> Result<DeviceSettings> {
        let mut settings = match self.load().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Replacing unreadable settings file: {}", e);
                DeviceSettings::default()
            }
        };
        settings.manual_add_contacts = enabled;
        self.save(&settings).await?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::new(dir.path().join(".webui_settings.json"));
        let settings = store.load().await.expect("load");
        assert!(!settings.manual_add_contacts);
    }

    #[tokio::test]
    async fn toggle_persists_and_keeps_unknown_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".webui_settings.json");
        std::fs::write(&path, r#"{"theme":"dark"}"#).expect("seed");
        let store = SettingsStore::new(&path);

        let saved = store.set_manual_add_contacts(true).await.expect("save");
        assert!(saved.manual_add_contacts);

        let reloaded = store.load().await.expect("reload");
        assert!(reloaded.manual_add_contacts);
        assert_eq!(reloaded.extra.get("theme"), Some(&Value::from("dark")));
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".webui_settings.json");
        std::fs::write(&path, "{oops").expect("seed");
        assert!(SettingsStore::new(&path).load().await.is_err());
    }
}
