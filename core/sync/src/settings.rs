//! Persisted sync settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use docvault_common::{Error, Result};

use crate::coordinator::CoordinatorConfig;
use crate::queue::QueueConfig;
use crate::scheduler::SyncMode;

/// Settings file name inside the application config directory.
pub const SETTINGS_FILENAME: &str = "sync.json";

/// Everything needed to assemble the queue, coordinator and scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub queue: QueueConfig,
    pub coordinator: CoordinatorConfig,
    pub mode: SyncMode,
}

impl SyncSettings {
    /// Serialize settings to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Read settings from `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await?;
        debug!("Loaded sync settings from {}", path.display());
        Self::from_json(&json)
    }

    /// Write settings to `path`, creating parent directories.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json()?).await?;
        debug!("Saved sync settings to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStrategy;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.mode, SyncMode::Manual);
        assert_eq!(
            settings.coordinator.staleness_threshold,
            Duration::from_secs(300)
        );
        assert_eq!(settings.queue.event_capacity, 64);
        assert_eq!(
            settings.queue.backoff.delay_for_attempt(0),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings =
            SyncSettings::from_json(r#"{ "coordinator": { "default_strategy": "ServerWins" } }"#)
                .unwrap();
        assert_eq!(
            settings.coordinator.default_strategy,
            ConflictStrategy::ServerWins
        );
        assert_eq!(
            settings.coordinator.staleness_threshold,
            Duration::from_secs(300)
        );
        assert!(settings.queue.auto_drain);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            SyncSettings::from_json("not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILENAME);

        let mut settings = SyncSettings::default();
        settings.mode = SyncMode::Periodic {
            interval: Duration::from_secs(120),
        };
        settings.queue.assume_online = true;
        settings.save(&path).await.unwrap();

        let loaded = SyncSettings::load(&path).await.unwrap();
        assert_eq!(loaded.mode, settings.mode);
        assert!(loaded.queue.assume_online);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = SyncSettings::load(dir.path().join("missing.json")).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
