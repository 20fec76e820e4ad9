use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::PlayerConfig;
use crate::error::{PlayerError, Result};

/// Configuration loaded from a JSON file or supplied in memory
///
/// Sessions snapshot the config once at `play_stream` time, so a session
/// never observes a half-applied configuration.
#[derive(Clone)]
pub struct ConfigStore {
    config: Arc<PlayerConfig>,
}

impl ConfigStore {
    /// Open the store, writing a default file if none exists
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                PlayerError::Config(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, writing defaults", path.display());
                let config = PlayerConfig::default();
                Self::write_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::in_memory(config))
    }

    /// In-memory store (nothing is persisted)
    pub fn in_memory(config: PlayerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    async fn write_file(path: &Path, config: &PlayerConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(path, json).await?;
        debug!("Config written to {}", path.display());
        Ok(())
    }

    pub fn get(&self) -> Arc<PlayerConfig> {
        self.config.clone()
    }
}
