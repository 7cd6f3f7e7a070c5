//! Configuration context handed to every component

use crate::error::Result;
use ferry_types::{BandwidthLimit, RetrySettings, Settings};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::info;

const SETTINGS_FILE: &str = "settings.json";

/// Shared, mutable view of the host settings
///
/// Components keep a clone and read through it on each use, so a change is
/// picked up without restarting anything.
#[derive(Clone, Debug)]
pub struct ConfigContext {
    settings: Arc<RwLock<Settings>>,
    path: Option<PathBuf>,
}

impl ConfigContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            path: None,
        }
    }

    /// Load `settings.json` from `data_dir`, writing defaults when absent
    pub async fn load_or_init(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(SETTINGS_FILE);

        let settings = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            info!("Writing default settings to {}", path.display());
            let settings = Settings::default();
            fs::write(&path, serde_json::to_string_pretty(&settings)?).await?;
            settings
        };

        Ok(Self {
            settings: Arc::new(RwLock::new(settings)),
            path: Some(path),
        })
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let content = serde_json::to_string_pretty(&*self.settings.read())?;
            fs::write(path, content).await?;
        }
        Ok(())
    }

    /// Snapshot of the current settings
    pub fn snapshot(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn update<F: FnOnce(&mut Settings)>(&self, f: F) {
        f(&mut self.settings.write());
    }

    pub fn host_id(&self) -> String {
        self.settings.read().host_id.clone()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.read().connection_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.read().idle_timeout_ms)
    }

    pub fn commander_interval(&self) -> Duration {
        Duration::from_millis(self.settings.read().commander_interval_ms.max(10))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.read().stale_timeout_secs)
    }

    pub fn max_concurrent(&self) -> usize {
        self.settings.read().max_concurrent_transfers.max(1) as usize
    }

    pub fn retry(&self) -> RetrySettings {
        self.settings.read().retry
    }

    pub fn bandwidth(&self) -> BandwidthLimit {
        self.settings.read().bandwidth
    }

    pub fn clamp_blocksize(&self, requested: u32) -> u32 {
        self.settings.read().clamp_blocksize(requested)
    }
}
