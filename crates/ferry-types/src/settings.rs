//! Runtime settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Throughput caps in bytes per second. Zero means unlimited on that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthLimit {
    #[serde(default)]
    pub global_read: u64,
    #[serde(default)]
    pub global_write: u64,
    #[serde(default)]
    pub session_read: u64,
    #[serde(default)]
    pub session_write: u64,
    /// Shaping granularity.
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,
}

fn default_check_interval() -> u64 {
    1000
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        Self {
            global_read: 0,
            global_write: 0,
            session_read: 0,
            session_write: 0,
            check_interval_ms: default_check_interval(),
        }
    }
}

impl BandwidthLimit {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.global_read == 0 && self.global_write == 0 && self.session_read == 0 && self.session_write == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistSettings {
    /// Failures tolerated inside the window before banning.
    pub threshold: u32,
    pub window_ms: u64,
}

impl Default for BlacklistSettings {
    fn default() -> Self {
        Self {
            threshold: 3,
            window_ms: 60_000,
        }
    }
}

/// Host settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub host_id: String,
    pub listen_address: String,
    pub use_tls: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Bounds connect, AUTHENT and REQUEST phases.
    pub connection_timeout_ms: u64,
    /// Silence tolerated on a channel once the transfer is under way.
    pub idle_timeout_ms: u64,
    pub min_blocksize: u32,
    pub max_blocksize: u32,
    pub default_blocksize: u32,
    pub bandwidth: BandwidthLimit,
    pub max_concurrent_transfers: u32,
    pub commander_interval_ms: u64,
    /// RUNNING rows silent for longer are reclaimed as INTERRUPTED.
    pub stale_timeout_secs: u64,
    pub retry: RetrySettings,
    pub use_block_digest: bool,
    pub use_compression: bool,
    pub blacklist: BlacklistSettings,
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        let base = dirs::data_dir()
            .map(|d| d.join("ferry"))
            .unwrap_or_else(|| PathBuf::from(".ferry"));
        Self {
            host_id: "ferry".to_string(),
            listen_address: "0.0.0.0:6666".to_string(),
            use_tls: false,
            tls_cert: None,
            tls_key: None,
            connection_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            min_blocksize: 1024,
            max_blocksize: 1024 * 1024,
            default_blocksize: 64 * 1024,
            bandwidth: BandwidthLimit::default(),
            max_concurrent_transfers: 8,
            commander_interval_ms: 1000,
            stale_timeout_secs: 300,
            retry: RetrySettings::default(),
            use_block_digest: false,
            use_compression: false,
            blacklist: BlacklistSettings::default(),
            in_dir: base.join("in"),
            out_dir: base.join("out"),
            work_dir: base.join("work"),
        }
    }
}

impl Settings {
    /// Clamp a requested blocksize into the configured bounds.
    pub fn clamp_blocksize(&self, requested: u32) -> u32 {
        let requested = if requested == 0 { self.default_blocksize } else { requested };
        requested.clamp(self.min_blocksize.max(1), self.max_blocksize.max(self.min_blocksize.max(1)))
    }
}
