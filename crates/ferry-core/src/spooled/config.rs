use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How a stable file is handed to the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoolMode {
    /// Queue the transfer and let the commander run it
    #[default]
    Submit,
    /// Run the transfer now and wait for it
    Direct,
}

/// One watched set of directories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpooledConfig {
    pub name: String,
    pub directories: Vec<PathBuf>,
    /// Where the files already sent are remembered between runs
    pub status_file: PathBuf,
    /// Watching stops once this file exists
    pub stop_file: PathBuf,
    /// Only file names matching this pattern are considered
    pub regex: Option<String>,
    pub recursive: bool,
    pub elapse_ms: u64,
    /// Smaller files are left alone
    pub min_size: u64,
    pub mode: SpoolMode,
    pub limit_parallel: usize,
    /// Send a file again once its content changed
    pub ignore_already_used: bool,
    pub rule_id: String,
    /// One transfer per host for each file
    pub hosts: Vec<String>,
    pub file_info: String,
    pub use_digest: bool,
    pub blocksize: Option<u32>,
}

impl Default for SpooledConfig {
    fn default() -> Self {
        Self {
            name: "spool".into(),
            directories: Vec::new(),
            status_file: PathBuf::from("spool.status.json"),
            stop_file: PathBuf::from("spool.stop"),
            regex: None,
            recursive: false,
            elapse_ms: 1000,
            min_size: 1,
            mode: SpoolMode::Submit,
            limit_parallel: 1,
            ignore_already_used: false,
            rule_id: String::new(),
            hosts: Vec::new(),
            file_info: String::new(),
            use_digest: false,
            blocksize: None,
        }
    }
}

impl SpooledConfig {
    pub fn elapse(&self) -> Duration {
        Duration::from_millis(self.elapse_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_takes_defaults() {
        let config: SpooledConfig =
            serde_json::from_str(r#"{"rule_id": "out", "hosts": ["beta"], "mode": "direct"}"#).unwrap();
        assert_eq!(config.mode, SpoolMode::Direct);
        assert_eq!(config.elapse(), Duration::from_millis(1000));
        assert_eq!(config.limit_parallel, 1);
        assert!(!config.ignore_already_used);
    }
}
