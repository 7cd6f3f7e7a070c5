use super::config::{SpoolMode, SpooledConfig};
use super::strategy::{DirectStrategy, SpoolStrategy, SubmitStrategy};
use crate::error::{FerryError, Result};
use crate::transfer::SubmitRequest;
use crate::FerryCore;
use ferry_types::CoreEvent;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Cumulative outcome counters, shared with whoever monitors the watcher
#[derive(Clone, Debug, Default)]
pub struct SpoolStats {
    sent: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl SpoolStats {
    /// Transfers handed to the engine successfully
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Candidate {
    name: String,
    len: u64,
    signature: String,
}

/// Polls directories and submits each stable file once
pub struct SpooledWatcher {
    config: SpooledConfig,
    core: FerryCore,
    strategy: Arc<dyn SpoolStrategy>,
    filter: Option<Regex>,
    /// Files already sent, by path, with the signature they had
    used: BTreeMap<String, String>,
    /// Signature seen on the previous poll for files not sent yet
    pending: HashMap<String, String>,
    stats: SpoolStats,
    token: CancellationToken,
}

impl SpooledWatcher {
    pub async fn new(core: FerryCore, config: SpooledConfig) -> Result<Self> {
        if config.directories.is_empty() {
            return Err(FerryError::Config(format!("spool {} watches no directory", config.name)));
        }
        if config.hosts.is_empty() {
            return Err(FerryError::Config(format!("spool {} has no target host", config.name)));
        }
        core.catalog().rule(&config.rule_id)?;
        let filter = config
            .regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| FerryError::Config(format!("bad filter for spool {}: {e}", config.name)))?;
        let used = load_status(&config.status_file).await?;

        let strategy: Arc<dyn SpoolStrategy> = match config.mode {
            SpoolMode::Submit => Arc::new(SubmitStrategy::new(core.clone())),
            SpoolMode::Direct => Arc::new(DirectStrategy::new(core.clone())),
        };

        Ok(Self {
            config,
            core,
            strategy,
            filter,
            used,
            pending: HashMap::new(),
            stats: SpoolStats::default(),
            token: CancellationToken::new(),
        })
    }

    /// Replace the strategy picked from the configured mode
    pub fn with_strategy(mut self, strategy: Arc<dyn SpoolStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn stats(&self) -> SpoolStats {
        self.stats.clone()
    }

    /// Cancelling this token stops `run` after the current scan
    pub fn stop_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Poll until the stop file shows up, the token is cancelled or the
    /// host shuts down. Submissions of a scan always finish before it
    /// returns.
    pub async fn run(mut self) -> SpoolStats {
        info!(
            "Spool {} watching {} director(ies) every {:?}",
            self.config.name,
            self.config.directories.len(),
            self.config.elapse()
        );
        let mut ticker = interval(self.config.elapse());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.core.engine().shutdown.clone();

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.stop_requested().await {
                break;
            }
            if let Err(e) = self.scan_once().await {
                warn!("Spool {} scan failed: {}", self.config.name, e);
            }
            if self.stop_requested().await {
                break;
            }
        }

        info!(
            "Spool {} stopped: {} sent, {} error(s)",
            self.config.name,
            self.stats.sent(),
            self.stats.errors()
        );
        self.stats
    }

    async fn stop_requested(&self) -> bool {
        tokio::fs::try_exists(&self.config.stop_file).await.unwrap_or(false)
    }

    /// One poll of every directory. Returns the number of transfers handed
    /// to the strategy successfully.
    pub async fn scan_once(&mut self) -> Result<usize> {
        let config = self.config.clone();
        let filter = self.filter.clone();
        let found = tokio::task::spawn_blocking(move || list_candidates(&config, filter.as_ref()))
            .await
            .map_err(|e| FerryError::Io(std::io::Error::other(e)))?;

        // Files that went away are forgotten, so a new file with the same
        // name counts as new.
        let present: HashSet<&str> = found.iter().map(|c| c.name.as_str()).collect();
        let known = self.used.len();
        self.used.retain(|name, _| present.contains(name.as_str()));
        self.pending.retain(|name, _| present.contains(name.as_str()));
        let mut changed = self.used.len() != known;

        let mut ready = Vec::new();
        for candidate in found {
            if candidate.len < self.config.min_size {
                self.pending.remove(&candidate.name);
                continue;
            }
            if let Some(sent) = self.used.get(&candidate.name) {
                if !self.config.ignore_already_used || *sent == candidate.signature {
                    continue;
                }
            }
            match self.pending.get(&candidate.name) {
                Some(seen) if *seen == candidate.signature => {
                    self.pending.remove(&candidate.name);
                    ready.push(candidate);
                }
                _ => {
                    debug!("Spool {} saw {}", self.config.name, candidate.name);
                    self.pending.insert(candidate.name.clone(), candidate.signature.clone());
                }
            }
        }

        let delivered = self.dispatch(&ready).await;
        let submitted: usize = delivered.values().sum();
        for candidate in ready {
            if delivered.get(&candidate.name) == Some(&self.config.hosts.len()) {
                self.used.insert(candidate.name, candidate.signature);
                changed = true;
            }
        }
        if changed {
            self.save_status().await?;
        }
        Ok(submitted)
    }

    /// Hand every ready file to the strategy, once per host, and wait for
    /// all of them. Returns the successes per file.
    async fn dispatch(&self, ready: &[Candidate]) -> HashMap<String, usize> {
        let slots = Arc::new(Semaphore::new(self.config.limit_parallel.max(1)));
        let mut jobs = JoinSet::new();
        for candidate in ready {
            for host in &self.config.hosts {
                let mut request = SubmitRequest::new(&self.config.rule_id, host, &candidate.name)
                    .with_info(&self.config.file_info)
                    .with_digest(self.config.use_digest);
                if let Some(blocksize) = self.config.blocksize {
                    request = request.with_blocksize(blocksize);
                }
                let strategy = self.strategy.clone();
                let slots = slots.clone();
                let name = candidate.name.clone();
                jobs.spawn(async move {
                    let _permit = slots.acquire_owned().await;
                    let outcome = strategy.dispatch(request).await;
                    (name, outcome)
                });
            }
        }

        let mut delivered = HashMap::new();
        while let Some(joined) = jobs.join_next().await {
            let (name, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Spool {} job died: {}", self.config.name, e);
                    continue;
                }
            };
            match outcome {
                Ok(key) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                    *delivered.entry(name.clone()).or_insert(0) += 1;
                    info!("Spool {} sent {} as {}", self.config.name, name, key);
                    self.core.engine().emit(CoreEvent::SpoolSubmitted { path: name, key: Some(key) });
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Spool {} could not send {}: {}", self.config.name, name, e);
                    self.core.engine().emit(CoreEvent::SpoolSubmitted { path: name, key: None });
                }
            }
        }
        delivered
    }

    async fn save_status(&self) -> Result<()> {
        let path = &self.config.status_file;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&self.used)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

async fn load_status(path: &Path) -> Result<BTreeMap<String, String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(used) => Ok(used),
            Err(e) => {
                warn!("Ignoring unreadable status file {}: {}", path.display(), e);
                Ok(BTreeMap::new())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Regular files under the configured directories, status and stop files
/// excluded
fn list_candidates(config: &SpooledConfig, filter: Option<&Regex>) -> Vec<Candidate> {
    let excluded: Vec<PathBuf> = [&config.status_file, &config.stop_file]
        .into_iter()
        .filter_map(|p| std::fs::canonicalize(p).ok())
        .collect();

    let mut found = Vec::new();
    for dir in &config.directories {
        let root = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
        let depth = if config.recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(&root).min_depth(1).max_depth(depth).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || excluded.iter().any(|p| p == entry.path()) {
                continue;
            }
            if let Some(filter) = filter {
                if !filter.is_match(&entry.file_name().to_string_lossy()) {
                    continue;
                }
            }
            let Ok(meta) = entry.metadata() else { continue };
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis())
                .unwrap_or(0);
            found.push(Candidate {
                name: entry.path().to_string_lossy().into_owned(),
                len: meta.len(),
                signature: format!("{}-{}", meta.len(), modified),
            });
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::ConfigContext;
    use crate::storage::{MemoryTaskStore, TaskFilter};
    use ferry_types::{Direction, HostAuth, Rule, Settings};

    fn core() -> FerryCore {
        let mut settings = Settings::default();
        settings.host_id = "alpha".into();
        FerryCore::with_parts(
            ConfigContext::new(settings),
            Arc::new(MemoryTaskStore::new()),
            Catalog::in_memory(
                vec![Rule::new("out", Direction::Send)],
                vec![
                    HostAuth::new("alpha", "127.0.0.1", 1, "a"),
                    HostAuth::new("beta", "127.0.0.1", 2, "b"),
                ],
            ),
        )
    }

    fn config(root: &Path, ignore_already_used: bool) -> SpooledConfig {
        let spool = root.join("spool");
        std::fs::create_dir_all(&spool).unwrap();
        SpooledConfig {
            directories: vec![spool],
            status_file: root.join("status.json"),
            stop_file: root.join("stop"),
            min_size: 100,
            ignore_already_used,
            rule_id: "out".into(),
            hosts: vec!["beta".into()],
            ..Default::default()
        }
    }

    async fn queued(core: &FerryCore) -> usize {
        core.list(&TaskFilter::default(), 0).await.unwrap().len()
    }

    #[tokio::test]
    async fn stable_file_is_sent_once() {
        let dir = tempfile::tempdir().unwrap();
        let core = core();
        let config = config(dir.path(), false);
        let file = config.directories[0].join("data.bin");
        let mut watcher = SpooledWatcher::new(core.clone(), config).await.unwrap();

        std::fs::write(&file, vec![7u8; 200]).unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert_eq!(watcher.stats().sent(), 1);
        assert_eq!(queued(&core).await, 1);

        // Changed content is not sent again
        std::fs::write(&file, vec![8u8; 300]).unwrap();
        for _ in 0..3 {
            assert_eq!(watcher.scan_once().await.unwrap(), 0);
        }
        assert_eq!(queued(&core).await, 1);
    }

    #[tokio::test]
    async fn changed_file_is_sent_again_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let core = core();
        let config = config(dir.path(), true);
        let file = config.directories[0].join("data.bin");
        let mut watcher = SpooledWatcher::new(core.clone(), config).await.unwrap();

        std::fs::write(&file, vec![7u8; 200]).unwrap();
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        assert_eq!(watcher.scan_once().await.unwrap(), 0);

        std::fs::write(&file, vec![8u8; 300]).unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        assert_eq!(watcher.stats().sent(), 2);
        assert_eq!(queued(&core).await, 2);
    }

    #[tokio::test]
    async fn small_and_filtered_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let core = core();
        let mut config = config(dir.path(), false);
        config.regex = Some(r"\.csv$".into());
        let spool = config.directories[0].clone();
        let mut watcher = SpooledWatcher::new(core.clone(), config).await.unwrap();

        std::fs::write(spool.join("tiny.csv"), b"a,b").unwrap();
        std::fs::write(spool.join("other.txt"), vec![1u8; 500]).unwrap();
        std::fs::write(spool.join("big.csv"), vec![1u8; 500]).unwrap();
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 1);

        let runners = core.list(&TaskFilter::default(), 0).await.unwrap();
        assert_eq!(runners.len(), 1);
        assert!(runners[0].filename.ends_with("big.csv"));
    }

    #[tokio::test]
    async fn sent_files_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let core = core();
        let config = config(dir.path(), false);
        std::fs::write(config.directories[0].join("data.bin"), vec![7u8; 200]).unwrap();

        let mut watcher = SpooledWatcher::new(core.clone(), config.clone()).await.unwrap();
        watcher.scan_once().await.unwrap();
        assert_eq!(watcher.scan_once().await.unwrap(), 1);

        let mut watcher = SpooledWatcher::new(core.clone(), config).await.unwrap();
        for _ in 0..3 {
            assert_eq!(watcher.scan_once().await.unwrap(), 0);
        }
        assert_eq!(queued(&core).await, 1);
    }

    #[tokio::test]
    async fn failures_are_counted_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let core = core();
        let mut config = config(dir.path(), false);
        config.hosts = vec!["gamma".into()];
        std::fs::write(config.directories[0].join("data.bin"), vec![7u8; 200]).unwrap();
        let mut watcher = SpooledWatcher::new(core, config).await.unwrap();

        for _ in 0..4 {
            assert_eq!(watcher.scan_once().await.unwrap(), 0);
        }
        assert_eq!(watcher.stats().errors(), 2);
        assert_eq!(watcher.stats().sent(), 0);
    }

    #[tokio::test]
    async fn stop_file_ends_the_watch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), false);
        config.elapse_ms = 10;
        std::fs::write(&config.stop_file, b"").unwrap();
        let watcher = SpooledWatcher::new(core(), config).await.unwrap();

        let stats = tokio::time::timeout(std::time::Duration::from_secs(5), watcher.run())
            .await
            .unwrap();
        assert_eq!(stats.sent(), 0);
    }
}
