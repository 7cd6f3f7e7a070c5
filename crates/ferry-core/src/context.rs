//! Everything a transfer needs, bundled once per host
//!
//! The context is built by the facade and handed by clone to the commander,
//! the responder and every spawned transfer. No component reaches for
//! global state.

use crate::bandwidth::BandwidthLimiter;
use crate::catalog::Catalog;
use crate::completion::Completions;
use crate::config::ConfigContext;
use crate::error::{FerryError, Result};
use crate::protocol::{Abort, NetworkTransaction};
use crate::runner::RunnerRepository;
use crate::storage::TaskStore;
use crate::tasks::{BusinessRegistry, TaskRegistry};
use ferry_types::{BandwidthLimit, CoreEvent, Direction, ErrorCode, HostAuth, Rule, TaskKey, TaskRunner};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::info;

const EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct EngineContext {
    pub config: ConfigContext,
    pub repo: RunnerRepository,
    pub catalog: Catalog,
    pub limiter: BandwidthLimiter,
    pub tasks: TaskRegistry,
    pub business: BusinessRegistry,
    pub network: NetworkTransaction,
    pub completions: Completions,
    /// Cancelled when the host shuts down
    pub shutdown: CancellationToken,
    /// Wakes the commander before its next tick
    pub wakeup: Arc<Notify>,
    restart_requested: Arc<AtomicBool>,
    events: broadcast::Sender<CoreEvent>,
}

impl EngineContext {
    pub fn new(config: ConfigContext, store: Arc<dyn TaskStore>, catalog: Catalog) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            limiter: BandwidthLimiter::new(config.bandwidth()),
            network: NetworkTransaction::new(config.clone()),
            repo: RunnerRepository::new(store),
            catalog,
            tasks: TaskRegistry::new(),
            business: BusinessRegistry::new(),
            completions: Completions::new(),
            shutdown: CancellationToken::new(),
            wakeup: Arc::new(Notify::new()),
            restart_requested: Arc::new(AtomicBool::new(false)),
            events,
            config,
        }
    }

    /// Broadcast an event. Nobody listening is fine.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// This host's own entry in the catalog
    pub fn local_host(&self) -> Result<HostAuth> {
        let id = self.config.host_id();
        self.catalog
            .host(&id)
            .map_err(|_| FerryError::Config(format!("no host entry for local host id {id}")))
    }

    /// Apply new limits to open channels and keep them in the settings
    pub fn change_bandwidth(&self, limit: BandwidthLimit) {
        self.limiter.change_network_limit(limit);
        self.config.update(|s| s.bandwidth = limit);
        self.emit(CoreEvent::BandwidthChanged { limit });
    }

    /// Begin a graceful shutdown of this host
    pub fn request_shutdown(&self, restart: bool) {
        if restart {
            self.restart_requested.store(true, Ordering::SeqCst);
        }
        info!("Shutdown requested{}", if restart { " with restart" } else { "" });
        self.emit(CoreEvent::ShutdownRequested { restart });
        self.shutdown.cancel();
    }

    /// Whether the last shutdown asked for the host to come back up
    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Paths
    // ========================================================================

    /// File read by the sending side. Absolute names are used as given.
    pub fn send_path(&self, rule: &Rule, filename: &str) -> PathBuf {
        let name = Path::new(filename);
        if name.is_absolute() {
            return name.to_path_buf();
        }
        let base = rule.send_path.clone().unwrap_or_else(|| self.config.snapshot().out_dir);
        base.join(name)
    }

    /// Final location of a received file
    pub fn receive_path(&self, rule: &Rule, filename: &str) -> PathBuf {
        let base = rule.recv_path.clone().unwrap_or_else(|| self.config.snapshot().in_dir);
        base.join(basename(filename))
    }

    /// Partial file written while receiving
    pub fn work_path(&self, rule: &Rule, filename: &str, special_id: i64) -> PathBuf {
        let base = rule.work_path.clone().unwrap_or_else(|| self.config.snapshot().work_dir);
        base.join(format!("{}.{}.part", basename(filename), special_id))
    }

    /// Directory a remote may list under `rule`: the side this host serves
    /// files from.
    pub fn listing_dir(&self, rule: &Rule) -> PathBuf {
        let settings = self.config.snapshot();
        match rule.direction {
            Direction::Recv => rule.send_path.clone().unwrap_or(settings.out_dir),
            Direction::Send => rule.recv_path.clone().unwrap_or(settings.in_dir),
        }
    }

    // ========================================================================
    // Stop / cancel
    // ========================================================================

    /// Stop or cancel a transfer. A running one is signalled and ends on its
    /// own; a queued or interrupted one is updated in storage directly.
    pub async fn abort_transfer(&self, key: &TaskKey, reason: Abort) -> Result<TaskRunner> {
        let runner = self.repo.get(key).await?;
        if runner.is_terminal() {
            return Err(FerryError::refused(
                ErrorCode::QueryAlreadyFinished,
                format!("transfer {key} is already {}", runner.updated_info),
            ));
        }

        if self.network.active().abort(key, reason) {
            info!("Signalled {:?} to running transfer {}", reason, key);
            return Ok(runner);
        }

        let error = reason.error();
        let runner = self
            .repo
            .mutate(key, |r| {
                match reason {
                    Abort::Cancel => r.mark_error(error.code(), error.to_string()),
                    Abort::Stop | Abort::Shutdown => r.mark_interrupted(error.code(), error.to_string()),
                }
                Ok(())
            })
            .await?;
        info!("Transfer {} is now {}", key, runner.updated_info);
        self.emit(CoreEvent::TransferStatusChanged {
            key: key.clone(),
            info: runner.updated_info,
            step: runner.global_step,
            code: runner.step_status,
        });
        Ok(runner)
    }
}

fn basename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTaskStore;
    use ferry_types::{Settings, UpdatedInfo};

    fn engine() -> EngineContext {
        let mut settings = Settings::default();
        settings.host_id = "alpha".into();
        settings.in_dir = "/srv/in".into();
        settings.out_dir = "/srv/out".into();
        settings.work_dir = "/srv/work".into();
        EngineContext::new(
            ConfigContext::new(settings),
            Arc::new(MemoryTaskStore::new()),
            Catalog::in_memory(vec![], vec![HostAuth::new("alpha", "127.0.0.1", 6666, "k")]),
        )
    }

    #[test]
    fn paths_follow_rule_then_settings() {
        let engine = engine();
        let mut rule = Rule::new("out", Direction::Send);
        assert_eq!(engine.send_path(&rule, "a/b.txt"), PathBuf::from("/srv/out/a/b.txt"));
        assert_eq!(engine.send_path(&rule, "/abs/b.txt"), PathBuf::from("/abs/b.txt"));
        assert_eq!(engine.receive_path(&rule, "a/b.txt"), PathBuf::from("/srv/in/b.txt"));
        assert_eq!(engine.work_path(&rule, "a/b.txt", 9), PathBuf::from("/srv/work/b.txt.9.part"));

        rule.recv_path = Some("/data/inbox".into());
        assert_eq!(engine.receive_path(&rule, "b.txt"), PathBuf::from("/data/inbox/b.txt"));
        assert_eq!(engine.listing_dir(&rule), PathBuf::from("/data/inbox"));
    }

    #[tokio::test]
    async fn idle_transfers_are_stopped_in_storage() {
        let engine = engine();
        let rule = Rule::new("out", Direction::Send);
        let stopped = engine.repo.create(&rule, "alpha", "beta", "f", "").await.unwrap().key();
        let cancelled = engine.repo.create(&rule, "alpha", "beta", "g", "").await.unwrap().key();

        let runner = engine.abort_transfer(&stopped, Abort::Stop).await.unwrap();
        assert_eq!(runner.updated_info, UpdatedInfo::Interrupted);
        assert_eq!(runner.step_status, ErrorCode::StoppedTransfer);

        let runner = engine.abort_transfer(&cancelled, Abort::Cancel).await.unwrap();
        assert_eq!(runner.updated_info, UpdatedInfo::InError);

        assert!(matches!(
            engine.abort_transfer(&cancelled, Abort::Stop).await,
            Err(FerryError::Refused {
                code: ErrorCode::QueryAlreadyFinished,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn running_transfers_are_signalled() {
        let engine = engine();
        let rule = Rule::new("out", Direction::Send);
        let key = engine.repo.create(&rule, "alpha", "beta", "f", "").await.unwrap().key();
        let guard = engine.network.active().register(&key).unwrap();

        engine.abort_transfer(&key, Abort::Cancel).await.unwrap();
        assert_eq!(guard.control().aborted(), Some(Abort::Cancel));
        assert_eq!(engine.repo.get(&key).await.unwrap().updated_info, UpdatedInfo::ToSubmit);
    }
}
