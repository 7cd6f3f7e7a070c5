//! Ferry Core - Managed File Transfer Engine
//!
//! This crate provides the transfer engine for Ferry: persisted transfer
//! state, the commander that dispatches due transfers, the protocol engine
//! that moves the blocks, bandwidth shaping and spooled directories.

mod bandwidth;
mod catalog;
mod commander;
mod completion;
mod config;
mod context;
mod error;
pub mod protocol;
mod retry;
mod runner;
pub mod spooled;
pub mod storage;
mod tasks;
mod transfer;

pub use bandwidth::{Axis, BandwidthLimiter, SessionShaper};
pub use catalog::Catalog;
pub use commander::Commander;
pub use completion::{CompletionFuture, Completions};
pub use config::ConfigContext;
pub use context::EngineContext;
pub use error::{FerryError, Result};
pub use protocol::{Abort, ControlReply, ControlRequest, InfoKind};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{Reloaded, RunnerRepository, SpecialIdGenerator};
pub use storage::{MemoryTaskStore, OrderColumn, SqliteTaskStore, TaskFilter, TaskStore};
pub use tasks::{substitute, BusinessHandler, BusinessRegistry, TaskCall, TaskHook, TaskRegistry};
pub use transfer::SubmitRequest;

use chrono::{DateTime, Utc};
use ferry_types::{BandwidthLimit, CoreEvent, TaskKey, TaskRunner, TransferResult};
use protocol::Responder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

const DATABASE_FILE: &str = "ferry.db";

/// The main Ferry core instance, one per host
#[derive(Clone, Debug)]
pub struct FerryCore {
    engine: EngineContext,
    commander: Commander,
}

impl FerryCore {
    /// Open the host stored under `data_dir`: settings, rules and hosts,
    /// and the SQLite transfer table
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let config = ConfigContext::load_or_init(data_dir).await?;
        let catalog = Catalog::open(data_dir).await?;
        let store = SqliteTaskStore::open(data_dir.join(DATABASE_FILE)).await?;
        info!("Opened host {} in {}", config.host_id(), data_dir.display());
        Ok(Self::with_parts(config, Arc::new(store), catalog))
    }

    /// Build a core from explicit parts
    pub fn with_parts(config: ConfigContext, store: Arc<dyn TaskStore>, catalog: Catalog) -> Self {
        let engine = EngineContext::new(config, store, catalog);
        Self {
            commander: Commander::new(engine.clone()),
            engine,
        }
    }

    /// Default data directory: `FERRY_DATA_DIR`, else the platform data dir
    pub fn default_data_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("FERRY_DATA_DIR") {
            return PathBuf::from(dir);
        }
        directories::ProjectDirs::from("", "", "ferry")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".ferry"))
    }

    pub fn engine(&self) -> &EngineContext {
        &self.engine
    }

    pub fn config(&self) -> &ConfigContext {
        &self.engine.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.engine.catalog
    }

    /// Registry for custom task kinds
    pub fn tasks(&self) -> &TaskRegistry {
        &self.engine.tasks
    }

    /// Registry for BUSINESS request handlers
    pub fn business(&self) -> &BusinessRegistry {
        &self.engine.business
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.engine.subscribe()
    }

    // ========================================================================
    // Transfer Operations
    // ========================================================================

    /// Queue a transfer for the commander
    pub async fn submit(&self, request: SubmitRequest) -> Result<(TaskRunner, CompletionFuture)> {
        let (runner, _) = transfer::prepare(&self.engine, &request).await?;
        let key = runner.key();
        let signal = self.engine.completions.register(&key);
        self.engine.wakeup.notify_one();
        Ok((runner, CompletionFuture::new(key, signal, self.engine.repo.clone())))
    }

    /// Run a transfer now and wait for it, bypassing the queue
    pub async fn direct_transfer(&self, request: SubmitRequest) -> Result<TransferResult> {
        transfer::run_now(&self.engine, request).await
    }

    /// Future resolving when `key` finishes
    pub fn completion(&self, key: &TaskKey) -> CompletionFuture {
        let signal = self.engine.completions.register(key);
        CompletionFuture::new(key.clone(), signal, self.engine.repo.clone())
    }

    pub async fn status(&self, key: &TaskKey) -> Result<TaskRunner> {
        self.engine.repo.get(key).await
    }

    /// Most recent transfers first. A `limit` of 0 means all.
    pub async fn list(&self, filter: &TaskFilter, limit: usize) -> Result<Vec<TaskRunner>> {
        self.engine.repo.find(filter, OrderColumn::Start, false, limit).await
    }

    /// Stop a transfer, leaving it resumable
    pub async fn stop(&self, key: &TaskKey) -> Result<TaskRunner> {
        self.engine.abort_transfer(key, Abort::Stop).await
    }

    /// Cancel a transfer for good
    pub async fn cancel(&self, key: &TaskKey) -> Result<TaskRunner> {
        self.engine.abort_transfer(key, Abort::Cancel).await
    }

    /// Put an interrupted or failed transfer back in the queue
    pub async fn restart(&self, key: &TaskKey) -> Result<TaskRunner> {
        let runner = self.engine.repo.get(key).await?;
        if !runner.is_requester() {
            return Err(FerryError::InvalidOperation(format!(
                "transfer {key} is driven by {}",
                runner.requester
            )));
        }
        let runner = self.engine.repo.restart(key).await?;
        info!("Restarting transfer {} at rank {}", key, runner.rank);
        self.engine.emit(CoreEvent::TransferSubmitted { key: key.clone() });
        self.engine.wakeup.notify_one();
        Ok(runner)
    }

    /// Remove a finished transfer
    pub async fn delete(&self, key: &TaskKey) -> Result<()> {
        self.engine.repo.delete(key).await
    }

    /// Drop finished transfers older than `cutoff`
    pub async fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.engine.repo.purge(cutoff).await
    }

    /// New limits for this host, applied to running transfers at once
    pub async fn change_bandwidth(&self, limit: BandwidthLimit) -> Result<()> {
        self.engine.change_bandwidth(limit);
        self.engine.config.save().await
    }

    pub fn bandwidth(&self) -> BandwidthLimit {
        self.engine.limiter.limits()
    }

    /// Transfers the commander is running
    pub fn in_flight(&self) -> usize {
        self.commander.in_flight()
    }

    pub fn commander(&self) -> &Commander {
        &self.commander
    }

    // ========================================================================
    // Remote Control
    // ========================================================================

    /// Send a control request to `host_id` and return its answer
    pub async fn remote_control(&self, host_id: &str, request: ControlRequest) -> Result<ControlReply> {
        let host = self.engine.catalog.host(host_id)?;
        protocol::control_request(&self.engine, &host, request).await
    }

    // ========================================================================
    // Serving
    // ========================================================================

    /// Accept remote channels on the configured address
    pub async fn start_listener(&self) -> Result<SocketAddr> {
        let responder = Responder::new(self.engine.clone());
        self.engine.network.listen(Arc::new(responder)).await
    }

    pub fn start_commander(&self) {
        self.commander.start();
    }

    /// Listen and dispatch until shut down. Returns whether a restart was
    /// asked for.
    pub async fn serve(&self) -> Result<bool> {
        let address = self.start_listener().await?;
        self.start_commander();
        info!("Host {} serving on {}", self.engine.config.host_id(), address);

        self.engine.shutdown.cancelled().await;
        self.shutdown().await;
        Ok(self.engine.restart_requested())
    }

    /// Stop the commander, interrupt running transfers and close every
    /// connection
    pub async fn shutdown(&self) {
        if !self.engine.shutdown.is_cancelled() {
            self.engine.request_shutdown(false);
        }
        self.commander.stop().await;

        let active = self.engine.network.active();
        active.abort_all(Abort::Shutdown);
        let deadline = tokio::time::Instant::now() + self.engine.config.connection_timeout();
        while !active.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("{} transfer(s) still running at shutdown", active.len());
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        self.engine.network.close_all().await;
        info!("Host {} shut down", self.engine.config.host_id());
    }
}
