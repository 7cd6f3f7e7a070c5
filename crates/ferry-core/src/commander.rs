//! Commander - dispatches due transfers under a concurrency limit
//!
//! Runs a background loop that wakes on a fixed tick, or earlier when a
//! transfer is submitted or a slot frees up. Each tick reclaims stalled
//! rows, forwards stop/cancel requests written to storage by someone else,
//! and starts as many due TOSUBMIT rows as there are free slots. Rows that
//! do not fit stay queued in storage.

use crate::context::EngineContext;
use crate::error::Result;
use crate::protocol::Abort;
use crate::runner::Reloaded;
use crate::storage::{OrderColumn, TaskFilter};
use crate::transfer;
use chrono::Utc;
use ferry_types::{CoreEvent, ErrorCode, TaskKey, TaskRunner, UpdatedInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Inner {
    engine: EngineContext,
    slots: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    /// Rows dispatched from here, as last seen in storage
    running: Mutex<HashMap<TaskKey, TaskRunner>>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Scheduler for outbound transfers. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Commander {
    inner: Arc<Inner>,
}

impl Commander {
    pub fn new(engine: EngineContext) -> Self {
        let capacity = engine.config.max_concurrent().max(1);
        Self {
            inner: Arc::new(Inner {
                engine,
                slots: Arc::new(Semaphore::new(capacity)),
                capacity,
                in_flight: AtomicUsize::new(0),
                running: Mutex::new(HashMap::new()),
                token: CancellationToken::new(),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Start the background loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.inner.handle.lock();
        if handle.is_some() {
            info!("Commander already running");
            return;
        }

        let this = self.clone();
        let period = self.inner.engine.config.commander_interval();
        info!(
            "Starting commander: {} slot(s), tick every {:?}",
            self.inner.capacity, period
        );

        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let engine = this.inner.engine.clone();
            loop {
                tokio::select! {
                    _ = this.inner.token.cancelled() => break,
                    _ = engine.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = engine.wakeup.notified() => {}
                }
                // One bad tick must not end the loop.
                if let Err(e) = this.tick().await {
                    warn!("Commander tick skipped: {}", e);
                }
            }
            info!("Commander stopped");
        }));
    }

    /// Stop the loop. Transfers already dispatched keep running.
    pub async fn stop(&self) {
        self.inner.token.cancel();
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Transfers dispatched and not finished yet
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Free slots
    pub fn allowed_to_submit(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// One scheduling pass. Returns how many transfers were started.
    pub async fn tick(&self) -> Result<usize> {
        self.reclaim_stale().await?;
        self.forward_external_changes().await?;
        self.dispatch_due().await
    }

    /// RUNNING rows of this host that stopped making progress and are not
    /// running here become INTERRUPTED
    async fn reclaim_stale(&self) -> Result<()> {
        let engine = &self.inner.engine;
        let stale = engine.config.stale_timeout();
        let filter = TaskFilter {
            owner: Some(engine.config.host_id()),
            updated_info: vec![UpdatedInfo::Running],
            stop_before: Some(Utc::now() - chrono::Duration::milliseconds(stale.as_millis() as i64)),
            ..Default::default()
        };

        for runner in engine.repo.find(&filter, OrderColumn::Stop, true, 0).await? {
            let key = runner.key();
            if engine.network.active().contains(&key) {
                continue;
            }
            let runner = engine
                .repo
                .mutate(&key, |r| {
                    if r.updated_info == UpdatedInfo::Running {
                        r.mark_interrupted(ErrorCode::Disconnection, format!("no progress for {stale:?}"));
                    }
                    Ok(())
                })
                .await?;
            warn!("Reclaimed stalled transfer {} at rank {}", key, runner.rank);
            engine.emit(CoreEvent::TransferStatusChanged {
                key,
                info: runner.updated_info,
                step: runner.global_step,
                code: runner.step_status,
            });
        }
        Ok(())
    }

    /// Signal running transfers whose row was stopped or cancelled in storage
    async fn forward_external_changes(&self) -> Result<()> {
        let engine = &self.inner.engine;
        let snapshots: Vec<TaskRunner> = self.inner.running.lock().values().cloned().collect();

        for snapshot in snapshots {
            let key = snapshot.key();
            let reason = match engine.repo.reload(&snapshot).await? {
                Reloaded::Unchanged(current) => {
                    if let Some(entry) = self.inner.running.lock().get_mut(&key) {
                        *entry = current;
                    }
                    None
                }
                Reloaded::Changed { current, .. } => match current.updated_info {
                    UpdatedInfo::Interrupted => Some(Abort::Stop),
                    UpdatedInfo::InError => Some(Abort::Cancel),
                    _ => None,
                },
                Reloaded::Missing => Some(Abort::Cancel),
            };
            if let Some(reason) = reason {
                if engine.network.active().abort(&key, reason) {
                    info!("Transfer {} changed in storage, sending {:?}", key, reason);
                }
            }
        }
        Ok(())
    }

    async fn dispatch_due(&self) -> Result<usize> {
        let engine = &self.inner.engine;
        if engine.shutdown.is_cancelled() || self.allowed_to_submit() == 0 {
            return Ok(0);
        }

        let filter = TaskFilter {
            owner: Some(engine.config.host_id()),
            updated_info: vec![UpdatedInfo::ToSubmit],
            start_to: Some(Utc::now()),
            ..Default::default()
        };
        let due = engine.repo.find(&filter, OrderColumn::Start, true, 0).await?;

        let mut started = 0;
        for runner in due {
            let key = runner.key();
            // Passive rows are driven by the remote requester.
            if !runner.is_requester() || engine.network.active().contains(&key) {
                continue;
            }
            let permit = match self.inner.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let guard = match transfer::claim(engine, &key).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("Cannot dispatch {}: {}", key, e);
                    continue;
                }
            };
            let mut snapshot = runner;
            snapshot.set_running();
            self.inner.running.lock().insert(key.clone(), snapshot);
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            debug!("Dispatching {} ({} in flight)", key, self.in_flight());

            let this = self.clone();
            tokio::spawn(async move {
                transfer::execute(this.inner.engine.clone(), key.clone(), guard).await;
                drop(permit);
                this.inner.running.lock().remove(&key);
                this.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                this.inner.engine.wakeup.notify_one();
            });
            started += 1;
        }
        Ok(started)
    }
}
