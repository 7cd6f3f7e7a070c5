//! Repository around the TaskRunner value object
//!
//! Every change follows select, mutate, persist. Changes to the same key are
//! serialized through a per-key async lock; different keys never wait on
//! each other.

use crate::error::{FerryError, Result};
use crate::storage::{OrderColumn, TaskFilter, TaskStore};
use chrono::{DateTime, Utc};
use ferry_types::{ErrorCode, GlobalStep, Rule, TaskKey, TaskRunner, UpdatedInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Process-wide source of special ids.
///
/// Seeded from the wall clock in microseconds so ids keep growing across
/// restarts.
#[derive(Debug)]
pub struct SpecialIdGenerator {
    next: AtomicI64,
}

impl SpecialIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(Utc::now().timestamp_micros()),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SpecialIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// What `reload` found in storage compared to the caller's copy
#[derive(Debug, Clone)]
pub enum Reloaded {
    Unchanged(TaskRunner),
    /// Someone else changed the scheduling status, e.g. an external stop.
    Changed { previous: UpdatedInfo, current: TaskRunner },
    Missing,
}

/// Runner persistence with per-key serialization
#[derive(Clone, Debug)]
pub struct RunnerRepository {
    store: Arc<dyn TaskStore>,
    locks: Arc<Mutex<HashMap<TaskKey, Arc<tokio::sync::Mutex<()>>>>>,
    ids: Arc<SpecialIdGenerator>,
}

impl RunnerRepository {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
            ids: Arc::new(SpecialIdGenerator::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn next_special_id(&self) -> i64 {
        self.ids.next_id()
    }

    fn lock_for(&self, key: &TaskKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        // Forget locks nobody holds any more.
        if locks.len() > 1024 {
            locks.retain(|_, l| Arc::strong_count(l) > 1);
        }
        locks.entry(key.clone()).or_default().clone()
    }

    /// Build and persist a new runner in TOSUBMIT
    pub async fn create(
        &self,
        rule: &Rule,
        requester: &str,
        requested: &str,
        filename: &str,
        file_info: &str,
    ) -> Result<TaskRunner> {
        let key = TaskKey::new(self.next_special_id(), requester, requested);
        let runner = TaskRunner::new(key, rule, requester, filename, file_info);
        self.store.insert(&runner).await?;
        Ok(runner)
    }

    pub async fn insert(&self, runner: &TaskRunner) -> Result<()> {
        self.store.insert(runner).await
    }

    pub async fn select(&self, key: &TaskKey) -> Result<Option<TaskRunner>> {
        self.store.select(key).await
    }

    pub async fn get(&self, key: &TaskKey) -> Result<TaskRunner> {
        self.store
            .select(key)
            .await?
            .ok_or_else(|| FerryError::NotFound(key.to_string()))
    }

    /// Re-fetch the row and compare it with `runner`
    pub async fn reload(&self, runner: &TaskRunner) -> Result<Reloaded> {
        Ok(match self.store.select(&runner.key()).await? {
            None => Reloaded::Missing,
            Some(current) if current.updated_info != runner.updated_info => Reloaded::Changed {
                previous: runner.updated_info,
                current,
            },
            Some(current) => Reloaded::Unchanged(current),
        })
    }

    pub async fn find(
        &self,
        filter: &TaskFilter,
        order: OrderColumn,
        ascending: bool,
        limit: usize,
    ) -> Result<Vec<TaskRunner>> {
        self.store.find(filter, order, ascending, limit).await
    }

    /// Select, apply `f`, persist. Returns the stored result.
    pub async fn mutate<F>(&self, key: &TaskKey, f: F) -> Result<TaskRunner>
    where
        F: FnOnce(&mut TaskRunner) -> Result<()>,
    {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let mut runner = self.get(key).await?;
        f(&mut runner)?;
        self.store.update(&runner).await?;
        Ok(runner)
    }

    pub async fn update_rank(&self, key: &TaskKey, rank: u64) -> Result<TaskRunner> {
        self.mutate(key, |r| Ok(r.update_rank(rank)?)).await
    }

    pub async fn set_step(&self, key: &TaskKey, step: GlobalStep, status: ErrorCode) -> Result<TaskRunner> {
        self.mutate(key, |r| Ok(r.set_step(step, status)?)).await
    }

    pub async fn mark_done(&self, key: &TaskKey) -> Result<TaskRunner> {
        self.mutate(key, |r| {
            r.mark_done();
            Ok(())
        })
        .await
    }

    pub async fn mark_error(&self, key: &TaskKey, code: ErrorCode, message: &str) -> Result<TaskRunner> {
        self.mutate(key, |r| {
            r.mark_error(code, message);
            Ok(())
        })
        .await
    }

    /// Record a failure, leaving terminal rows untouched
    pub async fn record_failure(&self, key: &TaskKey, error: &FerryError) -> Result<TaskRunner> {
        self.mutate(key, |r| {
            if r.is_terminal() {
                return Ok(());
            }
            match error.outcome() {
                UpdatedInfo::Interrupted => r.mark_interrupted(error.code(), error.to_string()),
                _ => r.mark_error(error.code(), error.to_string()),
            }
            Ok(())
        })
        .await
    }

    /// Requeue an interrupted or failed runner
    pub async fn restart(&self, key: &TaskKey) -> Result<TaskRunner> {
        self.mutate(key, |r| Ok(r.restart()?)).await
    }

    /// Remove a finished runner. Live ones must be stopped or cancelled first.
    pub async fn delete(&self, key: &TaskKey) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let runner = self.get(key).await?;
        if !runner.is_terminal() {
            return Err(FerryError::Conflict(format!(
                "transfer {key} is {}; stop or cancel it before deleting",
                runner.updated_info
            )));
        }
        self.store.delete(key).await?;
        debug!("Deleted transfer {}", key);
        Ok(())
    }

    /// Drop DONE and INERROR rows whose last activity is older than `cutoff`
    pub async fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let filter = TaskFilter {
            updated_info: vec![UpdatedInfo::Done, UpdatedInfo::InError],
            stop_before: Some(cutoff),
            ..Default::default()
        };
        let rows = self.store.find(&filter, OrderColumn::Stop, true, 0).await?;
        for runner in &rows {
            self.store.delete(&runner.key()).await?;
        }
        if !rows.is_empty() {
            debug!("Purged {} finished transfers", rows.len());
        }
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTaskStore;
    use ferry_types::Direction;

    fn repo() -> RunnerRepository {
        RunnerRepository::new(Arc::new(MemoryTaskStore::new()))
    }

    #[test]
    fn special_ids_are_unique_and_increasing() {
        let ids = SpecialIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn delete_requires_terminal_state() {
        let repo = repo();
        let rule = Rule::new("out", Direction::Send);
        let runner = repo.create(&rule, "a", "b", "f", "").await.unwrap();
        let key = runner.key();

        assert!(matches!(repo.delete(&key).await, Err(FerryError::Conflict(_))));
        repo.mark_error(&key, ErrorCode::CanceledTransfer, "canceled").await.unwrap();
        repo.delete(&key).await.unwrap();
        assert!(repo.select(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reload_detects_external_change() {
        let repo = repo();
        let rule = Rule::new("out", Direction::Send);
        let mut runner = repo.create(&rule, "a", "b", "f", "").await.unwrap();
        runner.set_running();
        repo.store().update(&runner).await.unwrap();

        assert!(matches!(repo.reload(&runner).await.unwrap(), Reloaded::Unchanged(_)));

        repo.mutate(&runner.key(), |r| {
            r.mark_interrupted(ErrorCode::StoppedTransfer, "stop");
            Ok(())
        })
        .await
        .unwrap();

        match repo.reload(&runner).await.unwrap() {
            Reloaded::Changed { previous, current } => {
                assert_eq!(previous, UpdatedInfo::Running);
                assert_eq!(current.updated_info, UpdatedInfo::Interrupted);
            }
            other => panic!("expected a change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_rank_updates_on_one_key_are_serialized() {
        let repo = repo();
        let rule = Rule::new("out", Direction::Send);
        let key = repo.create(&rule, "a", "b", "f", "").await.unwrap().key();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let repo = repo.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                repo.mutate(&key, |r| Ok(r.update_rank(r.rank + 1)?)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(repo.get(&key).await.unwrap().rank, 20);
    }

    #[tokio::test]
    async fn purge_keeps_live_and_recent_rows() {
        let repo = repo();
        let rule = Rule::new("out", Direction::Send);
        let done = repo.create(&rule, "a", "b", "f", "").await.unwrap().key();
        let queued = repo.create(&rule, "a", "b", "g", "").await.unwrap().key();
        repo.mark_done(&done).await.unwrap();

        assert_eq!(repo.purge(Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(repo.purge(Utc::now() + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert!(repo.select(&done).await.unwrap().is_none());
        assert!(repo.select(&queued).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failure_keeps_terminal_rows() {
        let repo = repo();
        let rule = Rule::new("out", Direction::Send);
        let key = repo.create(&rule, "a", "b", "f", "").await.unwrap().key();
        repo.mark_done(&key).await.unwrap();

        let after = repo.record_failure(&key, &FerryError::Disconnected).await.unwrap();
        assert!(after.is_all_done());
    }
}
