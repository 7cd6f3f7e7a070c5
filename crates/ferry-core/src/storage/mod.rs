//! Persistence of TaskRunner rows
//!
//! The engine only talks to the [`TaskStore`] trait. Two implementations are
//! provided: SQLite for real hosts and an in-memory map for tests and
//! storage-less runs.

mod memory;
mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_types::{ErrorCode, GlobalStep, TaskKey, TaskRunner, UpdatedInfo};

/// Predicate fields accepted by [`TaskStore::find`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub owner: Option<String>,
    pub updated_info: Vec<UpdatedInfo>,
    pub global_step: Option<GlobalStep>,
    pub global_last_step: Option<GlobalStep>,
    pub step_status: Option<ErrorCode>,
    pub start_from: Option<DateTime<Utc>>,
    pub start_to: Option<DateTime<Utc>>,
    /// Matches rows whose last progress is older than this.
    pub stop_before: Option<DateTime<Utc>>,
    pub rule_id: Option<String>,
}

impl TaskFilter {
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn status(mut self, info: UpdatedInfo) -> Self {
        self.updated_info.push(info);
        self
    }

    pub fn matches(&self, runner: &TaskRunner) -> bool {
        self.owner.as_ref().map_or(true, |o| *o == runner.owner)
            && (self.updated_info.is_empty() || self.updated_info.contains(&runner.updated_info))
            && self.global_step.map_or(true, |s| s == runner.global_step)
            && self.global_last_step.map_or(true, |s| s == runner.global_last_step)
            && self.step_status.map_or(true, |s| s == runner.step_status)
            && self.start_from.map_or(true, |t| runner.start >= t)
            && self.start_to.map_or(true, |t| runner.start <= t)
            && self.stop_before.map_or(true, |t| runner.stop < t)
            && self.rule_id.as_ref().map_or(true, |r| *r == runner.rule_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderColumn {
    #[default]
    Start,
    Stop,
    SpecialId,
}

/// Query surface the engine needs from storage
#[async_trait]
pub trait TaskStore: Send + Sync + std::fmt::Debug {
    /// Insert a new row. Fails with `Conflict` when the key exists.
    async fn insert(&self, runner: &TaskRunner) -> Result<()>;

    /// Overwrite an existing row. Fails with `NotFound` when absent.
    async fn update(&self, runner: &TaskRunner) -> Result<()>;

    async fn delete(&self, key: &TaskKey) -> Result<()>;

    async fn select(&self, key: &TaskKey) -> Result<Option<TaskRunner>>;

    /// Rows matching `filter`, sorted on `order`. A `limit` of 0 means all.
    async fn find(
        &self,
        filter: &TaskFilter,
        order: OrderColumn,
        ascending: bool,
        limit: usize,
    ) -> Result<Vec<TaskRunner>>;
}
