use super::{OrderColumn, TaskFilter, TaskStore};
use crate::error::{FerryError, Result};
use async_trait::async_trait;
use ferry_types::{TaskKey, TaskRunner};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rows kept in a map; nothing survives the process
#[derive(Clone, Debug, Default)]
pub struct MemoryTaskStore {
    rows: Arc<RwLock<HashMap<TaskKey, TaskRunner>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as an unreachable database would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FerryError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, runner: &TaskRunner) -> Result<()> {
        self.check()?;
        let key = runner.key();
        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return Err(FerryError::Conflict(format!("transfer {key} already exists")));
        }
        rows.insert(key, runner.clone());
        Ok(())
    }

    async fn update(&self, runner: &TaskRunner) -> Result<()> {
        self.check()?;
        let key = runner.key();
        let mut rows = self.rows.write();
        match rows.get_mut(&key) {
            Some(row) => {
                *row = runner.clone();
                Ok(())
            }
            None => Err(FerryError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &TaskKey) -> Result<()> {
        self.check()?;
        self.rows.write().remove(key);
        Ok(())
    }

    async fn select(&self, key: &TaskKey) -> Result<Option<TaskRunner>> {
        self.check()?;
        Ok(self.rows.read().get(key).cloned())
    }

    async fn find(
        &self,
        filter: &TaskFilter,
        order: OrderColumn,
        ascending: bool,
        limit: usize,
    ) -> Result<Vec<TaskRunner>> {
        self.check()?;
        let mut rows: Vec<TaskRunner> = self
            .rows
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            let ord = match order {
                OrderColumn::Start => a.start.cmp(&b.start),
                OrderColumn::Stop => a.stop.cmp(&b.stop),
                OrderColumn::SpecialId => a.special_id.cmp(&b.special_id),
            }
            .then(a.special_id.cmp(&b.special_id));
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });

        if limit > 0 {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}
