//! Registry of transfers running on this host
//!
//! Each running transfer holds a [`ChannelControl`] that the DATA loop polls
//! between blocks. Stop, cancel and shutdown requests reach the transfer
//! through it.

use crate::error::{FerryError, Result};
use ferry_types::TaskKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a running transfer was asked to end early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// Resumable later
    Stop,
    /// Final
    Cancel,
    /// The process is going down, resumable after restart
    Shutdown,
}

impl Abort {
    pub fn error(self) -> FerryError {
        match self {
            Abort::Stop => FerryError::Stopped,
            Abort::Cancel => FerryError::Cancelled,
            Abort::Shutdown => FerryError::Shutdown,
        }
    }
}

/// Cooperative abort signal for one transfer
#[derive(Clone, Debug, Default)]
pub struct ChannelControl {
    token: CancellationToken,
    reason: Arc<Mutex<Option<Abort>>>,
}

impl ChannelControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an abort. The first reason wins.
    pub fn abort(&self, reason: Abort) {
        let mut current = self.reason.lock();
        if current.is_none() {
            *current = Some(reason);
        }
        self.token.cancel();
    }

    pub fn aborted(&self) -> Option<Abort> {
        *self.reason.lock()
    }

    /// `Err` with the abort reason once one was requested
    pub fn check(&self) -> Result<()> {
        match self.aborted() {
            Some(reason) => Err(reason.error()),
            None => Ok(()),
        }
    }

    /// Resolves when an abort is requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[derive(Clone, Debug, Default)]
pub struct ActiveChannels {
    entries: Arc<Mutex<HashMap<TaskKey, ChannelControl>>>,
}

impl ActiveChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for the caller until the guard is dropped
    pub fn register(&self, key: &TaskKey) -> Result<ActiveGuard> {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(FerryError::Conflict(format!("transfer {key} is already running")));
        }
        let control = ChannelControl::new();
        entries.insert(key.clone(), control.clone());
        Ok(ActiveGuard {
            key: key.clone(),
            entries: self.entries.clone(),
            control,
        })
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal one transfer. Returns whether it was running here.
    pub fn abort(&self, key: &TaskKey, reason: Abort) -> bool {
        match self.entries.lock().get(key) {
            Some(control) => {
                control.abort(reason);
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self, reason: Abort) {
        for control in self.entries.lock().values() {
            control.abort(reason);
        }
    }

    /// Stop a leftover registration for `key` and wait up to `wait` for it
    /// to go away. Returns whether the key is free.
    pub async fn release(&self, key: &TaskKey, wait: Duration) -> bool {
        if !self.abort(key, Abort::Stop) {
            return true;
        }
        let deadline = tokio::time::Instant::now() + wait;
        while self.contains(key) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

/// Holds a key in [`ActiveChannels`]; dropping it frees the key
#[derive(Debug)]
pub struct ActiveGuard {
    key: TaskKey,
    entries: Arc<Mutex<HashMap<TaskKey, ChannelControl>>>,
    control: ChannelControl,
}

impl ActiveGuard {
    pub fn control(&self) -> &ChannelControl {
        &self.control
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.entries.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: i64) -> TaskKey {
        TaskKey::new(id, "a", "b")
    }

    #[test]
    fn a_key_is_held_once() {
        let active = ActiveChannels::new();
        let guard = active.register(&key(1)).unwrap();
        assert!(matches!(active.register(&key(1)), Err(FerryError::Conflict(_))));
        assert!(active.register(&key(2)).is_ok());
        drop(guard);
        assert!(active.register(&key(1)).is_ok());
    }

    #[test]
    fn first_abort_reason_wins() {
        let active = ActiveChannels::new();
        let guard = active.register(&key(1)).unwrap();
        assert!(guard.control().check().is_ok());

        assert!(active.abort(&key(1), Abort::Cancel));
        active.abort_all(Abort::Shutdown);
        assert!(matches!(guard.control().check(), Err(FerryError::Cancelled)));
        assert!(!active.abort(&key(9), Abort::Stop));
    }

    #[tokio::test]
    async fn release_waits_for_the_holder() {
        let active = ActiveChannels::new();
        let guard = active.register(&key(1)).unwrap();
        let control = guard.control().clone();
        tokio::spawn(async move {
            control.cancelled().await;
            drop(guard);
        });
        assert!(active.release(&key(1), Duration::from_secs(1)).await);
        assert!(!active.contains(&key(1)));
    }
}
