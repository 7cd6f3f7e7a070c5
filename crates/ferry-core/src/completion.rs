//! Waiting for a submitted transfer to finish

use crate::error::Result;
use crate::runner::RunnerRepository;
use ferry_types::{TaskKey, TransferResult, UpdatedInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const STORAGE_POLL: Duration = Duration::from_millis(250);

/// Pending waiters keyed by transfer
#[derive(Clone, Debug, Default)]
pub struct Completions {
    waiters: Arc<Mutex<HashMap<TaskKey, Vec<oneshot::Sender<TransferResult>>>>>,
}

impl Completions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &TaskKey) -> oneshot::Receiver<TransferResult> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        forget_dropped(&mut waiters);
        waiters.entry(key.clone()).or_default().push(tx);
        rx
    }

    /// Wake everyone still waiting on `result.key`
    pub fn complete(&self, result: &TransferResult) {
        let waiters = self.waiters.lock().remove(&result.key).unwrap_or_default();
        for waiter in waiters.into_iter().filter(|w| !w.is_closed()) {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn pending(&self) -> usize {
        let mut waiters = self.waiters.lock();
        forget_dropped(&mut waiters);
        waiters.values().map(Vec::len).sum()
    }
}

/// Drop senders whose future went away without waiting for the end
fn forget_dropped(waiters: &mut HashMap<TaskKey, Vec<oneshot::Sender<TransferResult>>>) {
    waiters.retain(|_, senders| {
        senders.retain(|tx| !tx.is_closed());
        !senders.is_empty()
    });
}

/// Resolves once the transfer ends, in this process or in another one
/// sharing the same store
pub struct CompletionFuture {
    key: TaskKey,
    signal: Option<oneshot::Receiver<TransferResult>>,
    repo: RunnerRepository,
}

impl CompletionFuture {
    pub(crate) fn new(key: TaskKey, signal: oneshot::Receiver<TransferResult>, repo: RunnerRepository) -> Self {
        Self {
            key,
            signal: Some(signal),
            repo,
        }
    }

    /// Future that only watches storage
    pub fn polling(key: TaskKey, repo: RunnerRepository) -> Self {
        Self {
            key,
            signal: None,
            repo,
        }
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub async fn wait(mut self) -> Result<TransferResult> {
        loop {
            let dropped = match self.signal.as_mut() {
                Some(signal) => tokio::select! {
                    result = signal => match result {
                        Ok(result) => return Ok(result),
                        // Sender gone without an answer: rely on storage.
                        Err(_) => true,
                    },
                    _ = tokio::time::sleep(STORAGE_POLL) => false,
                },
                None => {
                    tokio::time::sleep(STORAGE_POLL).await;
                    false
                }
            };
            if dropped {
                self.signal = None;
            }

            let runner = self.repo.get(&self.key).await?;
            if runner.is_terminal() || runner.updated_info == UpdatedInfo::Interrupted {
                return Ok(TransferResult::from_runner(runner, 0));
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Option<TransferResult>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTaskStore;
    use ferry_types::{Direction, ErrorCode, Rule};

    async fn repo_with_runner() -> (RunnerRepository, TaskKey) {
        let repo = RunnerRepository::new(Arc::new(MemoryTaskStore::new()));
        let rule = Rule::new("out", Direction::Send);
        let runner = repo.create(&rule, "a", "b", "f.txt", "").await.unwrap();
        (repo, runner.key())
    }

    #[tokio::test]
    async fn signal_resolves_the_future() {
        let (repo, key) = repo_with_runner().await;
        let completions = Completions::new();
        let future = CompletionFuture::new(key.clone(), completions.register(&key), repo.clone());
        assert_eq!(completions.pending(), 1);

        let runner = repo.mark_done(&key).await.unwrap();
        completions.complete(&TransferResult::from_runner(runner, 1));

        let result = future.wait().await.unwrap();
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(completions.pending(), 0);
    }

    #[tokio::test]
    async fn abandoned_futures_leave_no_waiter_behind() {
        let (repo, key) = repo_with_runner().await;
        let completions = Completions::new();
        for _ in 0..10 {
            drop(CompletionFuture::new(key.clone(), completions.register(&key), repo.clone()));
        }
        assert_eq!(completions.pending(), 0);
        assert!(completions.waiters.lock().is_empty());

        let kept = CompletionFuture::new(key.clone(), completions.register(&key), repo.clone());
        drop(CompletionFuture::new(key.clone(), completions.register(&key), repo.clone()));
        assert_eq!(completions.pending(), 1);

        let runner = repo.mark_done(&key).await.unwrap();
        completions.complete(&TransferResult::from_runner(runner, 1));
        assert!(kept.wait().await.unwrap().success);
        assert!(completions.waiters.lock().is_empty());
    }

    #[tokio::test]
    async fn storage_is_polled_without_a_signal() {
        let (repo, key) = repo_with_runner().await;
        let future = CompletionFuture::polling(key.clone(), repo.clone());

        let writer = repo.clone();
        let failed = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.mark_error(&failed, ErrorCode::BadAuthent, "bad key").await.unwrap();
        });

        let result = future.wait_timeout(Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.code, ErrorCode::BadAuthent);
    }
}
