//! Submitting and dispatching outbound transfers

use crate::context::EngineContext;
use crate::error::{FerryError, Result};
use crate::protocol::{requester, ActiveGuard};
use crate::retry::{RetryDecision, RetryPolicy};
use chrono::{DateTime, Utc};
use ferry_types::{CoreEvent, ErrorCode, TaskKey, TaskRunner, TransferResult, UpdatedInfo};
use tracing::{error, info, warn};

/// What a client asks for when queueing a transfer
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub rule_id: String,
    pub remote_host: String,
    pub filename: String,
    pub file_info: String,
    pub use_digest: bool,
    /// Clamped into the configured bounds; `None` takes the default.
    pub blocksize: Option<u32>,
    /// Reuse an id, e.g. to resume a known transfer
    pub special_id: Option<i64>,
    /// Not dispatched before this time
    pub start_time: Option<DateTime<Utc>>,
    pub follow_id: Option<String>,
}

impl SubmitRequest {
    pub fn new(rule_id: impl Into<String>, remote_host: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            remote_host: remote_host.into(),
            filename: filename.into(),
            file_info: String::new(),
            use_digest: false,
            blocksize: None,
            special_id: None,
            start_time: None,
            follow_id: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.file_info = info.into();
        self
    }

    pub fn with_digest(mut self, use_digest: bool) -> Self {
        self.use_digest = use_digest;
        self
    }

    pub fn with_blocksize(mut self, blocksize: u32) -> Self {
        self.blocksize = Some(blocksize);
        self
    }

    pub fn with_special_id(mut self, special_id: i64) -> Self {
        self.special_id = Some(special_id);
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_follow_id(mut self, follow: impl Into<String>) -> Self {
        self.follow_id = Some(follow.into());
        self
    }
}

/// Validate `request` and store its runner in TOSUBMIT.
///
/// Returns the runner and whether a new row was written. Asking again for
/// a special id that is still live hands back the existing row; an
/// interrupted one is requeued.
pub async fn prepare(engine: &EngineContext, request: &SubmitRequest) -> Result<(TaskRunner, bool)> {
    let local = engine.config.host_id();
    if request.remote_host == local {
        return Err(FerryError::refused(
            ErrorCode::LoopSelfRequestedHost,
            format!("{local} cannot send to itself"),
        ));
    }
    let rule = engine.catalog.rule(&request.rule_id)?;
    engine.catalog.host(&request.remote_host)?;
    if !rule.allows_host(&request.remote_host) {
        return Err(FerryError::refused(
            ErrorCode::FileNotAllowed,
            format!("rule {} is not open to {}", rule.id, request.remote_host),
        ));
    }

    let mut special_id = request.special_id.unwrap_or_else(|| engine.repo.next_special_id());
    let key = TaskKey::new(special_id, local.as_str(), request.remote_host.as_str());
    if let Some(existing) = engine.repo.select(&key).await? {
        match existing.updated_info {
            UpdatedInfo::Interrupted => {
                let runner = engine.repo.restart(&key).await?;
                info!("Requeued interrupted transfer {} at rank {}", key, runner.rank);
                engine.emit(CoreEvent::TransferSubmitted { key });
                return Ok((runner, false));
            }
            UpdatedInfo::ToSubmit | UpdatedInfo::Running => return Ok((existing, false)),
            UpdatedInfo::Done | UpdatedInfo::InError => special_id = engine.repo.next_special_id(),
        }
    }

    let key = TaskKey::new(special_id, local.as_str(), request.remote_host.as_str());
    let mut runner = TaskRunner::new(key.clone(), &rule, &local, &request.filename, &request.file_info);
    if let Some(follow) = &request.follow_id {
        runner = runner.with_follow_id(follow);
    }
    runner.use_digest = request.use_digest;
    runner.blocksize = engine.config.clamp_blocksize(request.blocksize.unwrap_or(0));
    if let Some(start) = request.start_time {
        runner.start = start;
    }
    if runner.is_sender {
        // The file may only show up once pre tasks ran.
        runner.file_size = tokio::fs::metadata(engine.send_path(&rule, &request.filename))
            .await
            .ok()
            .map(|m| m.len());
    }

    engine.repo.insert(&runner).await?;
    info!("Submitted transfer {} ({} via rule {})", key, request.filename, rule.id);
    engine.emit(CoreEvent::TransferSubmitted { key });
    Ok((runner, true))
}

/// Claim `key` for this process and mark its row RUNNING
pub(crate) async fn claim(engine: &EngineContext, key: &TaskKey) -> Result<ActiveGuard> {
    let guard = engine.network.active().register(key)?;
    engine
        .repo
        .mutate(key, |r| {
            r.set_running();
            Ok(())
        })
        .await?;
    Ok(guard)
}

/// Prepare `request` and run it right away in the caller's task, outside
/// the commander's slots
pub async fn run_now(engine: &EngineContext, mut request: SubmitRequest) -> Result<TransferResult> {
    // Hold the key before the row exists so a commander tick cannot grab it.
    let local = engine.config.host_id();
    let special_id = *request.special_id.get_or_insert_with(|| engine.repo.next_special_id());
    let key = TaskKey::new(special_id, local.as_str(), request.remote_host.as_str());
    let guard = engine.network.active().register(&key)?;

    let (runner, _) = prepare(engine, &request).await?;
    let guard = if runner.key() == key {
        guard
    } else {
        drop(guard);
        engine.network.active().register(&runner.key())?
    };
    let key = runner.key();
    engine
        .repo
        .mutate(&key, |r| {
            r.set_running();
            Ok(())
        })
        .await?;
    Ok(execute(engine.clone(), key, guard).await)
}

/// Drive one claimed transfer to its end, retrying connection failures
pub(crate) async fn execute(engine: EngineContext, key: TaskKey, guard: ActiveGuard) -> TransferResult {
    let policy = RetryPolicy::from(engine.config.retry());
    let control = guard.control().clone();
    let mut attempt = 0;

    let result = loop {
        attempt += 1;
        let error = match requester::run(&engine, &key, &control).await {
            Ok(runner) => break TransferResult::from_runner(runner, attempt),
            Err(e) => e,
        };

        match policy.decide(attempt, &error) {
            RetryDecision::RetryAfter(delay) => {
                warn!("Attempt {} for {} failed: {}; retrying in {:?}", attempt, key, error, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = control.cancelled() => {
                        let aborted = control.check().err().unwrap_or(error);
                        break fail(&engine, &key, &aborted, attempt).await;
                    }
                }
            }
            RetryDecision::NoRetry => break fail(&engine, &key, &error, attempt).await,
        }
    };
    drop(guard);

    if result.success {
        info!("Transfer {} completed after {} attempt(s)", key, attempt);
    }
    engine.emit(CoreEvent::TransferCompleted { result: result.clone() });
    engine.completions.complete(&result);
    engine.wakeup.notify_one();
    result
}

/// Persist a failure, run the rule's error tasks, and build the result
pub(crate) async fn fail(engine: &EngineContext, key: &TaskKey, error: &FerryError, attempts: u32) -> TransferResult {
    let runner = match engine.repo.record_failure(key, error).await {
        Ok(runner) => runner,
        Err(e) => {
            error!("Cannot record failure of {} ({}): {}", key, error, e);
            return TransferResult {
                key: key.clone(),
                success: false,
                code: error.code(),
                attempts,
                message: Some(error.to_string()),
                runner: None,
            };
        }
    };

    match runner.updated_info {
        UpdatedInfo::Interrupted => warn!("Transfer {} interrupted at rank {}: {}", key, runner.rank, error),
        _ => error!("Transfer {} failed: {}", key, error),
    }

    if let Ok(rule) = engine.catalog.rule(&runner.rule_id) {
        let path = if runner.is_sender {
            engine.send_path(&rule, &runner.filename)
        } else {
            engine.work_path(&rule, &runner.filename, runner.special_id)
        };
        engine.tasks.run_error_tasks(engine, &runner, &rule.error_tasks, path).await;
    }

    engine.emit(CoreEvent::TransferStatusChanged {
        key: key.clone(),
        info: runner.updated_info,
        step: runner.global_step,
        code: runner.step_status,
    });
    TransferResult::from_runner(runner, attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::ConfigContext;
    use crate::storage::MemoryTaskStore;
    use ferry_types::{Direction, HostAuth, Rule, Settings};
    use std::sync::Arc;

    fn engine() -> EngineContext {
        let mut settings = Settings::default();
        settings.host_id = "alpha".into();
        let mut closed = Rule::new("closed", Direction::Send);
        closed.host_ids = vec!["gamma".into()];
        EngineContext::new(
            ConfigContext::new(settings),
            Arc::new(MemoryTaskStore::new()),
            Catalog::in_memory(
                vec![Rule::new("out", Direction::Send), closed],
                vec![
                    HostAuth::new("alpha", "127.0.0.1", 1, "a"),
                    HostAuth::new("beta", "127.0.0.1", 2, "b"),
                ],
            ),
        )
    }

    #[tokio::test]
    async fn submitting_to_self_is_refused() {
        let engine = engine();
        let result = prepare(&engine, &SubmitRequest::new("out", "alpha", "f")).await;
        assert!(matches!(
            result,
            Err(FerryError::Refused {
                code: ErrorCode::LoopSelfRequestedHost,
                ..
            })
        ));
        let result = prepare(&engine, &SubmitRequest::new("closed", "beta", "f")).await;
        assert!(matches!(
            result,
            Err(FerryError::Refused {
                code: ErrorCode::FileNotAllowed,
                ..
            })
        ));
        assert!(matches!(
            prepare(&engine, &SubmitRequest::new("nope", "beta", "f")).await,
            Err(FerryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn live_special_id_is_not_duplicated() {
        let engine = engine();
        let request = SubmitRequest::new("out", "beta", "f").with_special_id(77).with_blocksize(4096);
        let (first, created) = prepare(&engine, &request).await.unwrap();
        assert!(created);
        assert_eq!(first.special_id, 77);
        assert_eq!(first.blocksize, 4096);

        engine
            .repo
            .mutate(&first.key(), |r| {
                r.set_running();
                Ok(())
            })
            .await
            .unwrap();
        let (again, created) = prepare(&engine, &request).await.unwrap();
        assert!(!created);
        assert_eq!(again.key(), first.key());

        engine.repo.mark_done(&first.key()).await.unwrap();
        let (fresh, created) = prepare(&engine, &request).await.unwrap();
        assert!(created);
        assert_ne!(fresh.special_id, 77);
    }

    #[tokio::test]
    async fn interrupted_special_id_is_requeued() {
        let engine = engine();
        let request = SubmitRequest::new("out", "beta", "f").with_special_id(5);
        let (runner, _) = prepare(&engine, &request).await.unwrap();
        engine
            .repo
            .record_failure(&runner.key(), &FerryError::Disconnected)
            .await
            .unwrap();

        let (again, created) = prepare(&engine, &request).await.unwrap();
        assert!(!created);
        assert_eq!(again.updated_info, UpdatedInfo::ToSubmit);
    }

    #[tokio::test]
    async fn follow_id_and_start_time_are_kept() {
        let engine = engine();
        let start = Utc::now() + chrono::Duration::hours(1);
        let request = SubmitRequest::new("out", "beta", "f")
            .with_follow_id("chain-1")
            .with_start_time(start);
        let (runner, _) = prepare(&engine, &request).await.unwrap();
        assert_eq!(runner.follow_id().as_deref(), Some("chain-1"));
        assert_eq!(runner.start, start);
    }

    #[tokio::test]
    async fn failure_result_carries_the_code() {
        let engine = engine();
        let (runner, _) = prepare(&engine, &SubmitRequest::new("out", "beta", "f")).await.unwrap();
        let result = fail(&engine, &runner.key(), &FerryError::Authentication("bad key".into()), 1).await;
        assert!(!result.success);
        assert_eq!(result.code, ErrorCode::BadAuthent);
        assert_eq!(result.runner.unwrap().updated_info, UpdatedInfo::InError);

        let missing = TaskKey::new(1, "alpha", "beta");
        let result = fail(&engine, &missing, &FerryError::Disconnected, 2).await;
        assert!(result.runner.is_none());
        assert_eq!(result.code, ErrorCode::Disconnection);
    }
}
