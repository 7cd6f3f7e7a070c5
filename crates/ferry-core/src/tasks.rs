//! Pre, transfer, post and error tasks attached to rules
//!
//! A rule names its tasks by kind. The kind is looked up in a
//! [`TaskRegistry`] holding the built-ins and any hook registered by the
//! embedding application.

use crate::context::EngineContext;
use crate::error::{FerryError, Result};
use crate::transfer::SubmitRequest;
use async_trait::async_trait;
use ferry_types::{GlobalStep, HostAuth, RuleTask, TaskKey, TaskPolicy, TaskRunner};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// One task invocation
pub struct TaskCall<'a> {
    pub engine: &'a EngineContext,
    pub runner: &'a TaskRunner,
    /// Current file. Tasks that move the file update it.
    pub path: PathBuf,
    /// Arguments after substitution
    pub args: String,
}

#[async_trait]
pub trait TaskHook: Send + Sync {
    async fn run(&self, call: &mut TaskCall<'_>) -> Result<()>;
}

/// Replace the `#...#` placeholders in task arguments
pub fn substitute(template: &str, runner: &TaskRunner, path: &Path) -> String {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let values = [
        ("#TRUEFULLPATH#", path.display().to_string()),
        ("#ORIGINALFILENAME#", runner.original_filename.clone()),
        ("#FILENAME#", filename),
        ("#SPECIALID#", runner.special_id.to_string()),
        ("#RULE#", runner.rule_id.clone()),
        ("#REQUESTER#", runner.requester.clone()),
        ("#REQUESTED#", runner.requested.clone()),
        ("#REMOTEHOST#", runner.remote_host().to_string()),
        ("#FOLLOWID#", runner.follow_id().unwrap_or_default()),
        ("#RANK#", runner.rank.to_string()),
        ("#BLOCKSIZE#", runner.blocksize.to_string()),
    ];
    values
        .iter()
        .fold(template.to_string(), |acc, (name, value)| acc.replace(name, value))
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone)]
pub struct TaskRegistry {
    hooks: Arc<RwLock<HashMap<String, Arc<dyn TaskHook>>>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.hooks.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("TaskRegistry").field("hooks", &names).finish()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        let registry = Self {
            hooks: Arc::new(RwLock::new(HashMap::new())),
        };
        registry.register("LOG", LogTask);
        registry.register("EXEC", ExecTask);
        registry.register("COPY", CopyTask);
        registry.register("MOVE", MoveTask);
        registry.register("RENAME", RenameTask);
        registry.register("DELETE", DeleteTask);
        registry.register("TRANSFER", TransferTask);
        registry
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the hook for `kind` (case insensitive)
    pub fn register(&self, kind: &str, hook: impl TaskHook + 'static) {
        self.hooks.write().insert(kind.to_uppercase(), Arc::new(hook));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHook>> {
        self.hooks.read().get(&kind.to_uppercase()).cloned()
    }

    /// Run the tasks of `step` for the runner `key`, resuming at the task
    /// index stored on the runner. The runner must already be in `step`.
    /// Returns the path of the file after the tasks ran.
    pub async fn run_step(
        &self,
        engine: &EngineContext,
        key: &TaskKey,
        step: GlobalStep,
        tasks: &[RuleTask],
        mut path: PathBuf,
    ) -> Result<PathBuf> {
        if tasks.is_empty() {
            return Ok(path);
        }
        let runner = engine.repo.get(key).await?;
        let first = if runner.global_step == step { runner.step as usize } else { 0 };

        for (index, task) in tasks.iter().enumerate().skip(first) {
            let runner = engine
                .repo
                .mutate(key, |r| {
                    r.step = index as u32;
                    Ok(())
                })
                .await?;

            match self.run_one(engine, &runner, task, &mut path).await {
                Ok(()) => {}
                Err(e) if task.policy == TaskPolicy::Warning => {
                    warn!("{} task #{} of {} failed, continuing: {}", task.kind, index, key, e);
                }
                Err(e) => {
                    return Err(FerryError::BusinessRule(format!(
                        "{} task #{index} failed: {e}",
                        task.kind
                    )))
                }
            }
        }

        engine
            .repo
            .mutate(key, |r| {
                r.step = tasks.len() as u32;
                Ok(())
            })
            .await?;
        Ok(path)
    }

    /// Error tasks never fail the caller; problems are logged
    pub async fn run_error_tasks(&self, engine: &EngineContext, runner: &TaskRunner, tasks: &[RuleTask], path: PathBuf) {
        let mut path = path;
        for (index, task) in tasks.iter().enumerate() {
            if let Err(e) = self.run_one(engine, runner, task, &mut path).await {
                warn!("Error task {} #{} of {} failed: {}", task.kind, index, runner.key(), e);
            }
        }
    }

    async fn run_one(&self, engine: &EngineContext, runner: &TaskRunner, task: &RuleTask, path: &mut PathBuf) -> Result<()> {
        let hook = self
            .get(&task.kind)
            .ok_or_else(|| FerryError::BusinessRule(format!("unknown task kind {}", task.kind)))?;
        let timeout = match task.timeout_ms {
            0 => DEFAULT_TASK_TIMEOUT,
            ms => Duration::from_millis(ms),
        };

        let mut call = TaskCall {
            engine,
            runner,
            path: path.clone(),
            args: substitute(&task.args, runner, path),
        };
        debug!("Running {} task for {}: {}", task.kind, runner.key(), call.args);

        match tokio::time::timeout(timeout, hook.run(&mut call)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FerryError::BusinessRule(format!(
                    "{} task timed out after {:?}",
                    task.kind, timeout
                )))
            }
        }
        *path = call.path;
        Ok(())
    }
}

// ============================================================================
// Business requests
// ============================================================================

/// Handler for a named BUSINESS request sent by a peer
#[async_trait]
pub trait BusinessHandler: Send + Sync {
    /// Returns the text sent back in the VALID answer
    async fn handle(&self, engine: &EngineContext, peer: &HostAuth, args: &str) -> Result<String>;
}

#[derive(Clone, Default)]
pub struct BusinessRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn BusinessHandler>>>>,
}

impl std::fmt::Debug for BusinessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusinessRegistry")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl BusinessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: impl BusinessHandler + 'static) {
        self.handlers.write().insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BusinessHandler>> {
        self.handlers.read().get(name).cloned()
    }
}

// ============================================================================
// Built-in tasks
// ============================================================================

struct LogTask;

#[async_trait]
impl TaskHook for LogTask {
    async fn run(&self, call: &mut TaskCall<'_>) -> Result<()> {
        info!(target: "ferry::task", key = %call.runner.key(), "{}", call.args);
        Ok(())
    }
}

/// Runs a program directly (no shell). The first word is the program.
struct ExecTask;

#[async_trait]
impl TaskHook for ExecTask {
    async fn run(&self, call: &mut TaskCall<'_>) -> Result<()> {
        let mut words = call.args.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| FerryError::BusinessRule("EXEC needs a command".into()))?;

        let output = tokio::process::Command::new(program)
            .args(words)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FerryError::BusinessRule(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Destination for COPY and MOVE: a directory (existing, or written with a
/// trailing slash) receives the file under its current name.
async fn destination(args: &str, current: &Path) -> Result<PathBuf> {
    let target = args.trim();
    if target.is_empty() {
        return Err(FerryError::BusinessRule("missing destination".into()));
    }
    let target = PathBuf::from(target);
    let is_dir = args.trim().ends_with('/') || fs::metadata(&target).await.map(|m| m.is_dir()).unwrap_or(false);
    let target = if is_dir {
        let name = current
            .file_name()
            .ok_or_else(|| FerryError::BusinessRule(format!("{} has no file name", current.display())))?;
        target.join(name)
    } else {
        target
    };
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(target)
}

pub(crate) async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).await.is_err() {
        // Different filesystems: fall back to copy and delete.
        fs::copy(from, to).await?;
        fs::remove_file(from).await?;
    }
    Ok(())
}

struct CopyTask;

#[async_trait]
impl TaskHook for CopyTask {
    async fn run(&self, call: &mut TaskCall<'_>) -> Result<()> {
        let target = destination(&call.args, &call.path).await?;
        fs::copy(&call.path, &target).await?;
        Ok(())
    }
}

struct MoveTask;

#[async_trait]
impl TaskHook for MoveTask {
    async fn run(&self, call: &mut TaskCall<'_>) -> Result<()> {
        let target = destination(&call.args, &call.path).await?;
        move_file(&call.path, &target).await?;
        call.path = target;
        Ok(())
    }
}

/// New name; a relative one stays in the current directory
struct RenameTask;

#[async_trait]
impl TaskHook for RenameTask {
    async fn run(&self, call: &mut TaskCall<'_>) -> Result<()> {
        let name = Path::new(call.args.trim());
        if name.as_os_str().is_empty() {
            return Err(FerryError::BusinessRule("RENAME needs a new name".into()));
        }
        let target = if name.is_absolute() {
            name.to_path_buf()
        } else {
            call.path.parent().map(|p| p.join(name)).unwrap_or_else(|| name.to_path_buf())
        };
        move_file(&call.path, &target).await?;
        call.path = target;
        Ok(())
    }
}

struct DeleteTask;

#[async_trait]
impl TaskHook for DeleteTask {
    async fn run(&self, call: &mut TaskCall<'_>) -> Result<()> {
        fs::remove_file(&call.path).await?;
        Ok(())
    }
}

/// Queue a follow-on transfer carrying the same follow id.
///
/// Arguments: `-to <host> -rule <rule> [-file <path>] [-digest] [-info <text...>]`
struct TransferTask;

#[async_trait]
impl TaskHook for TransferTask {
    async fn run(&self, call: &mut TaskCall<'_>) -> Result<()> {
        let mut host = None;
        let mut rule = None;
        let mut file = call.path.display().to_string();
        let mut info = String::new();
        let mut use_digest = false;

        let mut words = call.args.split_whitespace();
        while let Some(word) = words.next() {
            match word {
                "-to" => host = words.next().map(str::to_string),
                "-rule" => rule = words.next().map(str::to_string),
                "-file" => {
                    if let Some(f) = words.next() {
                        file = f.to_string();
                    }
                }
                "-digest" => use_digest = true,
                "-info" => {
                    info = words.by_ref().collect::<Vec<_>>().join(" ");
                }
                other => {
                    return Err(FerryError::BusinessRule(format!("unknown TRANSFER argument {other}")));
                }
            }
        }

        let host = host.ok_or_else(|| FerryError::BusinessRule("TRANSFER needs -to".into()))?;
        let rule = rule.ok_or_else(|| FerryError::BusinessRule("TRANSFER needs -rule".into()))?;
        let follow = call
            .runner
            .follow_id()
            .unwrap_or_else(|| call.runner.special_id.to_string());

        let request = SubmitRequest::new(rule, host, file)
            .with_info(info)
            .with_digest(use_digest)
            .with_follow_id(follow);
        let (runner, _) = crate::transfer::prepare(call.engine, &request).await?;
        info!("Relay {} queued after {}", runner.key(), call.runner.key());
        call.engine.wakeup.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::ConfigContext;
    use crate::storage::MemoryTaskStore;
    use ferry_types::{Direction, HostAuth, Rule, Settings};

    fn runner() -> TaskRunner {
        let rule = Rule::new("out", Direction::Send);
        TaskRunner::new(TaskKey::new(42, "alpha", "beta"), &rule, "alpha", "/data/report.csv", "{\"follow\":\"7\"}")
    }

    async fn engine(rule: Rule) -> EngineContext {
        let mut settings = Settings::default();
        settings.host_id = "alpha".into();
        let catalog = Catalog::in_memory(
            vec![rule],
            vec![
                HostAuth::new("alpha", "127.0.0.1", 1, "a"),
                HostAuth::new("beta", "127.0.0.1", 2, "b"),
            ],
        );
        EngineContext::new(ConfigContext::new(settings), Arc::new(MemoryTaskStore::new()), catalog)
    }

    #[test]
    fn placeholders_are_substituted() {
        let runner = runner();
        let args = substitute(
            "#TRUEFULLPATH# #FILENAME# #ORIGINALFILENAME# #SPECIALID# #REMOTEHOST# #FOLLOWID#",
            &runner,
            Path::new("/in/report.csv"),
        );
        assert_eq!(args, "/in/report.csv report.csv /data/report.csv 42 beta 7");
    }

    #[tokio::test]
    async fn move_then_rename_track_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        fs::write(&source, b"hello").await.unwrap();
        let archive = dir.path().join("archive");

        let mut rule = Rule::new("out", Direction::Send);
        rule.post_tasks = vec![
            RuleTask::new("MOVE", format!("{}/", archive.display()), TaskPolicy::Error),
            RuleTask::new("RENAME", "#FILENAME#.done", TaskPolicy::Error),
        ];
        let engine = engine(rule.clone()).await;
        let runner = engine.repo.create(&rule, "alpha", "beta", "a.txt", "").await.unwrap();
        engine
            .repo
            .set_step(&runner.key(), GlobalStep::PostTask, ferry_types::ErrorCode::Running)
            .await
            .unwrap();

        let path = engine
            .tasks
            .run_step(&engine, &runner.key(), GlobalStep::PostTask, &rule.post_tasks, source.clone())
            .await
            .unwrap();

        assert_eq!(path, archive.join("a.txt.done"));
        assert!(path.exists());
        assert!(!source.exists());
        assert_eq!(engine.repo.get(&runner.key()).await.unwrap().step, 2);
    }

    #[tokio::test]
    async fn warning_policy_continues_and_error_policy_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");

        let mut rule = Rule::new("out", Direction::Send);
        rule.pre_tasks = vec![
            RuleTask::new("DELETE", "", TaskPolicy::Warning),
            RuleTask::new("LOG", "still here", TaskPolicy::Error),
        ];
        let engine = engine(rule.clone()).await;
        let runner = engine.repo.create(&rule, "alpha", "beta", "x", "").await.unwrap();
        let key = runner.key();
        engine
            .repo
            .set_step(&key, GlobalStep::PreTask, ferry_types::ErrorCode::Running)
            .await
            .unwrap();
        assert!(engine
            .tasks
            .run_step(&engine, &key, GlobalStep::PreTask, &rule.pre_tasks, missing.clone())
            .await
            .is_ok());

        let failing = vec![RuleTask::new("DELETE", "", TaskPolicy::Error)];
        let runner = engine.repo.create(&rule, "alpha", "beta", "y", "").await.unwrap();
        engine
            .repo
            .set_step(&runner.key(), GlobalStep::PreTask, ferry_types::ErrorCode::Running)
            .await
            .unwrap();
        let result = engine
            .tasks
            .run_step(&engine, &runner.key(), GlobalStep::PreTask, &failing, missing)
            .await;
        assert!(matches!(result, Err(FerryError::BusinessRule(_))));
    }

    #[tokio::test]
    async fn unknown_kind_is_a_business_error() {
        let rule = Rule::new("out", Direction::Send);
        let engine = engine(rule.clone()).await;
        let runner = runner();
        let mut path = PathBuf::from("/tmp/x");
        let result = engine
            .tasks
            .run_one(&engine, &runner, &RuleTask::new("NOPE", "", TaskPolicy::Error), &mut path)
            .await;
        assert!(matches!(result, Err(FerryError::BusinessRule(_))));
    }

    #[tokio::test]
    async fn transfer_task_queues_a_relay_with_the_follow_id() {
        let rule = Rule::new("out", Direction::Send);
        let engine = engine(rule.clone()).await;
        let runner = runner();
        let mut call = TaskCall {
            engine: &engine,
            runner: &runner,
            path: PathBuf::from("/in/report.csv"),
            args: "-to beta -rule out -info relayed".into(),
        };
        TransferTask.run(&mut call).await.unwrap();

        let queued = engine
            .repo
            .find(&Default::default(), Default::default(), true, 0)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].follow_id().as_deref(), Some("7"));
        assert_eq!(queued[0].filename, "/in/report.csv");
        assert_eq!(queued[0].requested, "beta");
    }
}
