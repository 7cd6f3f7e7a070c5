//! The persisted transfer record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::code::ErrorCode;
use crate::rule::{Direction, Rule, TransferMode};

// ============================================================================
// Identity
// ============================================================================

/// Unique key of a transfer: the same triple identifies the runner on both
/// peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub special_id: i64,
    pub requester: String,
    pub requested: String,
}

impl TaskKey {
    pub fn new(special_id: i64, requester: impl Into<String>, requested: impl Into<String>) -> Self {
        Self {
            special_id,
            requester: requester.into(),
            requested: requested.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}->{}", self.special_id, self.requester, self.requested)
    }
}

// ============================================================================
// Steps and status
// ============================================================================

/// Coarse step of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GlobalStep {
    NoTask,
    PreTask,
    TransferTask,
    PostTask,
    ErrorTask,
    AllDoneTask,
}

impl GlobalStep {
    /// Position along the normal path. ERRORTASK sits outside it.
    fn ordinal(self) -> Option<u8> {
        match self {
            GlobalStep::NoTask => Some(0),
            GlobalStep::PreTask => Some(1),
            GlobalStep::TransferTask => Some(2),
            GlobalStep::PostTask => Some(3),
            GlobalStep::AllDoneTask => Some(4),
            GlobalStep::ErrorTask => None,
        }
    }

    /// Whether the normal path got at least as far as `step`.
    pub fn has_reached(self, step: GlobalStep) -> bool {
        match (self.ordinal(), step.ordinal()) {
            (Some(current), Some(target)) => current >= target,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GlobalStep::NoTask => "NOTASK",
            GlobalStep::PreTask => "PRETASK",
            GlobalStep::TransferTask => "TRANSFERTASK",
            GlobalStep::PostTask => "POSTTASK",
            GlobalStep::ErrorTask => "ERRORTASK",
            GlobalStep::AllDoneTask => "ALLDONETASK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NOTASK" => Some(GlobalStep::NoTask),
            "PRETASK" => Some(GlobalStep::PreTask),
            "TRANSFERTASK" => Some(GlobalStep::TransferTask),
            "POSTTASK" => Some(GlobalStep::PostTask),
            "ERRORTASK" => Some(GlobalStep::ErrorTask),
            "ALLDONETASK" => Some(GlobalStep::AllDoneTask),
            _ => None,
        }
    }
}

/// Scheduling status of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdatedInfo {
    ToSubmit,
    Running,
    Interrupted,
    Done,
    InError,
}

impl UpdatedInfo {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdatedInfo::Done | UpdatedInfo::InError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpdatedInfo::ToSubmit => "TOSUBMIT",
            UpdatedInfo::Running => "RUNNING",
            UpdatedInfo::Interrupted => "INTERRUPTED",
            UpdatedInfo::Done => "DONE",
            UpdatedInfo::InError => "INERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TOSUBMIT" => Some(UpdatedInfo::ToSubmit),
            "RUNNING" => Some(UpdatedInfo::Running),
            "INTERRUPTED" => Some(UpdatedInfo::Interrupted),
            "DONE" => Some(UpdatedInfo::Done),
            "INERROR" => Some(UpdatedInfo::InError),
            _ => None,
        }
    }
}

impl fmt::Display for UpdatedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    RankRegression { current: u64, requested: u64 },
    StepRegression { current: GlobalStep, requested: GlobalStep },
    AlreadyFinished(UpdatedInfo),
    NotRestartable(UpdatedInfo),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::RankRegression { current, requested } => {
                write!(f, "rank cannot move back from {current} to {requested}")
            }
            StateError::StepRegression { current, requested } => write!(
                f,
                "step cannot move back from {} to {}",
                current.as_str(),
                requested.as_str()
            ),
            StateError::AlreadyFinished(info) => write!(f, "runner already {info}"),
            StateError::NotRestartable(info) => write!(f, "runner in state {info} cannot be restarted"),
        }
    }
}

impl std::error::Error for StateError {}

// ============================================================================
// TaskRunner
// ============================================================================

/// One transfer job as persisted by each peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunner {
    pub special_id: i64,
    pub requester: String,
    pub requested: String,
    /// Host owning this row.
    pub owner: String,
    pub rule_id: String,
    pub mode: TransferMode,
    /// Whether this host pushes the DATA blocks.
    pub is_sender: bool,
    pub filename: String,
    pub original_filename: String,
    /// Free text or JSON. A JSON object may carry a `follow` id.
    pub file_info: String,
    pub file_size: Option<u64>,
    pub blocksize: u32,
    /// Number of blocks acknowledged so far.
    pub rank: u64,
    pub global_step: GlobalStep,
    pub global_last_step: GlobalStep,
    /// Index of the task being run inside the current global step.
    pub step: u32,
    pub step_status: ErrorCode,
    pub updated_info: UpdatedInfo,
    pub is_block_compression: bool,
    pub use_digest: bool,
    pub info: Option<String>,
    pub start: DateTime<Utc>,
    /// Last time the row made progress.
    pub stop: DateTime<Utc>,
}

impl TaskRunner {
    /// Fresh runner in TOSUBMIT, as seen from `owner`.
    pub fn new(key: TaskKey, rule: &Rule, owner: &str, filename: &str, file_info: &str) -> Self {
        let now = Utc::now();
        let is_sender = match rule.direction {
            Direction::Send => key.requester == owner,
            Direction::Recv => key.requested == owner,
        };
        Self {
            special_id: key.special_id,
            requester: key.requester,
            requested: key.requested,
            owner: owner.to_string(),
            rule_id: rule.id.clone(),
            mode: rule.mode,
            is_sender,
            filename: filename.to_string(),
            original_filename: filename.to_string(),
            file_info: file_info.to_string(),
            file_size: None,
            blocksize: 0,
            rank: 0,
            global_step: GlobalStep::NoTask,
            global_last_step: GlobalStep::NoTask,
            step: 0,
            step_status: ErrorCode::InitOk,
            updated_info: UpdatedInfo::ToSubmit,
            is_block_compression: false,
            use_digest: false,
            info: None,
            start: now,
            stop: now,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.special_id, self.requester.clone(), self.requested.clone())
    }

    /// Whether this host initiated the transfer.
    pub fn is_requester(&self) -> bool {
        self.owner == self.requester
    }

    /// The host on the other side of the transfer.
    pub fn remote_host(&self) -> &str {
        if self.is_requester() {
            &self.requested
        } else {
            &self.requester
        }
    }

    // ---- predicates ---------------------------------------------------------

    pub fn is_all_done(&self) -> bool {
        self.updated_info == UpdatedInfo::Done
    }

    pub fn is_in_error(&self) -> bool {
        self.updated_info == UpdatedInfo::InError
    }

    pub fn is_terminal(&self) -> bool {
        self.updated_info.is_terminal()
    }

    /// Rank a new attempt must start from, when the previous attempt got
    /// into the block loop.
    pub fn resume_rank(&self) -> Option<u64> {
        let in_transfer = self.global_step == GlobalStep::TransferTask
            || self.global_last_step == GlobalStep::TransferTask;
        if in_transfer && self.rank > 0 && !self.mode.is_through() {
            Some(self.rank)
        } else {
            None
        }
    }

    // ---- transitions --------------------------------------------------------

    pub fn set_running(&mut self) {
        self.updated_info = UpdatedInfo::Running;
        self.step_status = ErrorCode::Running;
        self.stop = Utc::now();
    }

    pub fn touch(&mut self) {
        self.stop = Utc::now();
    }

    pub fn update_rank(&mut self, rank: u64) -> Result<(), StateError> {
        if rank < self.rank {
            return Err(StateError::RankRegression {
                current: self.rank,
                requested: rank,
            });
        }
        self.rank = rank;
        self.stop = Utc::now();
        Ok(())
    }

    /// Explicit rank reset, used when both peers agree on a restart point.
    pub fn restart_from(&mut self, rank: u64) {
        self.rank = rank;
        self.global_step = GlobalStep::TransferTask;
        self.global_last_step = GlobalStep::TransferTask;
        self.stop = Utc::now();
    }

    pub fn set_step(&mut self, step: GlobalStep, status: ErrorCode) -> Result<(), StateError> {
        if self.is_terminal() {
            return Err(StateError::AlreadyFinished(self.updated_info));
        }
        if step != GlobalStep::ErrorTask {
            let current = self.global_step.ordinal();
            let requested = step.ordinal();
            if current.is_none() || requested < current {
                return Err(StateError::StepRegression {
                    current: self.global_step,
                    requested: step,
                });
            }
            self.global_last_step = step;
        }
        if step != self.global_step {
            self.step = 0;
        }
        self.global_step = step;
        self.step_status = status;
        self.stop = Utc::now();
        Ok(())
    }

    pub fn mark_done(&mut self) {
        self.global_step = GlobalStep::AllDoneTask;
        self.global_last_step = GlobalStep::AllDoneTask;
        self.step = 0;
        self.step_status = ErrorCode::CompleteOk;
        self.updated_info = UpdatedInfo::Done;
        self.info = None;
        self.stop = Utc::now();
    }

    /// Terminal failure. The last good step is kept for diagnosis.
    pub fn mark_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.global_step = GlobalStep::ErrorTask;
        self.step_status = code;
        self.updated_info = UpdatedInfo::InError;
        self.info = Some(message.into());
        self.stop = Utc::now();
    }

    /// Resumable failure. `global_step` stays where it was so the next attempt
    /// knows whether the block loop had started.
    pub fn mark_interrupted(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.step_status = code;
        self.updated_info = UpdatedInfo::Interrupted;
        self.info = Some(message.into());
        self.stop = Utc::now();
    }

    /// Put an interrupted or failed runner back in the queue.
    ///
    /// An interrupted runner keeps its rank and resumes. A failed one starts
    /// over from scratch.
    pub fn restart(&mut self) -> Result<(), StateError> {
        match self.updated_info {
            UpdatedInfo::Interrupted => {}
            UpdatedInfo::InError => {
                self.rank = 0;
                self.global_step = GlobalStep::NoTask;
                self.global_last_step = GlobalStep::NoTask;
            }
            other => return Err(StateError::NotRestartable(other)),
        }
        if self.global_step == GlobalStep::ErrorTask {
            self.global_step = self.global_last_step;
        }
        self.updated_info = UpdatedInfo::ToSubmit;
        self.step_status = ErrorCode::InitOk;
        self.info = None;
        self.stop = Utc::now();
        Ok(())
    }

    // ---- follow id ----------------------------------------------------------

    pub fn follow_id(&self) -> Option<String> {
        follow_id_of(&self.file_info)
    }

    pub fn with_follow_id(mut self, follow: &str) -> Self {
        self.file_info = set_follow_id(&self.file_info, follow);
        self
    }
}

/// Extract the `follow` id from a JSON file info, if any.
pub fn follow_id_of(file_info: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(file_info).ok()?;
    match value.get("follow")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Store `follow` in a file info, wrapping plain text under `info`.
pub fn set_follow_id(file_info: &str, follow: &str) -> String {
    let mut object = match serde_json::from_str::<serde_json::Value>(file_info) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => {
            let mut map = serde_json::Map::new();
            if !file_info.is_empty() {
                map.insert("info".into(), serde_json::Value::String(file_info.to_string()));
            }
            map
        }
    };
    object.insert("follow".into(), serde_json::Value::String(follow.to_string()));
    serde_json::Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> TaskRunner {
        let rule = Rule::new("default", Direction::Send);
        TaskRunner::new(TaskKey::new(7, "a", "b"), &rule, "a", "data.bin", "")
    }

    #[test]
    fn requester_of_send_rule_is_sender() {
        let r = runner();
        assert!(r.is_sender);
        assert!(r.is_requester());
        assert_eq!(r.remote_host(), "b");
        assert_eq!(r.updated_info, UpdatedInfo::ToSubmit);
    }

    #[test]
    fn rank_never_moves_back() {
        let mut r = runner();
        r.update_rank(5).unwrap();
        r.update_rank(5).unwrap();
        assert!(matches!(
            r.update_rank(4),
            Err(StateError::RankRegression { current: 5, requested: 4 })
        ));
        r.restart_from(2);
        assert_eq!(r.rank, 2);
    }

    #[test]
    fn steps_only_move_forward() {
        let mut r = runner();
        r.set_step(GlobalStep::PreTask, ErrorCode::Running).unwrap();
        r.set_step(GlobalStep::TransferTask, ErrorCode::Running).unwrap();
        assert!(r.set_step(GlobalStep::PreTask, ErrorCode::Running).is_err());
        r.set_step(GlobalStep::ErrorTask, ErrorCode::TransferError).unwrap();
        assert_eq!(r.global_last_step, GlobalStep::TransferTask);
        assert!(r.set_step(GlobalStep::PostTask, ErrorCode::Running).is_err());
    }

    #[test]
    fn interrupted_in_transfer_resumes() {
        let mut r = runner();
        r.set_step(GlobalStep::TransferTask, ErrorCode::Running).unwrap();
        r.update_rank(50).unwrap();
        r.mark_interrupted(ErrorCode::Disconnection, "link lost");
        assert_eq!(r.resume_rank(), Some(50));
        r.restart().unwrap();
        assert_eq!(r.updated_info, UpdatedInfo::ToSubmit);
        assert_eq!(r.resume_rank(), Some(50));
    }

    #[test]
    fn failed_runner_restarts_from_scratch() {
        let mut r = runner();
        r.set_step(GlobalStep::TransferTask, ErrorCode::Running).unwrap();
        r.update_rank(10).unwrap();
        r.mark_error(ErrorCode::CanceledTransfer, "canceled");
        assert!(r.is_in_error());
        assert!(r.set_step(GlobalStep::PostTask, ErrorCode::Running).is_err());
        r.restart().unwrap();
        assert_eq!(r.rank, 0);
        assert_eq!(r.resume_rank(), None);
    }

    #[test]
    fn done_runner_cannot_restart() {
        let mut r = runner();
        r.mark_done();
        assert!(r.is_all_done());
        assert_eq!(r.restart(), Err(StateError::NotRestartable(UpdatedInfo::Done)));
    }

    #[test]
    fn follow_id_is_threaded_through_file_info() {
        let r = runner().with_follow_id("hop-1");
        assert_eq!(r.follow_id().as_deref(), Some("hop-1"));

        let plain = set_follow_id("some text", "42");
        assert_eq!(follow_id_of(&plain).as_deref(), Some("42"));
        assert!(plain.contains("some text"));
        assert_eq!(follow_id_of("not json"), None);
    }
}
