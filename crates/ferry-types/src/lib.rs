//! Shared types for Ferry
//!
//! This crate contains the data structures shared between the transfer
//! engine and the command line front end.

pub mod code;
pub mod rule;
pub mod runner;
pub mod settings;

pub use code::ErrorCode;
pub use rule::{Direction, HostAuth, Role, Rule, RuleTask, TaskPolicy, TransferMode};
pub use runner::{follow_id_of, set_follow_id, GlobalStep, StateError, TaskKey, TaskRunner, UpdatedInfo};
pub use settings::{BandwidthLimit, BlacklistSettings, RetrySettings, Settings};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One file as listed by an INFORMATION request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

// ============================================================================
// Results
// ============================================================================

/// Final outcome of one dispatch, handed to whoever waits on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub key: TaskKey,
    pub success: bool,
    pub code: ErrorCode,
    /// Connection attempts made by this dispatch.
    pub attempts: u32,
    pub message: Option<String>,
    pub runner: Option<TaskRunner>,
}

impl TransferResult {
    pub fn from_runner(runner: TaskRunner, attempts: u32) -> Self {
        Self {
            key: runner.key(),
            success: runner.is_all_done(),
            code: runner.step_status,
            attempts,
            message: runner.info.clone(),
            runner: Some(runner),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    TransferSubmitted {
        key: TaskKey,
    },
    TransferStarted {
        key: TaskKey,
        /// Rank the block loop starts at; above zero on resume.
        rank: u64,
    },
    TransferProgress {
        key: TaskKey,
        rank: u64,
        bytes: u64,
    },
    TransferStatusChanged {
        key: TaskKey,
        info: UpdatedInfo,
        step: GlobalStep,
        code: ErrorCode,
    },
    TransferCompleted {
        result: TransferResult,
    },
    BandwidthChanged {
        limit: BandwidthLimit,
    },
    SpoolSubmitted {
        path: String,
        key: Option<TaskKey>,
    },
    ShutdownRequested {
        /// The remote asked for the host to come back up afterwards.
        restart: bool,
    },
    Error {
        message: String,
    },
}
