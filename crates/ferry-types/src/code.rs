//! Status codes shared by the wire protocol and persisted runners.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Single-character status code.
///
/// The same code travels in ERROR / END_REQUEST packets and is stored as a
/// runner's `step_status`, so both peers agree on what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "char", try_from = "char")]
pub enum ErrorCode {
    InitOk,
    PreProcessingOk,
    TransferOk,
    PostProcessingOk,
    CompleteOk,
    ConnectionImpossible,
    ServerOverloaded,
    BadAuthent,
    ExternalOp,
    TransferError,
    Md5Error,
    Disconnection,
    RemoteShutdown,
    FinalOp,
    Unimplemented,
    Shutdown,
    RemoteError,
    Internal,
    StoppedTransfer,
    CanceledTransfer,
    Warning,
    Unknown,
    QueryAlreadyFinished,
    QueryStillRunning,
    NotKnownHost,
    LoopSelfRequestedHost,
    QueryRemotelyUnknown,
    FileNotFound,
    CommandNotFound,
    PassThroughMode,
    Running,
    IncorrectCommand,
    FileNotAllowed,
    SizeNotAllowed,
}

const ALL: [ErrorCode; 34] = [
    ErrorCode::InitOk,
    ErrorCode::PreProcessingOk,
    ErrorCode::TransferOk,
    ErrorCode::PostProcessingOk,
    ErrorCode::CompleteOk,
    ErrorCode::ConnectionImpossible,
    ErrorCode::ServerOverloaded,
    ErrorCode::BadAuthent,
    ErrorCode::ExternalOp,
    ErrorCode::TransferError,
    ErrorCode::Md5Error,
    ErrorCode::Disconnection,
    ErrorCode::RemoteShutdown,
    ErrorCode::FinalOp,
    ErrorCode::Unimplemented,
    ErrorCode::Shutdown,
    ErrorCode::RemoteError,
    ErrorCode::Internal,
    ErrorCode::StoppedTransfer,
    ErrorCode::CanceledTransfer,
    ErrorCode::Warning,
    ErrorCode::Unknown,
    ErrorCode::QueryAlreadyFinished,
    ErrorCode::QueryStillRunning,
    ErrorCode::NotKnownHost,
    ErrorCode::LoopSelfRequestedHost,
    ErrorCode::QueryRemotelyUnknown,
    ErrorCode::FileNotFound,
    ErrorCode::CommandNotFound,
    ErrorCode::PassThroughMode,
    ErrorCode::Running,
    ErrorCode::IncorrectCommand,
    ErrorCode::FileNotAllowed,
    ErrorCode::SizeNotAllowed,
];

impl ErrorCode {
    pub fn code(self) -> char {
        match self {
            ErrorCode::InitOk => 'i',
            ErrorCode::PreProcessingOk => 'B',
            ErrorCode::TransferOk => 'X',
            ErrorCode::PostProcessingOk => 'P',
            ErrorCode::CompleteOk => 'O',
            ErrorCode::ConnectionImpossible => 'C',
            ErrorCode::ServerOverloaded => 'l',
            ErrorCode::BadAuthent => 'A',
            ErrorCode::ExternalOp => 'E',
            ErrorCode::TransferError => 'T',
            ErrorCode::Md5Error => 'M',
            ErrorCode::Disconnection => 'D',
            ErrorCode::RemoteShutdown => 'r',
            ErrorCode::FinalOp => 'F',
            ErrorCode::Unimplemented => 'U',
            ErrorCode::Shutdown => 'S',
            ErrorCode::RemoteError => 'R',
            ErrorCode::Internal => 'I',
            ErrorCode::StoppedTransfer => 'H',
            ErrorCode::CanceledTransfer => 'K',
            ErrorCode::Warning => 'W',
            ErrorCode::Unknown => '-',
            ErrorCode::QueryAlreadyFinished => 'Q',
            ErrorCode::QueryStillRunning => 's',
            ErrorCode::NotKnownHost => 'N',
            ErrorCode::LoopSelfRequestedHost => 'L',
            ErrorCode::QueryRemotelyUnknown => 'u',
            ErrorCode::FileNotFound => 'f',
            ErrorCode::CommandNotFound => 'c',
            ErrorCode::PassThroughMode => 'p',
            ErrorCode::Running => 'z',
            ErrorCode::IncorrectCommand => 'n',
            ErrorCode::FileNotAllowed => 'a',
            ErrorCode::SizeNotAllowed => 'd',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Codes that mean "everything went fine so far".
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ErrorCode::InitOk
                | ErrorCode::PreProcessingOk
                | ErrorCode::TransferOk
                | ErrorCode::PostProcessingOk
                | ErrorCode::CompleteOk
                | ErrorCode::Running
                | ErrorCode::Warning
        )
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::InitOk => "initialization step ok",
            ErrorCode::PreProcessingOk => "pre-processing step ok",
            ErrorCode::TransferOk => "transfer step ok",
            ErrorCode::PostProcessingOk => "post-processing step ok",
            ErrorCode::CompleteOk => "transfer complete",
            ErrorCode::ConnectionImpossible => "connection impossible",
            ErrorCode::ServerOverloaded => "server overloaded or blocked",
            ErrorCode::BadAuthent => "bad authentication",
            ErrorCode::ExternalOp => "external operation in error",
            ErrorCode::TransferError => "transfer in error",
            ErrorCode::Md5Error => "digest mismatch",
            ErrorCode::Disconnection => "disconnected",
            ErrorCode::RemoteShutdown => "remote host shut down",
            ErrorCode::FinalOp => "final action in error",
            ErrorCode::Unimplemented => "not implemented",
            ErrorCode::Shutdown => "local shutdown",
            ErrorCode::RemoteError => "remote error",
            ErrorCode::Internal => "internal error",
            ErrorCode::StoppedTransfer => "transfer stopped",
            ErrorCode::CanceledTransfer => "transfer canceled",
            ErrorCode::Warning => "warning",
            ErrorCode::Unknown => "unknown",
            ErrorCode::QueryAlreadyFinished => "request already finished",
            ErrorCode::QueryStillRunning => "request still running",
            ErrorCode::NotKnownHost => "host not known",
            ErrorCode::LoopSelfRequestedHost => "host requested itself",
            ErrorCode::QueryRemotelyUnknown => "request unknown on remote host",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::CommandNotFound => "command not found",
            ErrorCode::PassThroughMode => "pass-through mode in error",
            ErrorCode::Running => "running",
            ErrorCode::IncorrectCommand => "incorrect command",
            ErrorCode::FileNotAllowed => "file not allowed",
            ErrorCode::SizeNotAllowed => "size not allowed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

impl From<ErrorCode> for char {
    fn from(code: ErrorCode) -> char {
        code.code()
    }
}

impl TryFrom<char> for ErrorCode {
    type Error = String;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        ErrorCode::from_code(value).ok_or_else(|| format!("unknown status code '{value}'"))
    }
}
