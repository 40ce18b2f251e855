//! Error types for lantern-core operations.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Startup
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a worker process could not be brought up.
///
/// Failures are sticky: once recorded, the supervisor reports the same failure
/// to every later caller instead of launching again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupFailure {
    #[error("failed to spawn {worker}: {details}")]
    SpawnFailed { worker: String, details: String },

    #[error("{worker} exited before answering a ping (status {status:?})")]
    ExitedEarly { worker: String, status: Option<i32> },

    #[error("{worker} did not answer a ping after {attempts} attempts")]
    BudgetExhausted { worker: String, attempts: u32 },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure delivered to a command callback, or returned when issuing fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("no reply before the request deadline")]
    Timeout,

    #[error("analysis worker is not running")]
    Unavailable,

    #[error("request was cancelled")]
    Cancelled,

    #[error("session {id} is not ready for commands (phase {phase})")]
    NotReady { id: String, phase: String },

    #[error("session {0} is busy with another command")]
    Busy(String),

    #[error("unknown session {0}")]
    UnknownSession(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Crate Error
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum LanternError {
    #[error("home directory not found")]
    HomeDirNotFound,

    #[error("configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("configuration incomplete: {0}")]
    ConfigIncomplete(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Startup(#[from] StartupFailure),

    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T> = std::result::Result<T, LanternError>;

impl From<LanternError> for String {
    fn from(err: LanternError) -> String {
        err.to_string()
    }
}
