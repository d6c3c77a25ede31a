use thiserror::Error;

/// Closed set of outcomes the kernel can produce.
///
/// Distinguishable by variant, not by string-matching a message: callers that
/// need to branch on `NoTask` vs `RaceLost` vs `AlreadyHeld` match on this
/// enum directly.
#[derive(Debug, Error)]
pub enum AquaError {
    #[error("not initialized: no .aqua directory under {path}")]
    NotInitialized { path: String },

    #[error("not joined: no agent identity for this session")]
    NotJoined,

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("{what} already held by {owner}")]
    AlreadyHeld { what: &'static str, owner: String },

    #[error("no task available")]
    NoTask,

    #[error("race lost: conditional update affected no rows")]
    RaceLost,

    #[error("cyclic dependency: task {new_task} would depend (transitively) on itself via {via}")]
    CycleDetected { new_task: String, via: String },

    #[error("stale version: expected {expected}, found {actual} for task {task_id}")]
    StaleVersion {
        task_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("store busy after {attempts} attempts")]
    StoreBusy { attempts: u32 },

    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("timed out waiting for reply to message {request_id}")]
    Timeout { request_id: i64 },

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

impl AquaError {
    /// Stable process exit code for this error kind (see on-disk interface docs).
    pub fn exit_code(&self) -> i32 {
        match self {
            AquaError::NotInitialized { .. } => 1,
            AquaError::NotJoined => 2,
            AquaError::NoTask => 3,
            AquaError::NotFound { .. } => 4,
            AquaError::AlreadyHeld { .. } | AquaError::RaceLost => 5,
            AquaError::Store(_)
            | AquaError::StoreBusy { .. }
            | AquaError::CycleDetected { .. }
            | AquaError::StaleVersion { .. }
            | AquaError::PermissionDenied { .. }
            | AquaError::Timeout { .. } => 10,
        }
    }
}

pub type Result<T> = std::result::Result<T, AquaError>;
