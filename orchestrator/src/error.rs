//! Error taxonomy for the orchestrator. One `thiserror` enum per surface,
//! composed into `OrchestratorError` at the crate boundary. `anyhow` is
//! reserved for `main.rs`.

use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;
pub type WorktreeResult<T> = Result<T, WorktreeError>;
pub type GateResult<T> = Result<T, GateError>;
pub type SchedulerResult<T> = Result<T, SchedulerError>;
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflicting update on {id}: expected status {expected}, found {actual}")]
    ConflictingUpdate {
        id: Uuid,
        expected: String,
        actual: String,
    },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::RocksDb(_))
    }
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git operation '{operation}' failed: {message}")]
    Git { operation: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worktree already exists at {0}")]
    AlreadyExists(std::path::PathBuf),

    #[error("uncommitted changes present at {0}")]
    UncommittedChanges(std::path::PathBuf),

    #[error("push failed: {0}")]
    PushFailed(String),

    #[error("pull request creation failed: {0}")]
    PullRequestFailed(String),
}

impl WorktreeError {
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Mirrors the harness's retry policy: lock contention and transient
    /// network conditions are worth retrying with backoff, real failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorktreeError::Git { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("connection")
                    || lower.contains("another git process")
            }
            WorktreeError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to execute gate command: {0}")]
    Spawn(String),

    #[error("gate timed out after {0}s")]
    Timeout(u64),

    #[error("no toolchain detected under {0}")]
    NoToolchainDetected(std::path::PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("executor unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: operation '{operation}' is not allowed while story is '{status}'")]
    InvalidState { operation: String, status: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Top-level error composing every surface, used by library consumers that
/// don't care which subsystem failed.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
