//! Errors - エラー型と分類
//!
//! The coordinator speaks one closed error type. Retry decisions never
//! inspect messages: they go through [`classify`], which is injected into
//! [`crate::retry::RetryPolicy`] as a plain function pointer.

use super::ids::{InstanceId, TaskId};

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Function used by the retry layer to decide whether an error is worth another attempt.
pub type Classifier = fn(&CoordinatorError) -> ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The coordinator is not running (not primary, or already cancelled).
    #[error("not primary: {0}")]
    NotPrimary(String),

    /// The caller should retry later.
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("abort: stale {0}")]
    Stale(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("task {task_id} instance {instance_id} reported failure")]
    TaskFailed {
        task_id: TaskId,
        instance_id: InstanceId,
    },

    /// Synthetic failure of a first acknowledgement, so the sender exercises its retry path.
    #[error("injected fault while acknowledging task {task_id} instance {instance_id}")]
    InjectedFault {
        task_id: TaskId,
        instance_id: InstanceId,
    },

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("impact translation failed: {0}")]
    Translation(String),

    #[error("{0}")]
    CommandParse(String),

    #[error("policy version conflict (expected {expected}, actual {actual})")]
    PolicyConflict { expected: u64, actual: u64 },

    /// The hosting process should terminate so that a failover can happen.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("{} errors occurred", .0.len())]
    Aggregate(Vec<CoordinatorError>),
}

impl CoordinatorError {
    pub fn transport(message: impl Into<String>, transient: bool) -> Self {
        Self::Transport {
            message: message.into(),
            transient,
        }
    }

    /// Leaf errors with every `Aggregate` level removed.
    pub fn flatten(&self) -> Vec<&CoordinatorError> {
        match self {
            CoordinatorError::Aggregate(inner) => inner.iter().flat_map(|e| e.flatten()).collect(),
            other => vec![other],
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.flatten()
            .iter()
            .any(|e| matches!(e, CoordinatorError::Timeout(_)))
    }

    pub fn is_fatal(&self) -> bool {
        self.flatten()
            .iter()
            .any(|e| matches!(e, CoordinatorError::Fatal(_)))
    }
}

/// Default classification: timeouts, cancellation and transient transport
/// errors are retryable. An aggregate is transient only when all of its
/// leaves are.
pub fn classify(err: &CoordinatorError) -> ErrorKind {
    let leaves = err.flatten();
    if leaves.is_empty() {
        return ErrorKind::Permanent;
    }
    let all_transient = leaves.iter().all(|leaf| {
        matches!(
            leaf,
            CoordinatorError::Timeout(_)
                | CoordinatorError::Cancelled
                | CoordinatorError::Transport {
                    transient: true,
                    ..
                }
        )
    });
    if all_transient {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}
