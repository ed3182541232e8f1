//! Task processors.
//!
//! One processor per task kind. A processor decodes the payload, runs the
//! domain work and reports failure through `ProcessError`, which the server
//! turns into an ack, a retry or an archive.

pub mod email;
pub mod locks;
pub mod social_group;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::email::EmailError;
use crate::queue::{Task, TaskError, TaskKind};
use crate::verification::WorkflowError;

pub use email::SendEmailProcessor;
pub use locks::KeyedLocks;
pub use social_group::CheckSocialGroupProcessor;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("malformed payload: {0}")]
    PayloadDecode(String),

    #[error("{kind} task routed to the wrong processor")]
    Misrouted { kind: TaskKind },

    #[error("user {0} not found")]
    UserNotFound(Uuid),

    #[error("verification call failed: {0}")]
    VerificationCallFailed(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("email delivery failed: {0}")]
    Email(#[from] EmailError),

    #[error("task cancelled")]
    Cancelled,

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("processor panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    /// Whether another attempt could succeed.
    ///
    /// Malformed payloads, misrouting and missing users are permanent. The
    /// failed attempt is still counted against `max_retry` (the archived
    /// envelope carries `retried + 1`), but the server archives the task right
    /// away instead of spending the attempts that are left on an input that
    /// cannot change.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProcessError::PayloadDecode(_)
                | ProcessError::Misrouted { .. }
                | ProcessError::UserNotFound(_)
        )
    }
}

impl From<TaskError> for ProcessError {
    fn from(err: TaskError) -> Self {
        ProcessError::PayloadDecode(err.to_string())
    }
}

impl From<WorkflowError> for ProcessError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::UserNotFound(user_id) => ProcessError::UserNotFound(user_id),
            WorkflowError::VerificationCallFailed(reason) => {
                ProcessError::VerificationCallFailed(reason)
            }
            WorkflowError::PersistenceFailed(reason) => ProcessError::Persistence(reason),
        }
    }
}

/// Per-attempt execution context handed to processors.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    /// Failed attempts before this one
    pub retried: u32,
    pub max_retry: u32,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: Uuid, retried: u32, max_retry: u32, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            retried,
            max_retry,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive an outbound call, giving up as soon as the attempt is cancelled.
    pub async fn run<T, E, F>(&self, call: F) -> Result<T, ProcessError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ProcessError>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProcessError::Cancelled),
            result = call => result.map_err(Into::into),
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> Result<(), ProcessError>;
}

/// Routing table from task kind to processor.
///
/// Every kind must have a processor; adding a kind without one does not compile.
#[derive(Clone)]
pub struct Router {
    send_email: Arc<dyn Processor>,
    check_social_group: Arc<dyn Processor>,
}

impl Router {
    pub fn new(send_email: Arc<dyn Processor>, check_social_group: Arc<dyn Processor>) -> Self {
        Self {
            send_email,
            check_social_group,
        }
    }

    pub fn processor(&self, kind: TaskKind) -> &dyn Processor {
        match kind {
            TaskKind::SendEmail => self.send_email.as_ref(),
            TaskKind::CheckSocialGroup => self.check_social_group.as_ref(),
        }
    }
}
