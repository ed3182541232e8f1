//! Producer-side queue client.
//!
//! Producers receive an `Enqueuer` explicitly. For call sites where threading
//! a handle is awkward, a process-wide default can be installed once at
//! startup; tests swap it with [`override_default`] and get the previous
//! client back when the guard drops.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use super::broker::{Broker, BrokerError};
use super::types::{Task, TaskInfo, TaskMessage};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("broker rejected task: {0}")]
    Broker(#[from] BrokerError),

    #[error("no default queue client installed")]
    NoDefaultClient,
}

/// Anything that can hand a task to the broker.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, EnqueueError>;
}

/// Queue client over a broker. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct QueueClient {
    broker: Arc<dyn Broker>,
}

impl QueueClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Enqueuer for QueueClient {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, EnqueueError> {
        let message = TaskMessage::new(&task);
        self.broker.enqueue(&message).await?;

        info!(
            task_id = %message.id,
            task = %task.kind(),
            queue = task.queue(),
            payload_length = task.payload().len(),
            "task_enqueued"
        );

        Ok(TaskInfo {
            id: message.id,
            kind: task.kind(),
            queue: task.queue(),
            max_retry: task.max_retry(),
        })
    }
}

// =============================================================================
// Process-wide Default
// =============================================================================

static DEFAULT_CLIENT: RwLock<Option<Arc<dyn Enqueuer>>> = RwLock::new(None);

fn read_default() -> Option<Arc<dyn Enqueuer>> {
    DEFAULT_CLIENT
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn swap_default(client: Option<Arc<dyn Enqueuer>>) -> Option<Arc<dyn Enqueuer>> {
    let mut slot = DEFAULT_CLIENT
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::replace(&mut *slot, client)
}

/// Install the process-wide client. Returns the one it replaced.
pub fn install_default(client: Arc<dyn Enqueuer>) -> Option<Arc<dyn Enqueuer>> {
    swap_default(Some(client))
}

/// The installed process-wide client, if any.
pub fn default_client() -> Option<Arc<dyn Enqueuer>> {
    read_default()
}

/// Enqueue through the process-wide client.
pub async fn enqueue_default(task: Task) -> Result<TaskInfo, EnqueueError> {
    let client = read_default().ok_or(EnqueueError::NoDefaultClient)?;
    client.enqueue(task).await
}

/// Replace the process-wide client until the returned guard is dropped.
#[must_use = "the previous client is restored when the guard drops"]
pub fn override_default(client: Arc<dyn Enqueuer>) -> DefaultClientGuard {
    DefaultClientGuard {
        previous: swap_default(Some(client)),
    }
}

/// Restores the previously installed client on drop.
pub struct DefaultClientGuard {
    previous: Option<Arc<dyn Enqueuer>>,
}

impl Drop for DefaultClientGuard {
    fn drop(&mut self) {
        swap_default(self.previous.take());
    }
}
