//! Broker abstraction: durable named queues with retry scheduling.
//!
//! A message moves through these states:
//!
//! ```text
//! enqueue → pending → (dequeue) → active → ack      → gone
//!                                        → retry    → scheduled → (forward) → pending
//!                                        → archive  → dead
//!                                        → lease expired (recover) → pending | dead
//! ```
//!
//! Every dequeue leases the message until a deadline. A worker that dies
//! holding a message never settles it; once the lease runs out,
//! [`Broker::recover_expired`] counts the lost attempt and hands the message
//! back, which keeps delivery at-least-once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::TaskMessage;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode task message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to the tail of its queue.
    async fn enqueue(&self, message: &TaskMessage) -> Result<(), BrokerError>;

    /// Take the oldest pending message from the first non-empty queue in
    /// `queues`, marking it active and leased until `lease_until`.
    async fn dequeue(
        &self,
        queues: &[String],
        lease_until: DateTime<Utc>,
    ) -> Result<Option<TaskMessage>, BrokerError>;

    /// Drop an active message after successful processing.
    async fn ack(&self, message: &TaskMessage) -> Result<(), BrokerError>;

    /// Record a failed attempt and schedule the message for `process_at`.
    async fn retry(
        &self,
        message: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError>;

    /// Record a final failure and move the message to the dead list.
    async fn archive(&self, message: &TaskMessage, error: &str) -> Result<(), BrokerError>;

    /// Move scheduled messages due at or before `now` back to pending.
    /// Returns how many were moved.
    async fn forward_scheduled(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError>;

    /// Reclaim active messages whose lease ran out at or before `now`.
    ///
    /// The lost attempt counts as a failure: the message goes back to pending,
    /// or to the dead list when it has no attempts left. Returns how many
    /// messages were reclaimed.
    async fn recover_expired(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError>;
}

/// Error recorded on a message whose worker never reported back.
pub(crate) const LEASE_EXPIRED: &str = "lease expired: worker did not report back";

/// Envelope after a lost attempt, and whether it still has attempts left.
pub(crate) fn expired_attempt(message: &TaskMessage) -> (TaskMessage, bool) {
    let updated = failed_attempt(message, LEASE_EXPIRED);
    let requeue = updated.retried < updated.max_retry;
    (updated, requeue)
}

/// Envelope after a failed attempt.
pub(crate) fn failed_attempt(message: &TaskMessage, error: &str) -> TaskMessage {
    let mut updated = message.clone();
    updated.retried = message.retried.saturating_add(1);
    updated.last_error = Some(error.to_string());
    updated
}
