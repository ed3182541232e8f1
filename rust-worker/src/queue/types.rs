//! Task definitions for the two job kinds.
//!
//! This module defines:
//! - `TaskKind`: the closed set of job kinds with their routing name, queue and retry budget
//! - Typed payloads for each kind
//! - `Task`: a kind plus its serialized payload, built by the `new_*_task` constructors
//! - `TaskMessage`: the envelope a task travels in while it sits in the broker

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::users::GroupType;

/// Queue name for verification e-mails.
pub const SEND_EMAIL_QUEUE: &str = "send-email";

/// Queue name for social-group eligibility checks.
pub const CHECK_SOCIAL_GROUP_QUEUE: &str = "check-social-group";

/// Errors raised while building or decoding a task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A required payload field was empty.
    #[error("required field `{0}` is empty")]
    MissingField(&'static str),

    /// The payload could not be encoded. Well-typed payloads never hit this.
    #[error("failed to serialize task payload: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The stored payload does not match the kind's schema.
    #[error("failed to decode {kind} payload: {source}")]
    PayloadDecode {
        kind: TaskKind,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Task Kinds
// =============================================================================

/// Every job kind the worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    SendEmail,
    CheckSocialGroup,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::SendEmail, TaskKind::CheckSocialGroup];

    /// Routing key stored in the message envelope.
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::SendEmail => "email:send",
            TaskKind::CheckSocialGroup => "social_group:check",
        }
    }

    /// Queue the kind is published to.
    pub fn queue(self) -> &'static str {
        match self {
            TaskKind::SendEmail => SEND_EMAIL_QUEUE,
            TaskKind::CheckSocialGroup => CHECK_SOCIAL_GROUP_QUEUE,
        }
    }

    /// Total number of attempts the broker makes before archiving the task.
    pub fn max_retry(self) -> u32 {
        match self {
            TaskKind::SendEmail => 5,
            TaskKind::CheckSocialGroup => 3,
        }
    }

    /// Resolve a routing key read from the broker.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload of the `email:send` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmailPayload {
    pub email: String,
    pub verification_code: String,
}

/// Payload of the `social_group:check` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSocialGroupPayload {
    pub user_id: Uuid,
    pub snils: String,
    pub groups: Vec<GroupType>,
}

/// A decoded payload, one variant per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    SendEmail(SendEmailPayload),
    CheckSocialGroup(CheckSocialGroupPayload),
}

// =============================================================================
// Task
// =============================================================================

/// A unit of work: a kind and its JSON-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    kind: TaskKind,
    payload: Vec<u8>,
}

impl Task {
    /// Build a task from raw parts. The payload is not validated here.
    pub fn from_parts(kind: TaskKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn queue(&self) -> &'static str {
        self.kind.queue()
    }

    pub fn max_retry(&self) -> u32 {
        self.kind.max_retry()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload into the schema of this task's kind.
    pub fn decode(&self) -> Result<TaskPayload, TaskError> {
        let decode_err = |source| TaskError::PayloadDecode {
            kind: self.kind,
            source,
        };

        match self.kind {
            TaskKind::SendEmail => serde_json::from_slice(&self.payload)
                .map(TaskPayload::SendEmail)
                .map_err(decode_err),
            TaskKind::CheckSocialGroup => serde_json::from_slice(&self.payload)
                .map(TaskPayload::CheckSocialGroup)
                .map_err(decode_err),
        }
    }
}

/// Build an `email:send` task.
pub fn new_send_email_task(email: &str, verification_code: &str) -> Result<Task, TaskError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(TaskError::MissingField("email"));
    }
    if verification_code.trim().is_empty() {
        return Err(TaskError::MissingField("verification_code"));
    }

    let payload = SendEmailPayload {
        email: email.to_string(),
        verification_code: verification_code.trim().to_string(),
    };
    let payload = serde_json::to_vec(&payload).map_err(TaskError::Serialization)?;

    Ok(Task::from_parts(TaskKind::SendEmail, payload))
}

/// Build a `social_group:check` task.
///
/// The requested groups are a set: duplicates are collapsed and the order is
/// normalized so identical requests produce identical payloads.
pub fn new_check_social_group_task(
    user_id: Uuid,
    snils: &str,
    groups: &[GroupType],
) -> Result<Task, TaskError> {
    if user_id.is_nil() {
        return Err(TaskError::MissingField("user_id"));
    }
    let snils = snils.trim();
    if snils.is_empty() {
        return Err(TaskError::MissingField("snils"));
    }
    if groups.is_empty() {
        return Err(TaskError::MissingField("groups"));
    }

    let groups: BTreeSet<GroupType> = groups.iter().copied().collect();
    let payload = CheckSocialGroupPayload {
        user_id,
        snils: snils.to_string(),
        groups: groups.into_iter().collect(),
    };
    let payload = serde_json::to_vec(&payload).map_err(TaskError::Serialization)?;

    Ok(Task::from_parts(TaskKind::CheckSocialGroup, payload))
}

// =============================================================================
// Broker Envelope
// =============================================================================

/// Envelope stored in the broker for every enqueued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: Uuid,
    /// Routing key; kept as a string so unknown kinds survive decoding
    pub kind: String,
    pub queue: String,
    /// JSON text of the payload
    pub payload: String,
    pub max_retry: u32,
    /// Number of failed attempts so far
    #[serde(default)]
    pub retried: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Wrap a task in a fresh envelope.
    pub fn new(task: &Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: task.name().to_string(),
            queue: task.queue().to_string(),
            payload: String::from_utf8_lossy(task.payload()).into_owned(),
            max_retry: task.max_retry(),
            retried: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Recover the task, or `None` if the routing key is not a known kind.
    pub fn task(&self) -> Option<Task> {
        TaskKind::from_name(&self.kind)
            .map(|kind| Task::from_parts(kind, self.payload.clone().into_bytes()))
    }
}

/// What the producer gets back after a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: Uuid,
    pub kind: TaskKind,
    pub queue: &'static str,
    pub max_retry: u32,
}
