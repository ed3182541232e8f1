//! `social_group:check` processor.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::locks::KeyedLocks;
use super::{ProcessError, Processor, TaskContext};
use crate::queue::{Task, TaskPayload};
use crate::verification::SocialGroupVerifier;

/// Runs the social-group verification workflow for one request.
///
/// Checks for the same user are serialized inside this process because the
/// workflow replaces the user's whole membership list. Two worker processes
/// can still interleave on one user.
pub struct CheckSocialGroupProcessor {
    verifier: SocialGroupVerifier,
    user_locks: KeyedLocks<Uuid>,
}

impl CheckSocialGroupProcessor {
    pub fn new(verifier: SocialGroupVerifier) -> Self {
        Self {
            verifier,
            user_locks: KeyedLocks::new(),
        }
    }
}

#[async_trait]
impl Processor for CheckSocialGroupProcessor {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> Result<(), ProcessError> {
        let payload = match task.decode()? {
            TaskPayload::CheckSocialGroup(payload) => payload,
            _ => return Err(ProcessError::Misrouted { kind: task.kind() }),
        };

        let _user_guard = ctx
            .run(async {
                Ok::<_, ProcessError>(self.user_locks.lock(payload.user_id).await)
            })
            .await?;

        let report = ctx
            .run(
                self.verifier
                    .verify(payload.user_id, &payload.snils, &payload.groups),
            )
            .await?;

        info!(
            task_id = %ctx.task_id,
            user_id = %report.user_id,
            requested = ?payload.groups,
            changed = ?report.changed,
            "social_group_task_complete"
        );

        Ok(())
    }
}
