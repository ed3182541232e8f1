//! `email:send` processor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{ProcessError, Processor, TaskContext};
use crate::email::{verification_email, EmailSender};
use crate::queue::{Task, TaskPayload};

/// Sends the registration verification code.
///
/// Re-sending on retry is harmless: the user just receives the same code twice.
pub struct SendEmailProcessor {
    sender: Arc<dyn EmailSender>,
}

impl SendEmailProcessor {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Processor for SendEmailProcessor {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> Result<(), ProcessError> {
        let payload = match task.decode()? {
            TaskPayload::SendEmail(payload) => payload,
            _ => return Err(ProcessError::Misrouted { kind: task.kind() }),
        };

        let (subject, body) = verification_email(&payload.verification_code);
        ctx.run(self.sender.send(&payload.email, &subject, &body))
            .await?;

        info!(
            task_id = %ctx.task_id,
            to = %payload.email,
            attempt = ctx.retried + 1,
            "verification_email_sent"
        );

        Ok(())
    }
}
