//! Producer-side helpers used by the request handlers of the platform.

use rand::Rng;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::queue::{
    new_check_social_group_task, new_send_email_task, EnqueueError, Enqueuer, TaskError, TaskInfo,
};
use crate::users::GroupType;

/// Length of the e-mail verification code.
pub const VERIFICATION_CODE_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Random numeric code, zero-padded to [`VERIFICATION_CODE_LEN`] digits.
pub fn generate_verification_code() -> String {
    let code: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:0width$}", code, width = VERIFICATION_CODE_LEN)
}

/// Queue a verification e-mail and return the code that was sent.
///
/// The caller stores the code; the task only carries it to the mailer.
pub async fn request_email_verification(
    enqueuer: &dyn Enqueuer,
    email: &str,
) -> Result<String, ProducerError> {
    let code = generate_verification_code();
    let task = new_send_email_task(email, &code)?;
    let info = enqueuer.enqueue(task).await?;

    info!(task_id = %info.id, "email_verification_requested");

    Ok(code)
}

/// Queue a social-group check for the user.
pub async fn request_group_check(
    enqueuer: &dyn Enqueuer,
    user_id: Uuid,
    snils: &str,
    groups: &[GroupType],
) -> Result<TaskInfo, ProducerError> {
    let task = new_check_social_group_task(user_id, snils, groups)?;
    let info = enqueuer.enqueue(task).await?;

    info!(
        task_id = %info.id,
        user_id = %user_id,
        groups = groups.len(),
        "group_check_requested"
    );

    Ok(info)
}
