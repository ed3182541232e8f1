//! Outbound e-mail.
//!
//! The worker only sends verification codes. `MailgunSender` talks to the
//! Mailgun messages API; `LogEmailSender` stands in when Mailgun is not
//! configured and just logs what would have been sent.

pub mod mailgun;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

pub use mailgun::MailgunSender;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("email provider returned status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError>;
}

/// Subject and body of the registration verification e-mail.
pub fn verification_email(code: &str) -> (String, String) {
    let subject = "Email verification code".to_string();
    let body = format!(
        "Your verification code: {}\n\n\
         Enter it on the registration page to confirm your email address.\n\
         If you did not request this code, ignore this message.",
        code
    );
    (subject, body)
}

/// Sender that only logs. Used when no provider is configured.
#[derive(Debug, Default, Clone)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        info!(
            to = %to,
            subject = %subject,
            body_length = body.len(),
            "email_send_skipped_no_provider"
        );
        Ok(())
    }
}
