//! Mailgun messages API sender.
//!
//! Reference: https://documentation.mailgun.com/docs/mailgun/api-reference/openapi-final/tag/Messages/

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, info};

use super::{EmailError, EmailSender};

/// Sends mail through `POST {api_base}/v3/{domain}/messages`.
#[derive(Clone)]
pub struct MailgunSender {
    client: Client,
    api_base: String,
    api_key: String,
    domain: String,
    from: String,
    timeout: Duration,
}

impl MailgunSender {
    pub fn new(
        client: Client,
        api_base: &str,
        api_key: String,
        domain: String,
        from: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            domain,
            from,
            timeout,
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v3/{}/messages", self.api_base, self.domain)
    }
}

#[async_trait]
impl EmailSender for MailgunSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        let form = [
            ("from", self.from.as_str()),
            ("to", to),
            ("subject", subject),
            ("text", body),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                to = %to,
                status_code = status.as_u16(),
                "mailgun_send_rejected"
            );
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        info!(to = %to, status_code = status.as_u16(), "mailgun_send_complete");
        Ok(())
    }
}
