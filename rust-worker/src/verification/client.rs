//! Client for the external social-group verification service.
//!
//! `POST {base}/check` with `{snils, groups}` answers
//! `{snils, results: [{group, status}]}`. Any non-2xx answer is a call failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::users::GroupType;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("verification service returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Request body of `POST /check`.
#[derive(Debug, Serialize)]
pub struct CheckRequest<'a> {
    pub snils: &'a str,
    pub groups: &'a [GroupType],
}

/// Response body of `POST /check`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckResponse {
    #[serde(default)]
    pub snils: String,
    /// Entries for groups this worker does not know are dropped.
    #[serde(default, deserialize_with = "known_group_results")]
    pub results: Vec<GroupCheckResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupCheckResult {
    pub group: GroupType,
    pub status: CheckStatus,
}

#[derive(Deserialize)]
struct WireGroupResult {
    group: String,
    status: CheckStatus,
}

fn known_group_results<'de, D>(deserializer: D) -> Result<Vec<GroupCheckResult>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<WireGroupResult>::deserialize(deserializer)?;

    Ok(raw
        .into_iter()
        .filter_map(|result| match GroupType::parse(&result.group) {
            Some(group) => Some(GroupCheckResult {
                group,
                status: result.status,
            }),
            None => {
                warn!(group = %result.group, "verification_unknown_group_skipped");
                None
            }
        })
        .collect())
}

/// Per-group answer. Anything other than `confirmed` counts as a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Confirmed,
    #[serde(other)]
    Rejected,
}

#[async_trait]
pub trait VerificationService: Send + Sync {
    async fn check(
        &self,
        snils: &str,
        groups: &[GroupType],
    ) -> Result<CheckResponse, VerificationError>;
}

/// HTTP implementation over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpVerificationClient {
    client: Client,
    check_url: Url,
    timeout: Duration,
}

impl HttpVerificationClient {
    pub fn new(client: Client, base_url: &str, timeout: Duration) -> Result<Self, url::ParseError> {
        // Without a trailing slash `join` would replace the last path segment
        let base = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{}/", base_url))?
        };

        Ok(Self {
            client,
            check_url: base.join("check")?,
            timeout,
        })
    }

    pub fn check_url(&self) -> &Url {
        &self.check_url
    }
}

#[async_trait]
impl VerificationService for HttpVerificationClient {
    async fn check(
        &self,
        snils: &str,
        groups: &[GroupType],
    ) -> Result<CheckResponse, VerificationError> {
        info!(
            url = %self.check_url,
            groups = groups.len(),
            "verification_check_starting"
        );

        let response = self
            .client
            .post(self.check_url.clone())
            .json(&CheckRequest { snils, groups })
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status_code = status.as_u16(), "verification_check_bad_status");
            return Err(VerificationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: CheckResponse = response.json().await?;

        info!(
            status_code = status.as_u16(),
            results = body.results.len(),
            "verification_check_complete"
        );

        Ok(body)
    }
}
