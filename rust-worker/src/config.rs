//! Configuration module for environment variable parsing.
//!
//! Reads all configuration from environment variables with defaults suitable
//! for a local Redis and a local verification service.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::queue::{RetryPolicy, CHECK_SOCIAL_GROUP_QUEUE, SEND_EMAIL_QUEUE};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL, or `memory://` for the in-process broker
    pub redis_url: String,

    /// Redis URL of the user store; falls back to `redis_url`
    pub user_store_url: Option<String>,

    /// Prefix for every Redis key the worker owns
    pub key_prefix: String,

    /// Number of tasks processed in parallel
    pub worker_concurrency: usize,

    /// Queues to consume with their relative weights
    pub queue_weights: Vec<(String, u32)>,

    /// Upper bound for one processing attempt
    pub task_timeout_ms: u64,

    /// Idle wait between empty fetches, also the retry forwarding period
    pub poll_interval_ms: u64,

    /// Backoff after the first failed attempt
    pub retry_base_delay_ms: u64,

    /// Cap for any single backoff
    pub retry_max_delay_ms: u64,

    /// How long shutdown waits for in-flight tasks
    pub shutdown_timeout_ms: u64,

    // =========================================================================
    // External Services
    // =========================================================================

    /// Base URL of the social-group verification service
    pub verification_service_url: String,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Mailgun API key; without it e-mails are only logged
    pub mailgun_api_key: Option<String>,

    /// Mailgun sending domain
    pub mailgun_domain: Option<String>,

    /// Mailgun API base URL (EU accounts use api.eu.mailgun.net)
    pub mailgun_api_base: String,

    /// From header of outgoing e-mail
    pub email_from: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string()),

            user_store_url: parse_optional("USER_STORE_URL"),

            key_prefix: env::var("KEY_PREFIX").unwrap_or_else(|_| "benefits".to_string()),

            worker_concurrency: parse_number("WORKER_CONCURRENCY", 10).max(1),

            queue_weights: parse_weights("QUEUE_WEIGHTS", default_queue_weights()),

            task_timeout_ms: parse_number("TASK_TIMEOUT_MS", 60_000),

            poll_interval_ms: parse_number("POLL_INTERVAL_MS", 1_000),

            retry_base_delay_ms: parse_number("RETRY_BASE_DELAY_MS", 2_000),

            retry_max_delay_ms: parse_number("RETRY_MAX_DELAY_MS", 600_000),

            shutdown_timeout_ms: parse_number("SHUTDOWN_TIMEOUT_MS", 10_000),

            verification_service_url: env::var("VERIFICATION_SERVICE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8081".to_string()),

            request_timeout_ms: parse_number("REQUEST_TIMEOUT_MS", 8_000),

            mailgun_api_key: parse_optional("MAILGUN_API_KEY"),

            mailgun_domain: parse_optional("MAILGUN_DOMAIN"),

            mailgun_api_base: env::var("MAILGUN_API_BASE")
                .unwrap_or_else(|_| "https://api.mailgun.net".to_string()),

            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Benefits <noreply@localhost>".to_string()),
        }
    }

    pub fn uses_memory_broker(&self) -> bool {
        self.redis_url.starts_with("memory://")
    }

    /// Where users live. The in-process broker has no user store of its own.
    pub fn user_store_url(&self) -> Option<&str> {
        match &self.user_store_url {
            Some(url) => Some(url.as_str()),
            None if self.uses_memory_broker() => None,
            None => Some(self.redis_url.as_str()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}

/// Every queue the worker knows, weighted equally.
pub fn default_queue_weights() -> Vec<(String, u32)> {
    vec![
        (SEND_EMAIL_QUEUE.to_string(), 1),
        (CHECK_SOCIAL_GROUP_QUEUE.to_string(), 1),
    ]
}

fn parse_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(env_var = name, value = %raw, "Invalid number, using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a comma-separated weight list like "send-email:3,check-social-group:1".
fn parse_weights(name: &str, default: Vec<(String, u32)>) -> Vec<(String, u32)> {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    let parsed = parse_weight_list(&raw);
    if parsed.is_empty() {
        warn!(env_var = name, value = %raw, "Invalid queue weights, using default");
        return default;
    }
    parsed
}

fn parse_weight_list(raw: &str) -> Vec<(String, u32)> {
    let mut weights: Vec<(String, u32)> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((queue, weight)) = entry.split_once(':') else {
            warn!(entry = %entry, "Queue weight entry without ':', skipping");
            continue;
        };
        let queue = queue.trim();
        match weight.trim().parse::<u32>() {
            Ok(weight) if weight > 0 && !queue.is_empty() => {
                if weights.iter().any(|(known, _)| known == queue) {
                    warn!(queue = %queue, "Duplicate queue weight, keeping first");
                } else {
                    weights.push((queue.to_string(), weight));
                }
            }
            _ => warn!(entry = %entry, "Invalid queue weight, skipping"),
        }
    }

    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weight_list_valid() {
        assert_eq!(
            parse_weight_list("send-email:3, check-social-group:1"),
            vec![
                ("send-email".to_string(), 3),
                ("check-social-group".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_parse_weight_list_skips_bad_entries() {
        assert_eq!(
            parse_weight_list("send-email:0,broken,:4,check-social-group:x,send-email:2,send-email:5"),
            vec![("send-email".to_string(), 2)]
        );
    }

    #[test]
    fn test_parse_weights_default() {
        let result = parse_weights("NONEXISTENT_WEIGHTS_VAR", default_queue_weights());
        assert_eq!(result, default_queue_weights());
    }

    #[test]
    fn test_parse_weights_invalid_falls_back() {
        env::set_var("TEST_QUEUE_WEIGHTS_INVALID", "nonsense");
        let result = parse_weights("TEST_QUEUE_WEIGHTS_INVALID", default_queue_weights());
        assert_eq!(result, default_queue_weights());
        env::remove_var("TEST_QUEUE_WEIGHTS_INVALID");
    }

    #[test]
    fn test_parse_number() {
        env::set_var("TEST_NUMBER_VALID", " 250 ");
        assert_eq!(parse_number("TEST_NUMBER_VALID", 10u64), 250);
        env::remove_var("TEST_NUMBER_VALID");

        env::set_var("TEST_NUMBER_INVALID", "many");
        assert_eq!(parse_number("TEST_NUMBER_INVALID", 10u64), 10);
        env::remove_var("TEST_NUMBER_INVALID");
    }

    #[test]
    fn test_parse_optional_ignores_blank() {
        env::set_var("TEST_OPTIONAL_BLANK", "   ");
        assert_eq!(parse_optional("TEST_OPTIONAL_BLANK"), None);
        env::remove_var("TEST_OPTIONAL_BLANK");
    }

    #[test]
    fn test_memory_broker_detection() {
        let mut config = Config::from_env();
        config.redis_url = "memory://".to_string();
        assert!(config.uses_memory_broker());
        config.redis_url = "redis://localhost".to_string();
        assert!(!config.uses_memory_broker());
    }

    #[test]
    fn test_user_store_url_fallback() {
        let mut config = Config::from_env();
        config.user_store_url = None;
        config.redis_url = "redis://queue:6379/0".to_string();
        assert_eq!(config.user_store_url(), Some("redis://queue:6379/0"));

        config.redis_url = "memory://".to_string();
        assert_eq!(config.user_store_url(), None);

        config.user_store_url = Some("redis://users:6379/1".to_string());
        assert_eq!(config.user_store_url(), Some("redis://users:6379/1"));
    }
}
