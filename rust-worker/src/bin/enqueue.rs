//! Benefits Enqueue - puts a single task on the queues.
//!
//! Usage:
//!   benefits-enqueue send-email <email> [code]
//!   benefits-enqueue check-social-group <user_id> <snils> <group,group,...>
//!
//! Without an explicit code, `send-email` generates one and prints it.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use benefits::queue::{Enqueuer, RedisBroker};
use benefits::{
    new_send_email_task, request_email_verification, request_group_check, Config, GroupType,
    QueueClient,
};

const USAGE: &str = "usage:
  benefits-enqueue send-email <email> [code]
  benefits-enqueue check-social-group <user_id> <snils> <group,group,...>";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = Config::from_env();
    if config.uses_memory_broker() {
        bail!("REDIS_URL=memory:// has no shared queues; point it at Redis");
    }

    let broker = Arc::new(RedisBroker::new(config.redis_url.clone(), &config.key_prefix));
    let client = QueueClient::new(broker);

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["send-email", email] => {
            let code = request_email_verification(&client, email)
                .await
                .context("Failed to enqueue send-email task")?;
            println!("{}", code);
        }
        ["send-email", email, code] => {
            let task = new_send_email_task(email, code).context("Invalid send-email task")?;
            let info = client
                .enqueue(task)
                .await
                .context("Failed to enqueue send-email task")?;
            println!("{}", info.id);
        }
        ["check-social-group", user_id, snils, groups] => {
            let user_id: Uuid = user_id.parse().context("Invalid user id")?;
            let groups = parse_groups(groups)?;
            let info = request_group_check(&client, user_id, snils, &groups)
                .await
                .context("Failed to enqueue check-social-group task")?;
            println!("{}", info.id);
        }
        _ => bail!("{}", USAGE),
    }

    info!("enqueue_complete");
    Ok(())
}

fn parse_groups(raw: &str) -> Result<Vec<GroupType>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| GroupType::parse(name).with_context(|| format!("Unknown group `{}`", name)))
        .collect()
}
