//! Benefits Worker - async Redis-backed queue server.
//!
//! Consumes the `send-email` and `check-social-group` queues, sending
//! verification e-mails and checking users' social-group eligibility with
//! the external verification service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use benefits::email::{EmailSender, LogEmailSender, MailgunSender};
use benefits::processor::{CheckSocialGroupProcessor, Router, SendEmailProcessor};
use benefits::queue::{install_default, Broker, MemoryBroker, QueueClient, RedisBroker};
use benefits::users::RedisUserRepository;
use benefits::verification::{HttpVerificationClient, SocialGroupVerifier};
use benefits::{Config, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        memory_broker = config.uses_memory_broker(),
        concurrency = config.worker_concurrency,
        queues = ?config.queue_weights,
        mailgun_configured = config.mailgun_api_key.is_some() && config.mailgun_domain.is_some(),
        "config_loaded"
    );

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let broker: Arc<dyn Broker> = if config.uses_memory_broker() {
        warn!("memory_broker_in_use");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(RedisBroker::new(config.redis_url.clone(), &config.key_prefix))
    };

    // Same broker for producers running inside this process
    install_default(Arc::new(QueueClient::new(Arc::clone(&broker))));

    let user_store_url = config
        .user_store_url()
        .context("USER_STORE_URL must be set when REDIS_URL=memory://")?;
    let users = RedisUserRepository::connect(user_store_url, &config.key_prefix)
        .await
        .context("Failed to connect to the user store")?;

    let request_timeout = Duration::from_millis(config.request_timeout_ms);
    let http = Client::builder()
        .timeout(request_timeout)
        .build()
        .context("Failed to build HTTP client")?;

    let verification = HttpVerificationClient::new(
        http.clone(),
        &config.verification_service_url,
        request_timeout,
    )
    .context("Invalid VERIFICATION_SERVICE_URL")?;

    let email: Arc<dyn EmailSender> =
        match (config.mailgun_api_key.clone(), config.mailgun_domain.clone()) {
            (Some(api_key), Some(domain)) => Arc::new(MailgunSender::new(
                http,
                &config.mailgun_api_base,
                api_key,
                domain,
                config.email_from.clone(),
                request_timeout,
            )),
            _ => {
                warn!("mailgun_not_configured");
                Arc::new(LogEmailSender)
            }
        };

    let verifier = SocialGroupVerifier::new(Arc::new(users), Arc::new(verification));
    let router = Router::new(
        Arc::new(SendEmailProcessor::new(email)),
        Arc::new(CheckSocialGroupProcessor::new(verifier)),
    );

    let server = Server::new(broker, router, ServerConfig::from_config(&config));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    server.run(shutdown).await;

    info!("worker_shutdown_complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
