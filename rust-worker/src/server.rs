//! Queue server: pulls tasks from the broker and runs them on a bounded pool.
//!
//! This module:
//! 1. Picks a weighted random queue order for every fetch
//! 2. Holds one semaphore permit per in-flight task (the pool size)
//! 3. Spawns each task with a timeout and a cancellation token
//! 4. Acks, reschedules or archives the task based on the processor result
//! 5. Forwards due retries back to their queues on a timer
//! 6. Reclaims tasks whose worker died holding them (expired leases)
//! 7. Drains in-flight tasks on shutdown

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::processor::{ProcessError, Router, TaskContext};
use crate::queue::{Broker, RetryPolicy, TaskMessage};

/// Grace period for cancelled tasks to report back after the drain timeout.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Time past the task timeout before a held task counts as abandoned.
const LEASE_GRACE: Duration = Duration::from_secs(30);

/// Runtime settings of the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub concurrency: usize,
    pub queues: Vec<(String, u32)>,
    pub task_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            queues: config.queue_weights.clone(),
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            retry: config.retry_policy(),
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|(queue, _)| queue.clone()).collect()
    }

    /// Lease deadline for a task fetched now.
    ///
    /// An attempt is settled within `task_timeout`, so only a dead worker
    /// lets the lease run out.
    pub fn lease_until(&self) -> DateTime<Utc> {
        let lease = self.task_timeout + LEASE_GRACE;
        Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::days(1))
    }
}

/// What happened to a task after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Done; removed from the broker.
    Ack,
    /// Failed; scheduled again after the delay.
    Retry(Duration),
    /// Failed for good; moved to the dead list.
    Archive,
}

/// Decide the fate of a task from the result of its attempt.
///
/// `max_retry` is the total number of attempts: the attempt that brings the
/// failure count to `max_retry` archives the task.
pub fn decide(
    message: &TaskMessage,
    result: &Result<(), ProcessError>,
    policy: &RetryPolicy,
) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(e) if !e.is_retryable() => Disposition::Archive,
        Err(_) if message.retried.saturating_add(1) >= message.max_retry => Disposition::Archive,
        Err(_) => Disposition::Retry(policy.next_delay(message.retried)),
    }
}

/// Weighted random queue order for one fetch.
///
/// Each queue takes `weight` slots; the slots are shuffled and the first
/// occurrence of each queue fixes its position.
pub fn queue_order<R: Rng + ?Sized>(weights: &[(String, u32)], rng: &mut R) -> Vec<String> {
    let mut slots: Vec<&str> = weights
        .iter()
        .flat_map(|(queue, weight)| std::iter::repeat(queue.as_str()).take(*weight as usize))
        .collect();
    slots.shuffle(rng);

    let mut order: Vec<String> = Vec::with_capacity(weights.len());
    for queue in slots {
        if !order.iter().any(|known| known == queue) {
            order.push(queue.to_string());
        }
    }
    order
}

/// The dispatcher. Cheap to clone; clones share broker, router and config.
#[derive(Clone)]
pub struct Server {
    broker: Arc<dyn Broker>,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(broker: Arc<dyn Broker>, router: Router, config: ServerConfig) -> Self {
        Self {
            broker,
            router: Arc::new(router),
            config: Arc::new(config),
        }
    }

    /// Run until `shutdown` fires, then drain in-flight tasks.
    pub async fn run(&self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let abort = CancellationToken::new();

        let forwarder = tokio::spawn(forward_scheduled_loop(
            Arc::clone(&self.broker),
            self.config.queue_names(),
            self.config.poll_interval,
            shutdown.clone(),
        ));

        info!(
            concurrency = concurrency,
            queues = ?self.config.queues,
            task_timeout_ms = self.config.task_timeout.as_millis() as u64,
            "server_ready"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let order = queue_order(&self.config.queues, &mut rand::thread_rng());

            match self.broker.dequeue(&order, self.config.lease_until()).await {
                Ok(Some(message)) => {
                    let server = self.clone();
                    let abort = abort.clone();
                    tokio::spawn(async move {
                        server.execute(message, &abort).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "broker_dequeue_failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        info!("server_stopping");

        let all_permits = concurrency as u32;
        if timeout(
            self.config.shutdown_timeout,
            semaphore.acquire_many(all_permits),
        )
        .await
        .is_err()
        {
            warn!(
                in_flight = concurrency - semaphore.available_permits(),
                "server_drain_timeout"
            );
            // Cancelled attempts fail and get rescheduled
            abort.cancel();
            let _ = timeout(ABORT_GRACE, semaphore.acquire_many(all_permits)).await;
        }

        if let Err(e) = forwarder.await {
            error!(error = %e, "forwarder_join_failed");
        }

        info!("server_shutdown_complete");
    }

    /// Fetch one task and run it inline. Returns `None` when every queue is empty.
    pub async fn process_next(&self, abort: &CancellationToken) -> Option<Disposition> {
        let order = queue_order(&self.config.queues, &mut rand::thread_rng());
        match self.broker.dequeue(&order, self.config.lease_until()).await {
            Ok(Some(message)) => Some(self.execute(message, abort).await),
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "broker_dequeue_failed");
                None
            }
        }
    }

    /// Run one attempt of `message` and settle it with the broker.
    async fn execute(&self, message: TaskMessage, abort: &CancellationToken) -> Disposition {
        let Some(task) = message.task() else {
            error!(
                task_id = %message.id,
                task = %message.kind,
                queue = %message.queue,
                "task_processor_missing"
            );
            let reason = format!("no processor registered for task kind `{}`", message.kind);
            if let Err(e) = self.broker.archive(&message, &reason).await {
                error!(task_id = %message.id, error = %e, "broker_archive_failed");
            }
            return Disposition::Archive;
        };

        let cancel = abort.child_token();
        let ctx = TaskContext::new(message.id, message.retried, message.max_retry, cancel);
        let attempt = message.retried + 1;

        info!(
            task_id = %message.id,
            task = %task.kind(),
            queue = %message.queue,
            attempt = attempt,
            max_retry = message.max_retry,
            "task_started"
        );

        let processor = self.router.processor(task.kind());
        let attempt_future = AssertUnwindSafe(processor.process(&ctx, &task)).catch_unwind();

        let result = match timeout(self.config.task_timeout, attempt_future).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ProcessError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(ProcessError::Timeout(self.config.task_timeout)),
        };

        let disposition = decide(&message, &result, &self.config.retry);

        let settled = match (&disposition, &result) {
            (Disposition::Ack, _) => {
                info!(task_id = %message.id, task = %task.kind(), "task_completed");
                self.broker.ack(&message).await
            }
            (Disposition::Retry(delay), Err(e)) => {
                warn!(
                    task_id = %message.id,
                    task = %task.kind(),
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "task_failed_will_retry"
                );
                let process_at = Utc::now()
                    + chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::zero());
                self.broker.retry(&message, process_at, &e.to_string()).await
            }
            (_, Err(e)) => {
                error!(
                    task_id = %message.id,
                    task = %task.kind(),
                    attempt = attempt,
                    retryable = e.is_retryable(),
                    error = %e,
                    "task_archived"
                );
                self.broker.archive(&message, &e.to_string()).await
            }
            (_, Ok(())) => Ok(()),
        };

        if let Err(e) = settled {
            error!(task_id = %message.id, error = %e, "broker_settle_failed");
        }

        disposition
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Every `interval` until shutdown: move due retries back to pending and
/// reclaim tasks with expired leases.
async fn forward_scheduled_loop(
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match broker.forward_scheduled(&queues, Utc::now()).await {
                    Ok(0) => {}
                    Ok(forwarded) => info!(forwarded = forwarded, "scheduled_tasks_forwarded"),
                    Err(e) => error!(error = %e, "scheduled_forward_failed"),
                }
                match broker.recover_expired(&queues, Utc::now()).await {
                    Ok(0) => {}
                    Ok(recovered) => warn!(recovered = recovered, "expired_leases_recovered"),
                    Err(e) => error!(error = %e, "lease_recovery_failed"),
                }
            }
        }
    }
}
