//! Task queue: task definitions, broker backends and the producer client.
//!
//! ## Architecture
//!
//! ```text
//! Producer → QueueClient → Broker (pending) → Server → Processor → ack / retry / archive
//! ```

pub mod broker;
pub mod client;
pub mod memory;
pub mod redis_broker;
pub mod retry;
pub mod types;

pub use broker::{Broker, BrokerError};
pub use client::{
    default_client, enqueue_default, install_default, override_default, DefaultClientGuard,
    EnqueueError, Enqueuer, QueueClient,
};
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;
pub use retry::RetryPolicy;
pub use types::{
    new_check_social_group_task, new_send_email_task, CheckSocialGroupPayload, SendEmailPayload,
    Task, TaskError, TaskInfo, TaskKind, TaskMessage, TaskPayload, CHECK_SOCIAL_GROUP_QUEUE,
    SEND_EMAIL_QUEUE,
};
