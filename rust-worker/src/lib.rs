//! Benefits task worker.
//!
//! Background side of the social-benefits platform. This library provides the
//! shared modules for the two binaries:
//! - `benefits-worker`: queue server running the e-mail and social-group processors
//! - `benefits-enqueue`: operator tool that puts single tasks on the queues
//!
//! ## Architecture
//!
//! ```text
//! Producer → QueueClient → Redis (send-email, check-social-group) → Server → Processor
//!                                                                            ├─ EmailSender
//!                                                                            └─ Verification service → UserRepository
//! ```

pub mod config;
pub mod email;
pub mod processor;
pub mod producers;
pub mod queue;
pub mod server;
pub mod users;
pub mod verification;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use producers::{request_email_verification, request_group_check, ProducerError};
pub use queue::{
    new_check_social_group_task, new_send_email_task, Enqueuer, QueueClient, Task, TaskInfo,
    TaskKind, CHECK_SOCIAL_GROUP_QUEUE, SEND_EMAIL_QUEUE,
};
pub use server::{Server, ServerConfig};
pub use users::{GroupType, MembershipStatus, User, UserGroupMembership};
